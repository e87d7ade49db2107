//! StateStore: redb-backed resource persistence for chartfleet.
//!
//! Every [`Resource`] kind lives in its own table, JSON-serialized into
//! redb's `&[u8]` value columns under a `{namespace}/{name}` key. On top of
//! plain CRUD the store manages object metadata the way controllers expect:
//! per-object resource versions for optimistic concurrency, spec generations,
//! finalizer-gated deletion and a broadcast stream of change events.
//!
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::patch::{PatchOptions, three_way_merge};
use crate::selector::Selector;
use crate::tables::ALL_TABLES;
use crate::types::{Labels, ObjectKey, OwnerReference, Resource, epoch_secs};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Buffered watch events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// Change notification published after every committed write.
///
/// Carries enough of the object to route it without another read: for
/// deletions, the labels and owners are the last stored ones.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub kind: &'static str,
    pub event_type: EventType,
    pub key: ObjectKey,
    pub labels: Labels,
    pub owner_references: Vec<OwnerReference>,
    pub generation: i64,
}

impl WatchEvent {
    fn of<R: Resource>(event_type: EventType, obj: &R) -> Self {
        let meta = obj.metadata();
        Self {
            kind: R::KIND,
            event_type,
            key: meta.key(),
            labels: meta.labels.clone(),
            owner_references: meta.owner_references.clone(),
            generation: meta.generation,
        }
    }
}

/// Resource store used by the controller.
///
/// Reads always return the latest committed state. Writes are checked
/// against resource versions: `update` fails with [`StateError::Conflict`]
/// when the caller's copy is stale, `patch` only when a stale caller touches
/// a field someone else changed.
pub trait ResourceStore: Clone + Send + Sync + 'static {
    /// List objects, optionally restricted to one namespace, whose labels
    /// match `selector`. Results are ordered by `namespace/name`.
    fn list<R: Resource>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> impl Future<Output = StateResult<Vec<R>>> + Send;

    /// Fetch one object. Missing objects are [`StateError::NotFound`].
    fn get<R: Resource>(&self, key: &ObjectKey) -> impl Future<Output = StateResult<R>> + Send;

    /// Create a new object. Fails with [`StateError::AlreadyExists`].
    fn create<R: Resource>(&self, obj: &R) -> impl Future<Output = StateResult<R>> + Send;

    /// Replace an object's metadata and spec. Status is preserved.
    fn update<R: Resource>(&self, obj: &R) -> impl Future<Output = StateResult<R>> + Send;

    /// Apply the changes between `original` and `modified` onto the stored
    /// object. An empty difference is not written.
    fn patch<R: Resource>(
        &self,
        original: &R,
        modified: &R,
        options: &PatchOptions,
    ) -> impl Future<Output = StateResult<R>> + Send;

    /// Request deletion. Objects with finalizers are only marked deleting.
    fn delete<R: Resource>(&self, key: &ObjectKey) -> impl Future<Output = StateResult<()>> + Send;

    /// Subscribe to change events committed from now on.
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Outcome of a read-modify-write closure.
enum Mutation<R> {
    Put { obj: R, existed: bool },
    Remove(R),
    Keep,
}

/// Thread-safe resource store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<WatchEvent>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL_TABLES {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Reads ─────────────────────────────────────────────────────

    fn list_sync<R: Resource>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StateResult<Vec<R>> {
        let prefix = namespace.map(|ns| format!("{ns}/"));
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if prefix.as_deref().is_some_and(|p| !key.value().starts_with(p)) {
                continue;
            }
            let obj: R = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if selector.matches(&obj.metadata().labels) {
                results.push(obj);
            }
        }
        Ok(results)
    }

    fn get_sync<R: Resource>(&self, key: &ObjectKey) -> StateResult<R> {
        let table_key = key.to_string();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        match table.get(table_key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Err(not_found::<R>(key)),
        }
    }

    // ── Writes ────────────────────────────────────────────────────

    /// Run a read-modify-write of one object inside a single write
    /// transaction, then publish the resulting event.
    fn transact<R, T, F>(&self, key: &ObjectKey, f: F) -> StateResult<T>
    where
        R: Resource,
        F: FnOnce(Option<R>) -> StateResult<(Mutation<R>, T)>,
    {
        let table_key = key.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (event, out) = {
            let mut table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
            let current: Option<R> = match table.get(table_key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let (mutation, out) = f(current)?;
            let event = match mutation {
                Mutation::Put { obj, existed } => {
                    let value = serde_json::to_vec(&obj).map_err(map_err!(Serialize))?;
                    table
                        .insert(table_key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    let event_type = if existed {
                        EventType::Modified
                    } else {
                        EventType::Added
                    };
                    Some(WatchEvent::of(event_type, &obj))
                }
                Mutation::Remove(obj) => {
                    table.remove(table_key.as_str()).map_err(map_err!(Write))?;
                    Some(WatchEvent::of(EventType::Deleted, &obj))
                }
                Mutation::Keep => None,
            };
            (event, out)
        };
        txn.commit().map_err(map_err!(Transaction))?;

        if let Some(event) = event {
            debug!(kind = event.kind, key = %event.key, event = ?event.event_type, "object written");
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        Ok(out)
    }

    fn create_sync<R: Resource>(&self, obj: &R) -> StateResult<R> {
        let key = obj.key();
        self.transact(&key, |current: Option<R>| {
            if current.is_some() {
                return Err(StateError::AlreadyExists(format!("{} {key}", R::KIND)));
            }
            let mut obj = obj.clone();
            let meta = obj.metadata_mut();
            meta.generation = 1;
            meta.resource_version = 1;
            meta.creation_timestamp = epoch_secs();
            meta.deletion_timestamp = None;
            Ok((
                Mutation::Put {
                    obj: obj.clone(),
                    existed: false,
                },
                obj,
            ))
        })
    }

    fn update_sync<R: Resource>(&self, obj: &R) -> StateResult<R> {
        let key = obj.key();
        self.transact(&key, |current: Option<R>| {
            let current = current.ok_or_else(|| not_found::<R>(&key))?;
            let stored_version = current.metadata().resource_version;
            if obj.metadata().resource_version != stored_version {
                return Err(StateError::Conflict(format!(
                    "{} {key}: resource version {} is stale (stored {stored_version})",
                    R::KIND,
                    obj.metadata().resource_version
                )));
            }
            let mut next = obj.clone();
            next.copy_status_from(&current);
            Ok(commit_write(current, next))
        })
    }

    fn patch_sync<R: Resource>(
        &self,
        original: &R,
        modified: &R,
        options: &PatchOptions,
    ) -> StateResult<R> {
        let key = original.key();
        self.transact(&key, |current: Option<R>| {
            let current = current.ok_or_else(|| not_found::<R>(&key))?;
            let stale = original.metadata().resource_version != current.metadata().resource_version;

            let original_value = serde_json::to_value(original).map_err(map_err!(Serialize))?;
            let modified_value = serde_json::to_value(modified).map_err(map_err!(Serialize))?;
            let current_value = serde_json::to_value(&current).map_err(map_err!(Serialize))?;

            let merged = three_way_merge(
                &original_value,
                &modified_value,
                &current_value,
                stale,
                options,
            )
            .map_err(|e| match e {
                StateError::Conflict(msg) => StateError::Conflict(format!("{} {key}: {msg}", R::KIND)),
                other => other,
            })?;

            match merged {
                None => Ok((Mutation::Keep, current)),
                Some(value) => {
                    let next: R = serde_json::from_value(value).map_err(map_err!(Deserialize))?;
                    Ok(commit_write(current, next))
                }
            }
        })
    }

    fn delete_sync<R: Resource>(&self, key: &ObjectKey) -> StateResult<()> {
        self.transact(key, |current: Option<R>| {
            let mut current = current.ok_or_else(|| not_found::<R>(key))?;
            let meta = current.metadata_mut();
            if meta.finalizers.is_empty() {
                return Ok((Mutation::Remove(current), ()));
            }
            if meta.is_deleting() {
                return Ok((Mutation::Keep, ()));
            }
            meta.deletion_timestamp = Some(epoch_secs());
            meta.resource_version += 1;
            Ok((
                Mutation::Put {
                    obj: current,
                    existed: true,
                },
                (),
            ))
        })
    }
}

/// Finish a write of `next` over `current`: carry the store-managed metadata
/// forward, bump versions, and garbage-collect a deleting object whose last
/// finalizer is gone. Writes that change nothing are skipped.
fn commit_write<R: Resource>(current: R, mut next: R) -> (Mutation<R>, R) {
    let cur = current.metadata();
    let spec_changed = !next.same_spec(&current);
    {
        let meta = next.metadata_mut();
        meta.generation = cur.generation + i64::from(spec_changed);
        meta.resource_version = cur.resource_version;
        meta.creation_timestamp = cur.creation_timestamp;
        meta.deletion_timestamp = cur.deletion_timestamp;
    }
    if same_value(&next, &current) {
        return (Mutation::Keep, current);
    }
    next.metadata_mut().resource_version += 1;
    if next.metadata().is_deleting() && next.metadata().finalizers.is_empty() {
        return (Mutation::Remove(next.clone()), next);
    }
    (
        Mutation::Put {
            obj: next.clone(),
            existed: true,
        },
        next,
    )
}

fn same_value<R: Resource>(a: &R, b: &R) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn not_found<R: Resource>(key: &ObjectKey) -> StateError {
    StateError::NotFound(format!("{} {key}", R::KIND))
}

// Every call yields first so a cancelled pass stops at a call boundary.
impl ResourceStore for StateStore {
    async fn list<R: Resource>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StateResult<Vec<R>> {
        tokio::task::yield_now().await;
        self.list_sync(namespace, selector)
    }

    async fn get<R: Resource>(&self, key: &ObjectKey) -> StateResult<R> {
        tokio::task::yield_now().await;
        self.get_sync(key)
    }

    async fn create<R: Resource>(&self, obj: &R) -> StateResult<R> {
        tokio::task::yield_now().await;
        self.create_sync(obj)
    }

    async fn update<R: Resource>(&self, obj: &R) -> StateResult<R> {
        tokio::task::yield_now().await;
        self.update_sync(obj)
    }

    async fn patch<R: Resource>(
        &self,
        original: &R,
        modified: &R,
        options: &PatchOptions,
    ) -> StateResult<R> {
        tokio::task::yield_now().await;
        self.patch_sync(original, modified, options)
    }

    async fn delete<R: Resource>(&self, key: &ObjectKey) -> StateResult<()> {
        tokio::task::yield_now().await;
        self.delete_sync::<R>(key)
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
