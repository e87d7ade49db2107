//! chartfleet-state — embedded resource store for chartfleet.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for clusters, chart deployments and cluster releases, together
//! with the primitives controllers build on: label selectors, tri-state
//! conditions, finalizers, field-owned patches and change events.
//!
//! # Architecture
//!
//! All resource types are JSON-serialized into redb's `&[u8]` value columns
//! under `{namespace}/{name}` keys, so listing a namespace is a prefix scan.
//!
//! The [`StateStore`] is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Controllers depend on the
//! [`ResourceStore`] trait rather than the concrete store.

pub mod conditions;
pub mod error;
pub mod patch;
pub mod selector;
pub mod store;
pub mod tables;
pub mod types;

pub use conditions::{Condition, ConditionStatus, Conditioned, READY, Severity};
pub use error::{StateError, StateResult};
pub use patch::PatchOptions;
pub use selector::{LabelSelector, LabelSelectorRequirement, Selector};
pub use store::{EventType, ResourceStore, StateStore, WatchEvent};
pub use types::*;
