//! Controller manager: watch, queue and worker pool.
//!
//! The manager subscribes to store events, maps them to deployment keys and
//! feeds a [`WorkQueue`]. A fixed pool of workers drains the queue through
//! the [`Reconciler`]. Keys are processed one at a time per key; distinct
//! deployments run in parallel.

use std::time::Duration;

use chartfleet_state::{ChartDeployment, ResourceStore, Selector, WatchEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ControllerResult;
use crate::mapper;
use crate::queue::WorkQueue;
use crate::reconciler::{ReconcileAction, Reconciler};

/// Tunables of the controller loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Concurrent reconcile workers.
    pub workers: usize,
    /// Delay before a pass that asked to be requeued runs again.
    pub requeue_after: Duration,
    /// First retry delay after a failed pass.
    pub backoff_base: Duration,
    /// Upper bound of the retry delay.
    pub backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            requeue_after: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// Runs the chart deployment controller against a store.
pub struct Manager<S> {
    reconciler: Reconciler<S>,
    config: ControllerConfig,
    queue: WorkQueue,
}

impl<S: ResourceStore> Manager<S> {
    pub fn new(store: S, config: ControllerConfig) -> Self {
        let queue = WorkQueue::new(config.backoff_base, config.backoff_max);
        Self {
            reconciler: Reconciler::new(store),
            config,
            queue,
        }
    }

    /// Handle to the manager's queue.
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Run until `shutdown` flips.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> ControllerResult<()> {
        let store = self.reconciler.store().clone();
        // Subscribe before the initial listing so nothing falls in between.
        let events = store.subscribe();
        enqueue_all(&store, &self.queue).await?;

        info!(workers = self.config.workers, "controller started");

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.config.workers + 1);
        handles.push(tokio::spawn(watch_events(
            store,
            self.queue.clone(),
            events,
            shutdown.clone(),
        )));
        for id in 0..self.config.workers.max(1) {
            handles.push(tokio::spawn(worker(
                id,
                self.reconciler.clone(),
                self.queue.clone(),
                self.config.requeue_after,
                shutdown.clone(),
            )));
        }

        let mut shutdown = shutdown;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!("controller shutting down");
        self.queue.shutdown();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

async fn enqueue_all<S: ResourceStore>(store: &S, queue: &WorkQueue) -> ControllerResult<()> {
    let deployments: Vec<ChartDeployment> = store.list(None, &Selector::everything()).await?;
    debug!(count = deployments.len(), "enqueueing all deployments");
    for deployment in deployments {
        queue.add(deployment.metadata.key());
    }
    Ok(())
}

async fn watch_events<S: ResourceStore>(
    store: S,
    queue: WorkQueue,
    mut events: broadcast::Receiver<WatchEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => match mapper::deployments_for_event(&store, &event).await {
                    Ok(keys) => {
                        for key in keys {
                            queue.add(key);
                        }
                    }
                    Err(e) => warn!(key = %event.key, kind = event.kind, error = %e, "event mapping failed"),
                },
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "watch lagged; resyncing all deployments");
                    if let Err(e) = enqueue_all(&store, &queue).await {
                        warn!(error = %e, "resync failed");
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Resolves once the shutdown flag is set. A dropped sender is not a
/// shutdown: the queue still drains when `run` stops it.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let signalled = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}

async fn worker<S: ResourceStore>(
    id: usize,
    reconciler: Reconciler<S>,
    queue: WorkQueue,
    requeue_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let key = tokio::select! {
            key = queue.next() => key,
            () = shutdown_signalled(&mut shutdown) => break,
        };
        let Some(key) = key else {
            break;
        };

        // Shutdown drops the pass at its next store call.
        let result = tokio::select! {
            result = reconciler.reconcile(&key) => result,
            () = shutdown_signalled(&mut shutdown) => {
                queue.done(&key);
                break;
            }
        };
        match result {
            Ok(ReconcileAction::Done) => queue.forget(&key),
            Ok(ReconcileAction::Requeue) => {
                queue.forget(&key);
                queue.add_after(key.clone(), requeue_after);
            }
            Err(e) if e.is_conflict() => {
                debug!(worker = id, deployment = %key, error = %e, "conflict; retrying");
                queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                let delay = queue.add_rate_limited(key.clone());
                warn!(
                    worker = id,
                    deployment = %key,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "reconcile failed"
                );
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}
