//! chartfleet-controller — staged chart rollouts across a cluster fleet.
//!
//! Reconciles every `ChartDeployment` into one `ClusterRelease` per selected
//! cluster. When the deployment carries a rollout policy, releases are
//! created or updated in batches that grow as earlier batches become ready.
//!
//! # Architecture
//!
//! ```text
//! Manager
//!   ├── watch task (store events → mapper → WorkQueue)
//!   └── workers ──► Reconciler
//!                     ├── selection   (clusters, owned releases)
//!                     ├── cleanup     (orphans, finalizer teardown)
//!                     ├── rollout     (batch metadata → RolloutPlanner)
//!                     │     └── release (values rendering, create/update)
//!                     ├── readiness   (ReleasesReady aggregation)
//!                     └── status      (Ready summary, owned-condition patch)
//! ```

pub mod cleanup;
pub mod error;
pub mod manager;
pub mod mapper;
pub mod queue;
pub mod readiness;
pub mod reconciler;
pub mod release;
pub mod rollout;
pub mod selection;
pub mod status;
pub mod values;

pub use error::{ControllerError, ControllerResult};
pub use manager::{ControllerConfig, Manager};
pub use queue::WorkQueue;
pub use reconciler::{ReconcileAction, Reconciler};
