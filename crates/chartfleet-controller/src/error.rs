//! Controller error types.

use chartfleet_rollout::RolloutError;
use chartfleet_state::StateError;
use thiserror::Error;

/// Errors that can end a reconcile pass.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("rollout error: {0}")]
    Rollout(#[from] RolloutError),

    #[error("values template error for cluster {cluster}: {reason}")]
    ValuesTemplate { cluster: String, reason: String },
}

impl ControllerError {
    /// True when the pass lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::State(e) if e.is_conflict())
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
