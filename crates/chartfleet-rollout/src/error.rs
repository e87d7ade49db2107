//! Error types for rollout planning.

use thiserror::Error;

/// Result type alias for rollout operations.
pub type RolloutResult<T> = Result<T, RolloutError>;

/// Errors that can occur while planning a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RolloutError {
    /// A step value is neither an integer nor a `"<p>%"` percentage.
    #[error("invalid {field} {value:?}: {reason}")]
    InvalidStep {
        field: &'static str,
        value: String,
        reason: String,
    },
}
