use thiserror::Error;

/// Error taxonomy shared by every crate in the workspace.
///
/// `InvalidInput` is the caller's fault and never retried. `Unavailable` and
/// `Timeout` are transient and safe to retry with backoff. `Inconsistent`
/// means an internal invariant was violated; the affected symbol's work is
/// aborted rather than silently corrected.
#[derive(Error, Debug)]
pub enum DrummondError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl DrummondError {
    /// Whether a bounded retry with backoff is appropriate.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DrummondError::Unavailable(_) | DrummondError::Timeout(_)
        )
    }
}
