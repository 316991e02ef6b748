use thiserror::Error;

/// Errors surfaced by the sync pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed webhook input. Rejected with no side effects.
    #[error("invalid notification: {0}")]
    Validation(String),

    /// The translation backend failed after exhausting its retry budget.
    /// The orchestrator contains this per locale as a degraded row, so it
    /// never fails a whole request.
    #[error("translation provider failed: {0}")]
    Provider(#[source] anyhow::Error),

    /// A storage write could not complete. Always fails the whole request.
    #[error("persistence failed: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SyncError::Validation(msg.into())
    }
}
