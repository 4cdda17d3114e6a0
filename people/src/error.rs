use photoid_kv::KVError;
use thiserror::Error;

/// Errors returned by people operations.
#[derive(Debug, Error)]
pub enum PeopleError {
    #[error("people: storage error: {0}")]
    Storage(#[from] KVError),

    /// The referenced person or face was deleted or merged away concurrently.
    #[error("people: stale reference: {0} no longer exists")]
    StaleReference(String),

    #[error("people: degenerate vector: zero norm")]
    DegenerateVector,

    #[error("people: clustering failed: {0}")]
    Clustering(String),

    /// An optimistic precondition kept failing; nothing was written.
    #[error("people: concurrent update conflict on {0}")]
    Conflict(String),

    #[error("people: not found: {0}")]
    NotFound(String),

    #[error("people: invalid argument: {0}")]
    InvalidArgument(String),

    #[error("people: dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("people: serialization error: {0}")]
    Serialization(String),

    #[error("people: config error: {0}")]
    Config(String),

    #[error("people: cancelled after {completed} items")]
    Cancelled { completed: usize },
}

impl PeopleError {
    /// Reports whether the failed unit of work may be retried as a whole.
    pub fn is_transient(&self) -> bool {
        matches!(self, PeopleError::Storage(e) if e.is_transient())
    }

    /// Errors a batch caller should log and skip rather than abort on.
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            PeopleError::StaleReference(_)
                | PeopleError::Conflict(_)
                | PeopleError::DegenerateVector
        )
    }
}
