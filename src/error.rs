use thiserror::Error;

/// Failure of the backing store shared by the outbox, idempotency and
/// rate-limit tables.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The backend cannot be reached. Never retried internally.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The addressed record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),
    /// A stored value could not be encoded or decoded.
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
    /// A compare-and-swap loop lost too many races in a row.
    #[error("write contention on {0}")]
    Contention(String),
}

impl StorageError {
    pub(crate) fn corrupt(key: &str, reason: impl ToString) -> Self {
        StorageError::Corrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure is the backend being unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}
