use thiserror::Error;

/// Error type for lock operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// A thread panicked while holding the lock state.
    #[error("lock poisoned: {0}")]
    Poisoned(String),
}
