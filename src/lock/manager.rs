use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{KeyLock, LockError};

/// One [`KeyLock`] per key, created on first use.
///
/// Repeated lookups for the same key return the same `Arc`, so callers that
/// acquire it are serialized against each other and nobody else.
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<KeyLock>>>,
}

impl KeyLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the lock for `key`.
    pub fn get(&self, key: &str) -> Result<Arc<KeyLock>, LockError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LockError::Poisoned("key lock map poisoned".into()))?;
        Ok(locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KeyLock::new()))
            .clone())
    }

    /// Drop locks nobody holds or references. Returns how many were removed.
    pub fn prune(&self) -> Result<usize, LockError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LockError::Poisoned("key lock map poisoned".into()))?;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.is_locked());
        Ok(before - locks.len())
    }

    /// Number of locks currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Check if no locks are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
