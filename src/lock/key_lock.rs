use std::sync::{Condvar, Mutex};

use super::LockError;

/// Lock backed by `Mutex<bool>` + `Condvar`.
///
/// Unlike `std::sync::Mutex` the held state is not tied to a guard borrowing
/// a `MutexGuard`, so a [`LockGuard`] may be held across `.await` points.
pub struct KeyLock {
    state: Mutex<bool>,
    wake: Condvar,
}

impl KeyLock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        KeyLock {
            state: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    /// Block until the lock is free, then take it.
    pub fn acquire(&self) -> Result<LockGuard<'_>, LockError> {
        let mut locked = self
            .state
            .lock()
            .map_err(|e| LockError::Poisoned(e.to_string()))?;
        while *locked {
            locked = self
                .wake
                .wait(locked)
                .map_err(|e| LockError::Poisoned(e.to_string()))?;
        }
        *locked = true;
        Ok(LockGuard { lock: self })
    }

    /// Take the lock if it is free. `Ok(None)` if someone else holds it.
    pub fn try_acquire(&self) -> Result<Option<LockGuard<'_>>, LockError> {
        let mut locked = self
            .state
            .lock()
            .map_err(|e| LockError::Poisoned(e.to_string()))?;
        if *locked {
            Ok(None)
        } else {
            *locked = true;
            Ok(Some(LockGuard { lock: self }))
        }
    }

    /// Check if someone holds the lock. A poisoned lock counts as held.
    pub fn is_locked(&self) -> bool {
        self.state.lock().map(|locked| *locked).unwrap_or(true)
    }

    fn release(&self) {
        let mut locked = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *locked {
            *locked = false;
            self.wake.notify_one();
        }
    }
}

impl Default for KeyLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a [`KeyLock`] until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a KeyLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
