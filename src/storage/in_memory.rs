use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use super::{KeyValueStore, Versioned};
use crate::error::StorageError;

/// In-process key-value store for tests and offline/demo mode.
///
/// Every operation takes the map lock, so each call is atomic by
/// construction. Clones share the same map.
#[derive(Clone, Default)]
pub struct InMemoryKv {
    entries: Arc<RwLock<BTreeMap<String, Versioned>>>,
    outage: Arc<AtomicBool>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// While `true`, every call fails with [`StorageError::Unavailable`].
    pub fn simulate_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }
}

fn poisoned() -> StorageError {
    StorageError::Unavailable("in-memory store lock poisoned".into())
}

impl KeyValueStore for InMemoryKv {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StorageError> {
        self.check()?;
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn insert_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, StorageError> {
        self.check()?;
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Versioned {
                value: value.to_vec(),
                version: 1,
            },
        );
        Ok(true)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        value: &[u8],
    ) -> Result<bool, StorageError> {
        self.check()?;
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        match entries.get_mut(key) {
            Some(stored) if stored.version == expected => {
                stored.value = value.to_vec();
                stored.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_if_version(&self, key: &str, expected: u64) -> Result<bool, StorageError> {
        self.check()?;
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        match entries.get(key) {
            Some(stored) if stored.version == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StorageError> {
        self.check()?;
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
