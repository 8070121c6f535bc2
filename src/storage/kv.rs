use std::sync::Arc;

use crate::error::StorageError;

/// A stored value together with its write version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    /// 1 on insert, incremented by every successful compare-and-swap.
    pub version: u64,
}

/// Minimal key-value contract the reliability stores are written against.
///
/// Implementations must make each call atomic with respect to the others:
/// the outbox, idempotency and rate-limit stores build all of their
/// read-modify-write paths out of `insert_if_absent` and `compare_and_swap`.
/// The in-memory backend uses a lock; durable backends use a unique-key
/// insert and a conditional `UPDATE`.
pub trait KeyValueStore: Send + Sync {
    /// Read the current value for `key`.
    fn get(&self, key: &str) -> Result<Option<Versioned>, StorageError>;

    /// Insert `value` only if `key` is absent.
    /// Returns `Ok(false)` if a value already exists.
    fn insert_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, StorageError>;

    /// Replace the value only if the stored version equals `expected`.
    /// Returns `Ok(false)` if the key is missing or the version moved.
    fn compare_and_swap(&self, key: &str, expected: u64, value: &[u8])
        -> Result<bool, StorageError>;

    /// Delete the value only if the stored version equals `expected`.
    fn delete_if_version(&self, key: &str, expected: u64) -> Result<bool, StorageError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StorageError>;
}

impl<K: KeyValueStore + ?Sized> KeyValueStore for Arc<K> {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StorageError> {
        (**self).get(key)
    }

    fn insert_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, StorageError> {
        (**self).insert_if_absent(key, value)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        value: &[u8],
    ) -> Result<bool, StorageError> {
        (**self).compare_and_swap(key, expected, value)
    }

    fn delete_if_version(&self, key: &str, expected: u64) -> Result<bool, StorageError> {
        (**self).delete_if_version(key, expected)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StorageError> {
        (**self).scan_prefix(prefix)
    }
}
