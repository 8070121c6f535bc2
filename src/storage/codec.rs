//! JSON record encoding and the compare-and-swap update loop shared by the
//! stores.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::KeyValueStore;
use crate::error::StorageError;

/// Upper bound on lost CAS races before giving up with `Contention`.
const MAX_CAS_ATTEMPTS: usize = 32;

pub(crate) fn encode<T: Serialize>(key: &str, record: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(record).map_err(|e| StorageError::corrupt(key, e))
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::corrupt(key, e))
}

/// Load and decode a record with its version.
pub(crate) fn load<T: DeserializeOwned>(
    kv: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<(T, u64)>, StorageError> {
    match kv.get(key)? {
        Some(stored) => Ok(Some((decode(key, &stored.value)?, stored.version))),
        None => Ok(None),
    }
}

/// What an update closure decided to do with the record it was shown.
pub(crate) enum Change<R> {
    /// Persist the mutated record and return the value.
    Write(R),
    /// Leave the stored record untouched and return the value.
    Keep(R),
}

/// Read-modify-write a single record under compare-and-swap.
///
/// `apply` may run more than once if another writer wins the race, so it
/// must derive everything from the record it is given. Returns `Ok(None)`
/// when the key does not exist.
pub(crate) fn update<T, R>(
    kv: &dyn KeyValueStore,
    key: &str,
    mut apply: impl FnMut(&mut T) -> Change<R>,
) -> Result<Option<R>, StorageError>
where
    T: Serialize + DeserializeOwned,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let Some((mut record, version)) = load::<T>(kv, key)? else {
            return Ok(None);
        };
        match apply(&mut record) {
            Change::Keep(out) => return Ok(Some(out)),
            Change::Write(out) => {
                if kv.compare_and_swap(key, version, &encode(key, &record)?)? {
                    return Ok(Some(out));
                }
            }
        }
    }
    Err(StorageError::Contention(key.to_string()))
}

/// Read-modify-write a record, creating it from `init` when absent.
pub(crate) fn upsert<T, R>(
    kv: &dyn KeyValueStore,
    key: &str,
    mut init: impl FnMut() -> (T, R),
    mut apply: impl FnMut(&mut T) -> Change<R>,
) -> Result<R, StorageError>
where
    T: Serialize + DeserializeOwned,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        match load::<T>(kv, key)? {
            None => {
                let (record, out) = init();
                if kv.insert_if_absent(key, &encode(key, &record)?)? {
                    return Ok(out);
                }
            }
            Some((mut record, version)) => match apply(&mut record) {
                Change::Keep(out) => return Ok(out),
                Change::Write(out) => {
                    if kv.compare_and_swap(key, version, &encode(key, &record)?)? {
                        return Ok(out);
                    }
                }
            },
        }
    }
    Err(StorageError::Contention(key.to_string()))
}
