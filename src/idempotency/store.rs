use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use super::record::{
    Entry, Execution, Idempotent, IdempotencyRecord, RequestScope, StoredResponse,
};
use crate::clock::{after, elapsed, Clock};
use crate::error::StorageError;
use crate::lock::{KeyLocks, LockError};
use crate::storage::codec;
use crate::storage::KeyValueStore;

const KEY_PREFIX: &str = "idem:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdempotencyError {
    /// The key was already used for a request with a different hash.
    #[error("idempotency key {key} was reused with a different request")]
    Conflict { key: String },
    /// Another process is still executing the first request with this key.
    #[error("a request with idempotency key {key} is still in progress")]
    InProgress { key: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone)]
pub struct IdempotencySettings {
    /// Lifetime of a completed record.
    pub ttl: Duration,
    /// A pending claim older than this is treated as abandoned.
    pub pending_timeout: Duration,
    /// How long to wait on another process's pending claim.
    pub wait: Duration,
    pub poll_interval: Duration,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            pending_timeout: Duration::from_secs(60),
            wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(25),
        }
    }
}

/// Replay cache for mutations.
///
/// A fresh key is claimed with an atomic insert before the procedure runs,
/// so the procedure executes at most once per key even when several
/// processes share the backend. Callers in this process holding the same
/// key are serialized on a per-key lock and then replay the stored result.
pub struct IdempotencyStore {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
    settings: IdempotencySettings,
}

impl IdempotencyStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            kv,
            clock,
            locks: KeyLocks::new(),
            settings: IdempotencySettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: IdempotencySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &IdempotencySettings {
        &self.settings
    }

    /// The live record for `key`, if any. Expired records are purged on the
    /// way out.
    pub fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StorageError> {
        let storage_key = storage_key(key);
        match codec::load::<Entry>(self.kv.as_ref(), &storage_key)? {
            Some((Entry::Completed(record), version)) => {
                if record.is_expired(self.clock.now()) {
                    self.kv.delete_if_version(&storage_key, version)?;
                    return Ok(None);
                }
                Ok(Some(record))
            }
            Some((Entry::Pending { .. }, _)) | None => Ok(None),
        }
    }

    /// Run `exec` unless a request with this key already ran.
    ///
    /// - same key, same hash: the stored response, `replayed = true`;
    /// - same key, different hash: [`IdempotencyError::Conflict`];
    /// - unknown or expired key: `exec` runs and its response is stored,
    ///   unless `exec` reports it as [`Execution::Transient`], in which case
    ///   the key is freed again.
    pub fn get_or_execute<F, E>(
        &self,
        key: &str,
        request_hash: &str,
        scope: &RequestScope,
        exec: F,
    ) -> Result<Idempotent, IdempotencyError>
    where
        F: FnOnce() -> E,
        E: Into<Execution>,
    {
        let lock = self.locks.get(key)?;
        let _guard = lock.acquire()?;

        let storage_key = storage_key(key);
        let deadline = Instant::now() + self.settings.wait;
        let mut exec = Some(exec);

        loop {
            let now = self.clock.now();
            match codec::load::<Entry>(self.kv.as_ref(), &storage_key)? {
                None => {
                    let claim = Entry::Pending {
                        request_hash: request_hash.to_string(),
                        started_at: now,
                    };
                    if !self
                        .kv
                        .insert_if_absent(&storage_key, &codec::encode(&storage_key, &claim)?)?
                    {
                        continue;
                    }
                    let Some(exec) = exec.take() else {
                        return Err(StorageError::Contention(storage_key).into());
                    };
                    let response = match exec().into() {
                        Execution::Final(response) => {
                            self.complete(&storage_key, key, request_hash, now, scope, &response)?;
                            response
                        }
                        Execution::Transient(response) => {
                            debug!(key, status = response.status, "transient failure; key released");
                            self.abandon(&storage_key, now)?;
                            response
                        }
                    };
                    return Ok(Idempotent {
                        response,
                        replayed: false,
                    });
                }
                Some((Entry::Completed(record), version)) => {
                    if record.is_expired(now) {
                        debug!(key, "idempotency record expired; executing again");
                        self.kv.delete_if_version(&storage_key, version)?;
                        continue;
                    }
                    if record.request_hash != request_hash {
                        warn!(key, "idempotency key reused with a different request");
                        return Err(IdempotencyError::Conflict {
                            key: key.to_string(),
                        });
                    }
                    debug!(key, status = record.response.status, "replaying stored response");
                    return Ok(Idempotent {
                        response: record.response,
                        replayed: true,
                    });
                }
                Some((
                    Entry::Pending {
                        request_hash: claimed_hash,
                        started_at,
                    },
                    version,
                )) => {
                    if elapsed(started_at, now) >= self.settings.pending_timeout {
                        warn!(key, %started_at, "reaping abandoned idempotency claim");
                        self.kv.delete_if_version(&storage_key, version)?;
                        continue;
                    }
                    if claimed_hash != request_hash {
                        warn!(key, "idempotency key reused while first request is running");
                        return Err(IdempotencyError::Conflict {
                            key: key.to_string(),
                        });
                    }
                    if Instant::now() >= deadline {
                        return Err(IdempotencyError::InProgress {
                            key: key.to_string(),
                        });
                    }
                    thread::sleep(self.settings.poll_interval);
                }
            }
        }
    }

    /// Purge expired records and abandoned claims, and forget idle key locks.
    /// Returns the number of stored entries removed.
    pub fn sweep(&self) -> Result<usize, IdempotencyError> {
        let now = self.clock.now();
        let mut purged = 0;
        for (storage_key, stored) in self.kv.scan_prefix(KEY_PREFIX)? {
            let stale = match codec::decode::<Entry>(&storage_key, &stored.value)? {
                Entry::Completed(record) => record.is_expired(now),
                Entry::Pending { started_at, .. } => {
                    elapsed(started_at, now) >= self.settings.pending_timeout
                }
            };
            if stale && self.kv.delete_if_version(&storage_key, stored.version)? {
                purged += 1;
            }
        }
        let pruned = self.locks.prune()?;
        debug!(purged, pruned_locks = pruned, "idempotency sweep finished");
        Ok(purged)
    }

    /// Delete our pending claim so the next request with the key runs.
    fn abandon(&self, storage_key: &str, claimed_at: DateTime<Utc>) -> Result<(), StorageError> {
        if let Some((Entry::Pending { started_at, .. }, version)) =
            codec::load::<Entry>(self.kv.as_ref(), storage_key)?
        {
            if started_at == claimed_at {
                self.kv.delete_if_version(storage_key, version)?;
            }
        }
        Ok(())
    }

    /// Swap our pending claim for the completed record. The claim is
    /// identified by its start time, so a claim that was reaped and
    /// re-taken by another caller is left alone.
    fn complete(
        &self,
        storage_key: &str,
        key: &str,
        request_hash: &str,
        claimed_at: DateTime<Utc>,
        scope: &RequestScope,
        response: &StoredResponse,
    ) -> Result<(), StorageError> {
        let created_at = self.clock.now();
        let record = Entry::Completed(IdempotencyRecord {
            key: key.to_string(),
            request_hash: request_hash.to_string(),
            scope: scope.clone(),
            response: response.clone(),
            created_at,
            expires_at: after(created_at, self.settings.ttl),
        });
        let version = match codec::load::<Entry>(self.kv.as_ref(), storage_key)? {
            Some((Entry::Pending { started_at, .. }, version)) if started_at == claimed_at => {
                Some(version)
            }
            _ => None,
        };
        let stored = match version {
            Some(version) => self.kv.compare_and_swap(
                storage_key,
                version,
                &codec::encode(storage_key, &record)?,
            )?,
            None => false,
        };
        if !stored {
            warn!(key, "idempotency claim was reaped while executing; response not stored");
        }
        Ok(())
    }
}

fn storage_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}
