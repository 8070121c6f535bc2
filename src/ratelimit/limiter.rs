use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::bucket::{RateLimitDecision, TokenBucket};
use super::policy::{BucketKey, RateLimit};
use crate::clock::{before, Clock};
use crate::error::StorageError;
use crate::storage::codec::{self, Change};
use crate::storage::KeyValueStore;

const BUCKET_PREFIX: &str = "ratelimit:";

/// Idle time after which a bucket may be evicted by [`RateLimiter::sweep`].
pub const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(60 * 60);

/// Token buckets kept in the shared key-value store.
///
/// Every admission is a compare-and-swap on that one bucket's row, so
/// concurrent requests for the same key never double-spend and requests for
/// different keys never contend.
pub struct RateLimiter {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    pub fn admit(
        &self,
        key: &BucketKey,
        limit: RateLimit,
    ) -> Result<RateLimitDecision, StorageError> {
        self.admit_raw(&key.to_string(), limit.limit, limit.window())
    }

    /// Spend one token from `bucket`, creating it full on first use.
    pub fn admit_raw(
        &self,
        bucket: &str,
        capacity: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, StorageError> {
        let storage_key = bucket_key(bucket);
        let decision = codec::upsert(
            self.kv.as_ref(),
            &storage_key,
            || {
                let now = self.clock.now();
                let mut fresh = TokenBucket::new(capacity, now);
                let decision = fresh.admit(capacity, window, now);
                (fresh, decision)
            },
            |state: &mut TokenBucket| {
                let before = state.clone();
                let decision = state.admit(capacity, window, self.clock.now());
                if *state == before {
                    Change::Keep(decision)
                } else {
                    Change::Write(decision)
                }
            },
        )?;

        debug!(
            bucket,
            allowed = decision.allowed,
            remaining = decision.remaining,
            limit = decision.limit,
            "rate limit decision"
        );
        Ok(decision)
    }

    /// Current state of a bucket, without refilling or spending.
    pub fn bucket(&self, bucket: &str) -> Result<Option<TokenBucket>, StorageError> {
        Ok(codec::load::<TokenBucket>(self.kv.as_ref(), &bucket_key(bucket))?.map(|(b, _)| b))
    }

    /// Evict buckets untouched for longer than `idle`. An evicted bucket
    /// comes back full, which is what it would have refilled to anyway.
    pub fn sweep(&self, idle: Duration) -> Result<usize, StorageError> {
        let cutoff = before(self.clock.now(), idle);
        let mut evicted = 0;
        for (key, stored) in self.kv.scan_prefix(BUCKET_PREFIX)? {
            let state: TokenBucket = codec::decode(&key, &stored.value)?;
            if state.last_refill_at < cutoff && self.kv.delete_if_version(&key, stored.version)? {
                evicted += 1;
            }
        }
        debug!(evicted, "rate limit sweep finished");
        Ok(evicted)
    }
}

fn bucket_key(bucket: &str) -> String {
    format!("{BUCKET_PREFIX}{bucket}")
}
