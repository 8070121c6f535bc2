use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::elapsed;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    /// Whole tokens left after this request.
    pub remaining: u32,
    /// Time until one token is available. Only set on denial.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// `retry_after` as whole seconds, rounded up, never below one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after
            .map(|wait| (wait.as_secs_f64().ceil() as u64).max(1))
    }
}

/// Token-bucket state for one key.
///
/// `tokens` stays within `0.0..=capacity`. Refill is continuous at
/// `capacity / window` tokens per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub capacity: u32,
    pub tokens: f64,
    pub last_refill_at: DateTime<Utc>,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, now: DateTime<Utc>) -> Self {
        Self {
            capacity,
            tokens: f64::from(capacity),
            last_refill_at: now,
        }
    }

    /// Add the tokens earned since the last refill. `last_refill_at` only
    /// moves when something was actually added.
    pub fn refill(&mut self, capacity: u32, window: Duration, now: DateTime<Utc>) {
        if capacity != self.capacity {
            self.capacity = capacity;
            self.tokens = self.tokens.min(f64::from(capacity));
        }
        let cap = f64::from(capacity);
        if window.is_zero() {
            self.tokens = cap;
            self.last_refill_at = now;
            return;
        }
        let added = elapsed(self.last_refill_at, now).as_secs_f64() * rate(capacity, window);
        if added > 0.0 {
            self.tokens = (self.tokens + added).min(cap);
            self.last_refill_at = now;
        }
    }

    /// Refill, then spend one token if there is one.
    pub fn admit(
        &mut self,
        capacity: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        self.refill(capacity, window, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateLimitDecision {
                allowed: true,
                limit: capacity,
                remaining: self.remaining(),
                retry_after: None,
            };
        }
        RateLimitDecision {
            allowed: false,
            limit: capacity,
            remaining: 0,
            retry_after: Some(self.time_to_next_token(window)),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.tokens.max(0.0).floor() as u32
    }

    fn time_to_next_token(&self, window: Duration) -> Duration {
        let rate = rate(self.capacity, window);
        if rate <= 0.0 {
            return window;
        }
        let missing = (1.0 - self.tokens).max(0.0);
        Duration::try_from_secs_f64(missing / rate)
            .unwrap_or(window)
            .max(Duration::from_nanos(1))
    }
}

fn rate(capacity: u32, window: Duration) -> f64 {
    f64::from(capacity) / window.as_secs_f64()
}
