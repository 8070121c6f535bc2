use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A fact that must reach the downstream webhook at least once.
///
/// Created by [`OutboxStore::append`](super::OutboxStore::append) and only
/// ever mutated by the delivery path afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: String,
    pub tenant_id: String,
    pub event_name: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Store-assigned, strictly increasing. Breaks `created_at` ties.
    pub sequence: u64,
    /// Set exactly once, on successful delivery.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Failed attempts so far. Never decreases.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// `None` means eligible now.
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub leased_by: Option<String>,
    #[serde(default)]
    pub leased_until: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }

    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        !self.is_delivered() && self.attempt_count >= max_attempts
    }

    /// Delivered or out of attempts; never picked up again.
    pub fn is_terminal(&self, max_attempts: u32) -> bool {
        self.is_delivered() || self.attempt_count >= max_attempts
    }

    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.leased_until.is_some_and(|until| until > now)
    }

    /// Eligible for a delivery attempt at `now`.
    pub fn is_due(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        !self.is_terminal(max_attempts)
            && self.next_retry_at.map_or(true, |at| at <= now)
            && !self.is_leased(now)
    }

    pub(crate) fn clear_lease(&mut self) {
        self.leased_by = None;
        self.leased_until = None;
    }
}

/// What [`OutboxStore::mark_failed`](super::OutboxStore::mark_failed) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Another attempt is scheduled.
    Retrying {
        attempt_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// `attempt_count` reached the maximum; no further attempts.
    Exhausted { attempt_count: u32 },
    /// The event was already delivered or exhausted; nothing changed.
    Ignored,
    /// The reporting worker no longer holds the lease; nothing changed.
    LeaseLost,
}
