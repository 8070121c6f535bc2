use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::backoff::{retry_delay, DEFAULT_MAX_ATTEMPTS};
use super::event::{FailureOutcome, OutboxEvent};
use crate::clock::{after, Clock};
use crate::error::StorageError;
use crate::storage::codec::{self, Change};
use crate::storage::KeyValueStore;

const EVENT_PREFIX: &str = "outbox:event:";
const SEQUENCE_KEY: &str = "outbox:sequence";
/// `outbox:pending:{sequence}` -> event id, for every event not yet terminal.
const PENDING_PREFIX: &str = "outbox:pending:";
/// `outbox:exhausted:{sequence}` -> event id, for every event out of attempts.
const EXHAUSTED_PREFIX: &str = "outbox:exhausted:";

/// The outbox table.
///
/// Producers call [`append`](Self::append) in the same unit of work as the
/// state change the event describes; the delivery worker drains it with
/// [`claim_due`](Self::claim_due) and records outcomes with
/// [`mark_delivered`](Self::mark_delivered) / [`mark_failed_by`](Self::mark_failed_by).
/// Events are never deleted here; archival is somebody else's job.
///
/// Delivered and exhausted events stay in the table, so reads for due work
/// go through a pending index that only holds events still in flight.
pub struct OutboxStore {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl OutboxStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            kv,
            clock,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Set the number of failed attempts after which an event is terminal.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Insert a new pending event and return its id.
    pub fn append(
        &self,
        tenant_id: &str,
        event_name: &str,
        payload: Value,
    ) -> Result<String, StorageError> {
        let sequence = self.next_sequence()?;
        let event = OutboxEvent {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            event_name: event_name.to_string(),
            payload,
            created_at: self.clock.now(),
            sequence,
            delivered_at: None,
            attempt_count: 0,
            last_error: None,
            next_retry_at: None,
            leased_by: None,
            leased_until: None,
        };
        let key = event_key(&event.id);
        if !self.kv.insert_if_absent(&key, &codec::encode(&key, &event)?)? {
            return Err(StorageError::Contention(key));
        }

        let pending = index_key(PENDING_PREFIX, sequence);
        let indexed = self.kv.insert_if_absent(&pending, event.id.as_bytes());
        if !matches!(indexed, Ok(true)) {
            // Unindexed events are never delivered.
            if let Err(err) = self.kv.delete_if_version(&key, 1) {
                error!(event_id = %event.id, error = %err, "could not remove unindexed outbox event");
            }
            return Err(indexed.err().unwrap_or(StorageError::Contention(pending)));
        }

        debug!(event_id = %event.id, tenant_id, event_name, sequence, "outbox event appended");
        Ok(event.id)
    }

    pub fn get(&self, event_id: &str) -> Result<OutboxEvent, StorageError> {
        codec::load::<OutboxEvent>(self.kv.as_ref(), &event_key(event_id))?
            .map(|(event, _)| event)
            .ok_or_else(|| StorageError::NotFound(event_id.to_string()))
    }

    /// Events eligible for delivery now, oldest first, at most `limit`.
    ///
    /// A pure read: two callers may see the same events. Workers that run in
    /// parallel should use [`claim_due`](Self::claim_due) instead.
    pub fn due_events(&self, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        let now = self.clock.now();
        let mut due: Vec<OutboxEvent> = self
            .pending()?
            .into_iter()
            .filter(|event| event.is_due(now, self.max_attempts))
            .collect();
        sort_oldest_first(&mut due);
        due.truncate(limit);
        Ok(due)
    }

    /// Like [`due_events`](Self::due_events), but leases every returned
    /// event to `worker_id` for `lease`, so no other caller gets it until
    /// the lease expires or an outcome is recorded.
    pub fn claim_due(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, StorageError> {
        let now = self.clock.now();
        let leased_until = after(now, lease);
        let max_attempts = self.max_attempts;

        let mut candidates: Vec<OutboxEvent> = self
            .pending()?
            .into_iter()
            .filter(|event| event.is_due(now, max_attempts))
            .collect();
        sort_oldest_first(&mut candidates);

        let mut claimed = Vec::with_capacity(limit.min(candidates.len()));
        for candidate in candidates {
            if claimed.len() >= limit {
                break;
            }
            let won = codec::update(
                self.kv.as_ref(),
                &event_key(&candidate.id),
                |event: &mut OutboxEvent| {
                    if !event.is_due(now, max_attempts) {
                        return Change::Keep(None);
                    }
                    event.leased_by = Some(worker_id.to_string());
                    event.leased_until = Some(leased_until);
                    Change::Write(Some(event.clone()))
                },
            )?;
            if let Some(Some(event)) = won {
                claimed.push(event);
            }
        }
        debug!(worker_id, claimed = claimed.len(), "claimed due outbox events");
        Ok(claimed)
    }

    /// Record a successful delivery. Calling it again is a no-op.
    ///
    /// Accepted from any caller, including a worker whose lease has lapsed:
    /// the webhook went out either way.
    pub fn mark_delivered(&self, event_id: &str) -> Result<(), StorageError> {
        let now = self.clock.now();
        let max_attempts = self.max_attempts;
        let (changed, event) = codec::update(
            self.kv.as_ref(),
            &event_key(event_id),
            |event: &mut OutboxEvent| {
                if event.is_terminal(max_attempts) {
                    return Change::Keep((false, event.clone()));
                }
                event.delivered_at = Some(now);
                event.last_error = None;
                event.next_retry_at = None;
                event.clear_lease();
                Change::Write((true, event.clone()))
            },
        )?
        .ok_or_else(|| StorageError::NotFound(event_id.to_string()))?;

        if !changed && event.is_exhausted(max_attempts) {
            warn!(event_id, "delivery recorded for an exhausted event; left as failed");
        }
        self.settle_indexes(&event)
    }

    /// Record a failed attempt and schedule the next one from the backoff
    /// table, or mark the event exhausted once it runs out of attempts.
    ///
    /// Does not check who holds the lease. The delivery worker uses
    /// [`mark_failed_by`](Self::mark_failed_by).
    pub fn mark_failed(
        &self,
        event_id: &str,
        error_message: &str,
    ) -> Result<FailureOutcome, StorageError> {
        self.record_failure(event_id, None, error_message)
    }

    /// [`mark_failed`](Self::mark_failed) on behalf of the worker that
    /// claimed the event. If the lease has since passed to another worker
    /// the attempt is not counted and [`FailureOutcome::LeaseLost`] is
    /// returned.
    pub fn mark_failed_by(
        &self,
        worker_id: &str,
        event_id: &str,
        error_message: &str,
    ) -> Result<FailureOutcome, StorageError> {
        self.record_failure(event_id, Some(worker_id), error_message)
    }

    /// Drop `worker_id`'s lease without recording an attempt. A lease held
    /// by someone else is left alone.
    pub fn release(&self, worker_id: &str, event_id: &str) -> Result<(), StorageError> {
        codec::update(
            self.kv.as_ref(),
            &event_key(event_id),
            |event: &mut OutboxEvent| {
                if event.leased_by.as_deref() != Some(worker_id) {
                    return Change::Keep(());
                }
                event.clear_lease();
                Change::Write(())
            },
        )?
        .ok_or_else(|| StorageError::NotFound(event_id.to_string()))
    }

    /// Events that ran out of attempts, oldest first, for operator follow-up.
    pub fn exhausted(&self, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        let mut exhausted: Vec<OutboxEvent> = self
            .indexed(EXHAUSTED_PREFIX)?
            .into_iter()
            .map(|(_, _, event)| event)
            .filter(|event| event.is_exhausted(self.max_attempts))
            .collect();
        sort_oldest_first(&mut exhausted);
        exhausted.truncate(limit);
        Ok(exhausted)
    }

    fn record_failure(
        &self,
        event_id: &str,
        holder: Option<&str>,
        error_message: &str,
    ) -> Result<FailureOutcome, StorageError> {
        let now = self.clock.now();
        let max_attempts = self.max_attempts;
        let (outcome, event) = codec::update(
            self.kv.as_ref(),
            &event_key(event_id),
            |event: &mut OutboxEvent| {
                if event.is_terminal(max_attempts) {
                    return Change::Keep((FailureOutcome::Ignored, event.clone()));
                }
                if let Some(holder) = holder {
                    if event.leased_by.as_deref() != Some(holder) {
                        return Change::Keep((FailureOutcome::LeaseLost, event.clone()));
                    }
                }
                let previous = event.attempt_count;
                event.attempt_count = previous.saturating_add(1);
                event.last_error = Some(error_message.to_string());
                event.clear_lease();

                let delay = retry_delay(previous, max_attempts)
                    .filter(|_| event.attempt_count < max_attempts);
                let outcome = match delay {
                    Some(delay) => {
                        let next_retry_at = after(now, delay);
                        event.next_retry_at = Some(next_retry_at);
                        FailureOutcome::Retrying {
                            attempt_count: event.attempt_count,
                            next_retry_at,
                        }
                    }
                    None => {
                        event.next_retry_at = None;
                        FailureOutcome::Exhausted {
                            attempt_count: event.attempt_count,
                        }
                    }
                };
                Change::Write((outcome, event.clone()))
            },
        )?
        .ok_or_else(|| StorageError::NotFound(event_id.to_string()))?;

        match outcome {
            FailureOutcome::Exhausted { attempt_count } => {
                error!(
                    event_id,
                    attempt_count,
                    last_error = error_message,
                    "outbox event exhausted its delivery attempts"
                );
            }
            FailureOutcome::Retrying {
                attempt_count,
                next_retry_at,
            } => {
                debug!(event_id, attempt_count, %next_retry_at, "outbox event scheduled for retry");
            }
            FailureOutcome::LeaseLost => {
                warn!(
                    event_id,
                    holder,
                    leased_by = event.leased_by.as_deref(),
                    "failed attempt from a lapsed lease not counted"
                );
            }
            FailureOutcome::Ignored => {}
        }
        self.settle_indexes(&event)?;
        Ok(outcome)
    }

    /// Bring the index entries in line with a terminal event. Safe to repeat,
    /// so a retried outcome call repairs a half-written earlier one.
    fn settle_indexes(&self, event: &OutboxEvent) -> Result<(), StorageError> {
        if !event.is_terminal(self.max_attempts) {
            return Ok(());
        }
        if event.is_exhausted(self.max_attempts) {
            self.kv.insert_if_absent(
                &index_key(EXHAUSTED_PREFIX, event.sequence),
                event.id.as_bytes(),
            )?;
        }
        let pending = index_key(PENDING_PREFIX, event.sequence);
        if let Some(stored) = self.kv.get(&pending)? {
            self.kv.delete_if_version(&pending, stored.version)?;
        }
        Ok(())
    }

    /// Events still listed as pending. Entries whose event has gone terminal
    /// are dropped from the index on the way.
    fn pending(&self) -> Result<Vec<OutboxEvent>, StorageError> {
        let mut pending = Vec::new();
        for (key, version, event) in self.indexed(PENDING_PREFIX)? {
            if event.is_terminal(self.max_attempts) {
                debug!(event_id = %event.id, "dropping settled event from the pending index");
                self.kv.delete_if_version(&key, version)?;
                continue;
            }
            pending.push(event);
        }
        Ok(pending)
    }

    /// Resolve every entry under an index prefix to its event.
    fn indexed(&self, prefix: &str) -> Result<Vec<(String, u64, OutboxEvent)>, StorageError> {
        let mut events = Vec::new();
        for (key, stored) in self.kv.scan_prefix(prefix)? {
            let event_id = std::str::from_utf8(&stored.value)
                .map_err(|e| StorageError::corrupt(&key, e))?;
            match codec::load::<OutboxEvent>(self.kv.as_ref(), &event_key(event_id))? {
                Some((event, _)) => events.push((key, stored.version, event)),
                None => warn!(index = %key, event_id, "index entry without an event"),
            }
        }
        Ok(events)
    }

    fn next_sequence(&self) -> Result<u64, StorageError> {
        codec::upsert(
            self.kv.as_ref(),
            SEQUENCE_KEY,
            || (1u64, 1u64),
            |current: &mut u64| {
                *current += 1;
                Change::Write(*current)
            },
        )
    }
}

fn event_key(event_id: &str) -> String {
    format!("{EVENT_PREFIX}{event_id}")
}

/// Zero-padded so key order is sequence order.
fn index_key(prefix: &str, sequence: u64) -> String {
    format!("{prefix}{sequence:020}")
}

fn sort_oldest_first(events: &mut [OutboxEvent]) {
    events.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then(a.sequence.cmp(&b.sequence))
    });
}
