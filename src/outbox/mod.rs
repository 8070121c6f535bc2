//! Transactional outbox and its delivery worker.
//!
//! Producers [`append`](OutboxStore::append) events alongside the state
//! change they describe. A [`DeliveryWorker`] periodically claims due events,
//! wraps each in a signed JSON envelope and POSTs it through a
//! [`DeliverySink`]. Failures are retried on the fixed
//! [backoff schedule](backoff::BACKOFF_SCHEDULE_SECS) until the attempt limit,
//! after which the event stays in the table as exhausted.

pub mod backoff;
mod delivery;
mod event;
mod sink;
mod store;
mod worker;

pub use backoff::{retry_delay, BACKOFF_SCHEDULE_SECS, DEFAULT_MAX_ATTEMPTS};
pub use delivery::{envelope_body, DeliveryFailure, DeliveryRequest, DEFAULT_USER_AGENT};
pub use event::{FailureOutcome, OutboxEvent};
pub use sink::{DeliverySink, HttpSink, RecordingSink, MAX_ERROR_BODY};
pub use store::OutboxStore;
pub use worker::{
    DeliveryReport, DeliverySettings, DeliveryTrigger, DeliveryWorker, DEFAULT_LEASE_SECS,
};
