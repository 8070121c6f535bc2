//! Reliability middleware for multi-tenant backends.
//!
//! - [`outbox`]: transactional outbox with signed webhook delivery and
//!   exponential backoff.
//! - [`idempotency`]: at-most-once execution of mutations per key, with
//!   cached replay.
//! - [`ratelimit`]: token-bucket admission per client, tenant and procedure.
//! - [`gateway`]: the middleware chain tying the stores to procedure
//!   handlers, plus an optional HTTP transport (`http` feature).
//!
//! All stores share one [`KeyValueStore`] and one [`Clock`], injected at
//! construction.

pub mod clock;
pub mod config;
mod error;
pub mod gateway;
pub mod idempotency;
pub mod lock;
pub mod outbox;
pub mod ratelimit;
pub mod signing;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, RelayConfig};
pub use error::StorageError;
pub use gateway::{Context, Gateway, HandlerError, ProcedureRequest, ProcedureResponse};
pub use idempotency::{IdempotencyError, IdempotencyStore};
pub use outbox::{DeliveryWorker, OutboxEvent, OutboxStore};
pub use ratelimit::{RateLimitDecision, RateLimitPolicy, RateLimiter};
pub use signing::Signer;
pub use storage::{InMemoryKv, KeyValueStore};
#[cfg(feature = "sqlite")]
pub use storage::SqliteKv;
