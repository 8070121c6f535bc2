//! Storage contract shared by the outbox, idempotency and rate-limit stores.
//!
//! The stores hold an `Arc<dyn KeyValueStore>`; which backend sits behind it
//! is decided once at process start:
//!
//! - [`InMemoryKv`]: offline/demo mode and tests.
//! - [`SqliteKv`]: durable backend (requires the `sqlite` feature).
//!
//! ```ignore
//! use std::sync::Arc;
//! use relaygate::storage::{InMemoryKv, KeyValueStore};
//!
//! let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKv::new());
//! let outbox = relaygate::OutboxStore::new(kv.clone(), clock.clone());
//! let idempotency = relaygate::IdempotencyStore::new(kv, clock);
//! ```

pub(crate) mod codec;
mod in_memory;
mod kv;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use in_memory::InMemoryKv;
pub use kv::{KeyValueStore, Versioned};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteKv;
