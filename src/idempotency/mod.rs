//! Request idempotency: replay the first response for retried mutations.
//!
//! Keys come from the client's `Idempotency-Key` header, or are derived from
//! the request itself when the gateway runs in
//! [`IdempotencyMode::DeriveWhenMissing`]. The request hash covers the
//! canonical body plus a header whitelist, so reusing a key for a different
//! request is detected as a conflict instead of silently replayed.

mod hash;
mod record;
mod store;

use serde::Deserialize;

pub use hash::{derive_key, request_hash, DEFAULT_HEADER_WHITELIST};
pub use record::{Execution, Idempotent, IdempotencyRecord, RequestScope, StoredResponse};
pub use store::{IdempotencyError, IdempotencySettings, IdempotencyStore};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// What the gateway does with a mutation that carries no idempotency key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyMode {
    /// No header, no idempotency.
    #[default]
    HeaderOnly,
    /// Derive a key from method, path, principal and body.
    DeriveWhenMissing,
}
