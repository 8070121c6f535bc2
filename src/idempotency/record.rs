use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The response a procedure produced, replayed verbatim on cache hits.
/// Error responses are cached the same way as successes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: Value,
}

impl StoredResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// What a procedure run produced, and whether it may be replayed.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// Stored under the key and replayed to every retry, errors included.
    Final(StoredResponse),
    /// Returned to this caller only. The claim is dropped so a retry with
    /// the same key runs the procedure again.
    Transient(StoredResponse),
}

impl Execution {
    pub fn response(&self) -> &StoredResponse {
        match self {
            Execution::Final(response) | Execution::Transient(response) => response,
        }
    }

    pub fn into_response(self) -> StoredResponse {
        match self {
            Execution::Final(response) | Execution::Transient(response) => response,
        }
    }
}

impl From<StoredResponse> for Execution {
    fn from(response: StoredResponse) -> Self {
        Execution::Final(response)
    }
}

/// Who sent a request and where. Stored with the record for inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestScope {
    pub method: String,
    pub path: String,
    pub tenant_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub request_hash: String,
    #[serde(flatten)]
    pub scope: RequestScope,
    pub response: StoredResponse,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// What is stored under an idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub(crate) enum Entry {
    /// Claimed; the procedure is running somewhere.
    Pending {
        request_hash: String,
        started_at: DateTime<Utc>,
    },
    Completed(IdempotencyRecord),
}

/// Result of [`IdempotencyStore::get_or_execute`](super::IdempotencyStore::get_or_execute).
#[derive(Debug, Clone, PartialEq)]
pub struct Idempotent {
    pub response: StoredResponse,
    /// Served from a previous execution.
    pub replayed: bool,
}
