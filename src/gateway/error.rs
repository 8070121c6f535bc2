use std::error::Error;

use serde_json::{json, Value};
use thiserror::Error;

use crate::error::StorageError;
use crate::idempotency::IdempotencyError;
use crate::ratelimit::RateLimitDecision;

/// Errors a procedure handler returns. They become the response status and
/// body, and are cached like any other response when the call is idempotent.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// Business rules rejected the request.
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("guard rejected procedure: {0}")]
    GuardRejected(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("handler error: {0}")]
    Other(Box<dyn Error + Send + Sync>),
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}

impl HandlerError {
    pub fn status_code(&self) -> u16 {
        match self {
            HandlerError::DecodeFailed(_) => 400,
            HandlerError::Rejected(_) => 422,
            HandlerError::NotFound(_) => 404,
            HandlerError::Unauthorized(_) => 401,
            HandlerError::GuardRejected(_) => 400,
            HandlerError::Storage(e) => storage_status(e),
            HandlerError::Other(_) => 500,
        }
    }
}

/// Errors raised by the gateway itself, before or around the handler.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown procedure: {0}")]
    UnknownProcedure(String),
    #[error("rate limit exceeded")]
    RateLimited(RateLimitDecision),
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("could not hash request: {0}")]
    Canonicalize(String),
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::UnknownProcedure(_) => 404,
            GatewayError::RateLimited(_) => 429,
            GatewayError::Idempotency(IdempotencyError::Conflict { .. })
            | GatewayError::Idempotency(IdempotencyError::InProgress { .. }) => 409,
            GatewayError::Idempotency(IdempotencyError::Storage(e)) => storage_status(e),
            GatewayError::Idempotency(IdempotencyError::Lock(_)) => 500,
            GatewayError::Storage(e) => storage_status(e),
            GatewayError::Canonicalize(_) => 400,
        }
    }

    /// JSON body for the error response.
    pub fn body(&self) -> Value {
        match self {
            GatewayError::RateLimited(decision) => json!({
                "error": self.to_string(),
                "limit": decision.limit,
                "remaining": 0,
                "retryAfter": decision.retry_after_secs().unwrap_or(1),
            }),
            _ => json!({ "error": self.to_string() }),
        }
    }
}

fn storage_status(err: &StorageError) -> u16 {
    match err {
        StorageError::Unavailable(_) | StorageError::Contention(_) => 503,
        StorageError::NotFound(_) => 404,
        StorageError::Corrupt { .. } => 500,
    }
}
