//! Webhook signing.
//!
//! The receiver gets `X-Timestamp: <unix seconds>` and
//! `X-Signature: sha256=<base64(HMAC-SHA256(secret, "{timestamp}.{body}"))>`.
//! Because the timestamp is part of the signed material, a receiver can
//! reject replays older than its own tolerance window.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    #[error("signing secret must not be empty")]
    EmptySecret,
    #[error("signing key rejected")]
    InvalidKey,
    #[error("malformed signature header")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
    #[error("timestamp {timestamp} outside tolerance")]
    Stale { timestamp: i64 },
}

/// Signature and the timestamp it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Header value, `sha256=<base64>`.
    pub signature: String,
    /// Unix seconds.
    pub timestamp: i64,
}

impl Signature {
    pub fn headers(&self) -> [(&'static str, String); 2] {
        [
            (SIGNATURE_HEADER, self.signature.clone()),
            (TIMESTAMP_HEADER, self.timestamp.to_string()),
        ]
    }
}

#[derive(Clone)]
pub struct Signer {
    keyed: HmacSha256,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, SigningError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(SigningError::EmptySecret);
        }
        let keyed = HmacSha256::new_from_slice(&secret).map_err(|_| SigningError::InvalidKey)?;
        Ok(Self { keyed })
    }

    /// Sign `body` as of `at`. Deterministic for identical inputs.
    pub fn sign(&self, body: &[u8], at: DateTime<Utc>) -> Signature {
        let timestamp = at.timestamp();
        let digest = self.mac(body, timestamp).finalize().into_bytes();
        Signature {
            signature: format!("{SIGNATURE_PREFIX}{}", STANDARD.encode(digest)),
            timestamp,
        }
    }

    /// Receiver-side check: signature matches and `timestamp` is within
    /// `tolerance` of `now` in either direction.
    pub fn verify(
        &self,
        body: &[u8],
        timestamp: i64,
        signature: &str,
        now: DateTime<Utc>,
        tolerance: Duration,
    ) -> Result<(), SigningError> {
        let skew = now.timestamp().abs_diff(timestamp);
        if skew > tolerance.as_secs() {
            return Err(SigningError::Stale { timestamp });
        }
        let encoded = signature
            .strip_prefix(SIGNATURE_PREFIX)
            .ok_or(SigningError::Malformed)?;
        let expected = STANDARD
            .decode(encoded)
            .map_err(|_| SigningError::Malformed)?;
        self.mac(body, timestamp)
            .verify_slice(&expected)
            .map_err(|_| SigningError::Mismatch)
    }

    fn mac(&self, body: &[u8], timestamp: i64) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        mac
    }
}
