use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::event::OutboxEvent;
use crate::signing::Signer;

pub const DEFAULT_USER_AGENT: &str = "Relaygate-Automation-Bridge/1.0";

/// One signed POST, ready for a [`DeliverySink`](super::DeliverySink).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub event_id: String,
    pub tenant_id: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl DeliveryRequest {
    /// Canonical envelope `{"event", "payload", "timestamp"}`, signed as of `at`.
    pub fn build(
        event: &OutboxEvent,
        signer: &Signer,
        user_agent: &str,
        at: DateTime<Utc>,
    ) -> Result<Self, DeliveryFailure> {
        let body = envelope_body(&event.event_name, &event.payload, at)
            .map_err(|e| DeliveryFailure::Encode(e.to_string()))?;
        let signature = signer.sign(&body, at);

        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("User-Agent".to_string(), user_agent.to_string()),
        ];
        headers.extend(
            signature
                .headers()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value)),
        );

        Ok(Self {
            event_id: event.id.clone(),
            tenant_id: event.tenant_id.clone(),
            body,
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    event: &'a str,
    payload: &'a Value,
    timestamp: String,
}

/// JCS-canonical bytes of the webhook body.
pub fn envelope_body(
    event_name: &str,
    payload: &Value,
    at: DateTime<Utc>,
) -> Result<Vec<u8>, serde_json::Error> {
    serde_jcs::to_vec(&Envelope {
        event: event_name,
        payload,
        timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// Why one delivery attempt did not succeed. Recorded on the event, never
/// raised out of a tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("could not encode envelope: {0}")]
    Encode(String),
}
