use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::delivery::{DeliveryFailure, DeliveryRequest};

/// Where the delivery worker sends signed webhook bodies.
pub trait DeliverySink: Send + Sync {
    fn deliver(
        &self,
        request: &DeliveryRequest,
    ) -> impl Future<Output = Result<(), DeliveryFailure>> + Send;
}

/// POSTs every request to one URL.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl DeliverySink for HttpSink {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<(), DeliveryFailure> {
        let mut builder = self.client.post(&self.url).body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                DeliveryFailure::Timeout(self.timeout)
            } else {
                DeliveryFailure::Network(err.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = error_excerpt(response).await;
        Err(DeliveryFailure::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Most bytes of a rejection body kept for `last_error`.
pub const MAX_ERROR_BODY: usize = 2048;

/// The start of an error response body, read no further than needed.
async fn error_excerpt(mut response: reqwest::Response) -> String {
    let mut body = Vec::new();
    while body.len() <= MAX_ERROR_BODY {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    let truncated = body.len() > MAX_ERROR_BODY;
    body.truncate(MAX_ERROR_BODY);
    let mut excerpt = String::from_utf8_lossy(&body).into_owned();
    if truncated {
        excerpt.push_str("...");
    }
    excerpt
}

/// Keeps every request in memory instead of sending it. Failures and a
/// per-delivery delay can be scripted, which is how the worker is tested
/// without a network.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    delivered: Arc<Mutex<Vec<DeliveryRequest>>>,
    script: Arc<Mutex<VecDeque<DeliveryFailure>>>,
    always_fail: Option<DeliveryFailure>,
    delay: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every delivery with `failure`.
    pub fn failing(failure: DeliveryFailure) -> Self {
        Self {
            always_fail: Some(failure),
            ..Self::default()
        }
    }

    /// Sleep before answering each delivery.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next delivery with `failure`; scripted failures are consumed
    /// in order before falling back to the default behaviour.
    pub fn fail_next(&self, failure: DeliveryFailure) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(failure);
        }
    }

    /// Requests that reached the sink and were accepted.
    pub fn delivered(&self) -> Vec<DeliveryRequest> {
        self.delivered
            .lock()
            .map(|delivered| delivered.clone())
            .unwrap_or_default()
    }

    fn next_failure(&self) -> Option<DeliveryFailure> {
        let scripted = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front());
        scripted.or_else(|| self.always_fail.clone())
    }
}

impl DeliverySink for RecordingSink {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<(), DeliveryFailure> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = self.next_failure() {
            return Err(failure);
        }
        self.delivered
            .lock()
            .map_err(|_| DeliveryFailure::Network("recording sink buffer poisoned".into()))?
            .push(request.clone());
        Ok(())
    }
}
