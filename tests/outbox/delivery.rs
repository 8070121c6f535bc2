//! Delivery worker against a wiremock sink.

use std::time::Duration;

use relaygate::outbox::{DeliverySettings, DeliveryWorker, HttpSink, MAX_ERROR_BODY};
use relaygate::signing::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use relaygate::{InMemoryKv, Signer};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::support::Fixture;

const SECRET: &str = "whsec_test";

fn worker(fx: &Fixture, server: &MockServer, timeout: Duration) -> DeliveryWorker<HttpSink> {
    let sink = HttpSink::new(format!("{}/hooks", server.uri()), timeout).unwrap();
    DeliveryWorker::new(fx.outbox.clone(), fx.shared_clock())
        .with_sink(sink, Signer::new(SECRET).unwrap())
        .with_settings(DeliverySettings {
            worker_id: "test-worker".into(),
            timeout,
            ..DeliverySettings::default()
        })
}

#[tokio::test]
async fn delivers_signed_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let fx = Fixture::new(Arc::new(InMemoryKv::new()));
    let id = fx
        .outbox
        .append("T", "record.created", json!({"k": "v"}))
        .unwrap();

    let report = worker(&fx, &server, Duration::from_secs(5))
        .tick(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.succeeded, 1);
    assert!(fx.outbox.get(&id).unwrap().delivered_at.is_some());

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let envelope: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(envelope["event"], "record.created");
    assert_eq!(envelope["payload"], json!({"k": "v"}));
    assert!(envelope["timestamp"].is_string());

    let signature = request.headers[SIGNATURE_HEADER].to_str().unwrap();
    let timestamp: i64 = request.headers[TIMESTAMP_HEADER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    Signer::new(SECRET)
        .unwrap()
        .verify(
            &request.body,
            timestamp,
            signature,
            fx.now(),
            Duration::from_secs(300),
        )
        .unwrap();
    assert!(request.headers["user-agent"]
        .to_str()
        .unwrap()
        .starts_with("Relaygate"));
}

#[tokio::test]
async fn rejected_delivery_is_rescheduled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let fx = Fixture::new(Arc::new(InMemoryKv::new()));
    let id = fx.outbox.append("T", "record.created", json!({})).unwrap();
    let worker = worker(&fx, &server, Duration::from_secs(5));

    let report = worker.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.exhausted, 0);

    let event = fx.outbox.get(&id).unwrap();
    assert_eq!(event.attempt_count, 1);
    assert_eq!(event.last_error.as_deref(), Some("HTTP 500: boom"));
    assert!(event.leased_until.is_none());

    // Not due again until the first backoff step has passed.
    let report = worker.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed, 0);
    fx.clock.advance(Duration::from_secs(60));
    let report = worker.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(fx.outbox.get(&id).unwrap().attempt_count, 2);
}

#[tokio::test]
async fn large_error_bodies_are_truncated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("x".repeat(64 * 1024)))
        .mount(&server)
        .await;

    let fx = Fixture::new(Arc::new(InMemoryKv::new()));
    let id = fx.outbox.append("T", "record.created", json!({})).unwrap();
    worker(&fx, &server, Duration::from_secs(5))
        .tick(&CancellationToken::new())
        .await
        .unwrap();

    let last_error = fx.outbox.get(&id).unwrap().last_error.unwrap();
    assert!(last_error.starts_with("HTTP 502: xxx"));
    assert!(last_error.ends_with("..."));
    assert!(last_error.len() <= "HTTP 502: ".len() + MAX_ERROR_BODY + 3);
}

#[tokio::test]
async fn exhausted_events_stop_being_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let fx = Fixture::with_max_attempts(Arc::new(InMemoryKv::new()), 2);
    let id = fx.outbox.append("T", "record.created", json!({})).unwrap();
    let worker = worker(&fx, &server, Duration::from_secs(5));

    worker.tick(&CancellationToken::new()).await.unwrap();
    fx.clock.advance(Duration::from_secs(61));
    let report = worker.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.exhausted, 1);

    fx.clock.advance(Duration::from_secs(86_400));
    let report = worker.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(fx.outbox.exhausted(10).unwrap()[0].id, id);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn slow_sink_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let fx = Fixture::new(Arc::new(InMemoryKv::new()));
    let id = fx.outbox.append("T", "record.created", json!({})).unwrap();

    let report = worker(&fx, &server, Duration::from_millis(200))
        .tick(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.failed, 1);

    let event = fx.outbox.get(&id).unwrap();
    assert!(event.delivered_at.is_none());
    assert!(event
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("delivery timed out"));
}

#[tokio::test]
async fn unreachable_sink_is_a_network_failure() {
    let fx = Fixture::new(Arc::new(InMemoryKv::new()));
    let id = fx.outbox.append("T", "record.created", json!({})).unwrap();

    // Nothing listens on the discard port.
    let sink = HttpSink::new("http://127.0.0.1:9/hooks", Duration::from_secs(2)).unwrap();
    let worker = DeliveryWorker::new(fx.outbox.clone(), fx.shared_clock())
        .with_sink(sink, Signer::new(SECRET).unwrap());

    let report = worker.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(fx.outbox.get(&id).unwrap().attempt_count, 1);
}
