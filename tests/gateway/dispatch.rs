use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use relaygate::gateway::{HandlerError, ProcedureRequest};
use relaygate::idempotency::IdempotencyMode;
use relaygate::ratelimit::{RateLimit, RateLimitPolicy};
use relaygate::StorageError;
use serde_json::json;

use crate::support::Harness;

fn create(name: &str) -> ProcedureRequest {
    ProcedureRequest::new("records.create", json!({ "name": name }))
        .with_header("x-tenant-id", "T")
        .with_header("x-user-id", "u1")
        .with_header("content-type", "application/json")
        .with_client("203.0.113.9")
}

#[test]
fn mutation_writes_record_and_outbox_event() {
    let harness = Harness::new();
    let response = harness.gateway.dispatch(&create("x"));

    assert_eq!(response.status, 200);
    assert_eq!(response.body["name"], "x");
    assert_eq!(response.rate_limit.unwrap().limit, 30);

    let due = harness.outbox.due_events(10).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].event_name, "record.created");
    assert_eq!(due[0].tenant_id, "T");
    assert_eq!(due[0].payload["name"], "x");
}

#[test]
fn concurrent_retries_with_one_key_create_one_record() {
    let harness = Harness::new();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let gateway = harness.gateway.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                gateway.dispatch(&create("x").with_header("idempotency-key", "abc123"))
            })
        })
        .collect();
    let responses: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(harness.gateway.state().record_count(), 1);
    assert_eq!(harness.outbox.due_events(10).unwrap().len(), 1);
    assert_eq!(responses[0].status, responses[1].status);
    assert_eq!(responses[0].body, responses[1].body);
    assert_eq!(responses.iter().filter(|r| r.replayed).count(), 1);
}

#[test]
fn key_reuse_with_different_body_is_409() {
    let harness = Harness::new();
    let first = harness
        .gateway
        .dispatch(&create("x").with_header("idempotency-key", "k1"));
    assert_eq!(first.status, 200);

    let reused = harness
        .gateway
        .dispatch(&create("y").with_header("idempotency-key", "k1"));
    assert_eq!(reused.status, 409);
    assert_eq!(harness.gateway.state().record_count(), 1);
}

#[test]
fn non_whitelisted_headers_do_not_affect_the_hash() {
    let harness = Harness::new();
    harness.gateway.dispatch(
        &create("x")
            .with_header("idempotency-key", "k1")
            .with_header("x-request-id", "one"),
    );
    let retry = harness.gateway.dispatch(
        &create("x")
            .with_header("idempotency-key", "k1")
            .with_header("x-request-id", "two"),
    );
    assert!(retry.replayed);
    assert_eq!(harness.gateway.state().record_count(), 1);
}

#[test]
fn handler_errors_are_replayed_verbatim() {
    let harness = Harness::new();
    let first = harness
        .gateway
        .dispatch(&create("").with_header("idempotency-key", "k1"));
    assert_eq!(first.status, 422);

    let retry = harness
        .gateway
        .dispatch(&create("").with_header("idempotency-key", "k1"));
    assert!(retry.replayed);
    assert_eq!(retry.status, 422);
    assert_eq!(retry.body, first.body);
}

#[test]
fn storage_failures_are_not_replayed() {
    let healthy = Arc::new(AtomicBool::new(false));
    let runs = Arc::new(AtomicUsize::new(0));
    let harness = {
        let (healthy, runs) = (healthy.clone(), runs.clone());
        Harness::with(move |gateway| {
            gateway.mutation("records.touch", move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                if healthy.load(Ordering::SeqCst) {
                    Ok(json!({ "touched": true }))
                } else {
                    Err(HandlerError::Storage(StorageError::Unavailable("db down".into())))
                }
            })
        })
    };
    let touch = ProcedureRequest::new("records.touch", json!({}))
        .with_header("x-tenant-id", "T")
        .with_header("x-user-id", "u1")
        .with_header("idempotency-key", "k1");

    let first = harness.gateway.dispatch(&touch);
    assert_eq!(first.status, 503);

    healthy.store(true, Ordering::SeqCst);
    let retry = harness.gateway.dispatch(&touch);
    assert_eq!(retry.status, 200);
    assert!(!retry.replayed);
    assert_eq!(retry.body, json!({ "touched": true }));

    let again = harness.gateway.dispatch(&touch);
    assert!(again.replayed);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn missing_tenant_is_401() {
    let harness = Harness::new();
    let response = harness.gateway.dispatch(&ProcedureRequest::new(
        "records.create",
        json!({ "name": "x" }),
    ));
    assert_eq!(response.status, 401);
}

#[test]
fn derived_keys_catch_retries_without_a_header() {
    let harness =
        Harness::with(|gateway| gateway.with_idempotency_mode(IdempotencyMode::DeriveWhenMissing));
    harness.gateway.dispatch(&create("x"));
    let retry = harness.gateway.dispatch(&create("x"));
    assert!(retry.replayed);
    assert_eq!(harness.gateway.state().record_count(), 1);

    harness.gateway.dispatch(&create("y"));
    assert_eq!(harness.gateway.state().record_count(), 2);
}

#[test]
fn rate_limit_denies_then_recovers() {
    let harness = Harness::with(|gateway| {
        gateway.with_policy(
            RateLimitPolicy::default().with_operation("records.list", RateLimit::per_minute(2)),
        )
    });
    let list = ProcedureRequest::new("records.list", json!({}))
        .with_header("x-tenant-id", "T")
        .with_client("203.0.113.9");

    assert_eq!(harness.gateway.dispatch(&list).status, 200);
    assert_eq!(harness.gateway.dispatch(&list).status, 200);
    let denied = harness.gateway.dispatch(&list);
    assert_eq!(denied.status, 429);
    assert_eq!(denied.body["limit"], 2);
    assert!(denied.body["retryAfter"].as_u64().unwrap() >= 1);

    // Another tenant from the same address has its own budget.
    let other = list.clone().with_header("x-tenant-id", "U");
    assert_eq!(harness.gateway.dispatch(&other).status, 200);

    harness.clock.advance(Duration::from_secs(31));
    assert_eq!(harness.gateway.dispatch(&list).status, 200);
}

#[test]
fn unknown_procedure_touches_nothing() {
    let harness = Harness::new();
    let response = harness
        .gateway
        .dispatch(&ProcedureRequest::new("records.delete", json!({})));
    assert_eq!(response.status, 404);
    assert!(harness.kv.is_empty());
}

#[test]
fn storage_outage_is_503() {
    let harness = Harness::new();
    harness.kv.simulate_outage(true);
    let response = harness.gateway.dispatch(&create("x"));
    assert_eq!(response.status, 503);
    assert_eq!(harness.gateway.state().record_count(), 0);
}

#[test]
fn sweep_reports_purged_entries() {
    let harness = Harness::new();
    harness
        .gateway
        .dispatch(&create("x").with_header("idempotency-key", "k1"));
    harness.clock.advance(Duration::from_secs(25 * 60 * 60));

    let report = harness.gateway.sweep().unwrap();
    assert_eq!(report.idempotency_purged, 1);
    assert_eq!(report.buckets_evicted, 1);
}
