//! Same key submitted concurrently, inside one process and across two
//! store instances sharing a backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use relaygate::idempotency::{IdempotencySettings, StoredResponse};
use relaygate::{Clock, IdempotencyError, IdempotencyStore, InMemoryKv, ManualClock};
use serde_json::json;

use crate::support::{backends, hash, scope};

fn slow_create(calls: &AtomicUsize) -> StoredResponse {
    thread::sleep(Duration::from_millis(50));
    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
    StoredResponse::new(201, json!({"record": n}))
}

#[test]
fn concurrent_duplicates_execute_once() {
    for (name, kv) in backends() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let store = Arc::new(IdempotencyStore::new(kv, clock));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));
        let body_hash = hash(&json!({"name": "x"}));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                let body_hash = body_hash.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .get_or_execute("abc123", &body_hash, &scope(), || slow_create(&calls))
                        .unwrap()
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1, "{name}");
        assert_eq!(outcomes.iter().filter(|o| !o.replayed).count(), 1);
        assert!(outcomes.iter().all(|o| o.response == outcomes[0].response));
    }
}

#[test]
fn second_instance_waits_for_the_first() {
    for (name, kv) in backends() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let first = Arc::new(IdempotencyStore::new(kv.clone(), clock.clone()));
        let second = IdempotencyStore::new(kv, clock);
        let calls = Arc::new(AtomicUsize::new(0));

        let running = {
            let calls = calls.clone();
            thread::spawn(move || {
                first
                    .get_or_execute("k", "h", &scope(), || {
                        thread::sleep(Duration::from_millis(200));
                        calls.fetch_add(1, Ordering::SeqCst);
                        StoredResponse::ok(json!({"done": true}))
                    })
                    .unwrap()
            })
        };
        thread::sleep(Duration::from_millis(50));

        let replay = second
            .get_or_execute("k", "h", &scope(), || -> StoredResponse { panic!("must not run twice") })
            .unwrap();
        assert!(replay.replayed, "{name}");
        assert_eq!(replay.response.body, json!({"done": true}));
        assert!(!running.join().unwrap().replayed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn waiting_gives_up_with_in_progress() {
    let kv = Arc::new(InMemoryKv::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
    let first = Arc::new(IdempotencyStore::new(kv.clone(), clock.clone()));
    let impatient = IdempotencyStore::new(kv, clock).with_settings(IdempotencySettings {
        wait: Duration::from_millis(50),
        ..IdempotencySettings::default()
    });

    let running = thread::spawn(move || {
        first
            .get_or_execute("k", "h", &scope(), || {
                thread::sleep(Duration::from_millis(400));
                StoredResponse::ok(json!({}))
            })
            .unwrap()
    });
    thread::sleep(Duration::from_millis(50));

    let err = impatient
        .get_or_execute("k", "h", &scope(), || -> StoredResponse { panic!("must not run") })
        .unwrap_err();
    assert_eq!(err, IdempotencyError::InProgress { key: "k".into() });
    running.join().unwrap();
}

#[test]
fn abandoned_claim_is_reaped() {
    let kv = Arc::new(InMemoryKv::new());
    let clock = ManualClock::starting_now();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let crashed = Arc::new(IdempotencyStore::new(kv.clone(), shared.clone()));
    let survivor = IdempotencyStore::new(kv, shared);

    // A claim whose owner never completes: the handler is still sleeping
    // when the clock jumps past the pending timeout.
    let stuck = {
        let crashed = crashed.clone();
        thread::spawn(move || {
            crashed.get_or_execute("k", "h", &scope(), || {
                thread::sleep(Duration::from_millis(300));
                StoredResponse::ok(json!({"from": "crashed"}))
            })
        })
    };
    thread::sleep(Duration::from_millis(50));
    clock.advance(Duration::from_secs(61));

    let outcome = survivor
        .get_or_execute("k", "h", &scope(), || StoredResponse::ok(json!({"from": "survivor"})))
        .unwrap();
    assert!(!outcome.replayed);
    assert_eq!(outcome.response.body, json!({"from": "survivor"}));

    // The late finisher cannot overwrite the survivor's record.
    let _ = stuck.join().unwrap();
    assert_eq!(
        survivor.get("k").unwrap().unwrap().response.body,
        json!({"from": "survivor"})
    );
}
