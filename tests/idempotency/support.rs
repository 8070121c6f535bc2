#![allow(dead_code)]

use std::sync::Arc;

use relaygate::idempotency::{request_hash, RequestScope, DEFAULT_HEADER_WHITELIST};
use relaygate::{Clock, IdempotencyStore, InMemoryKv, KeyValueStore, ManualClock};
use serde_json::Value;

pub fn backends() -> Vec<(&'static str, Arc<dyn KeyValueStore>)> {
    let mut backends: Vec<(&'static str, Arc<dyn KeyValueStore>)> =
        vec![("memory", Arc::new(InMemoryKv::new()))];
    #[cfg(feature = "sqlite")]
    backends.push((
        "sqlite",
        Arc::new(relaygate::SqliteKv::open_in_memory().unwrap()),
    ));
    backends
}

pub fn store(kv: Arc<dyn KeyValueStore>) -> (IdempotencyStore, ManualClock) {
    let clock = ManualClock::starting_now();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    (IdempotencyStore::new(kv, shared), clock)
}

pub fn hash(body: &Value) -> String {
    request_hash(body, [("content-type", "application/json")], DEFAULT_HEADER_WHITELIST).unwrap()
}

pub fn scope() -> RequestScope {
    RequestScope {
        method: "POST".into(),
        path: "/rpc/records.create".into(),
        tenant_id: "T".into(),
        user_id: "u1".into(),
    }
}
