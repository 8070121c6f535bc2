//! Test application: tenant-scoped records, each creation published to the
//! outbox.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use relaygate::{
    Clock, Gateway, IdempotencyStore, InMemoryKv, ManualClock, OutboxStore, RateLimiter,
};
use serde::{Deserialize, Serialize};

use crate::procedures;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: usize,
    pub tenant_id: String,
    pub name: String,
}

pub struct App {
    pub outbox: Arc<OutboxStore>,
    pub records: Mutex<Vec<Record>>,
}

impl App {
    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

pub struct Harness {
    pub kv: Arc<InMemoryKv>,
    pub clock: ManualClock,
    pub outbox: Arc<OutboxStore>,
    pub gateway: Arc<Gateway<App>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|gateway| gateway)
    }

    /// Build the gateway with both test procedures, then apply `configure`.
    pub fn with(configure: impl FnOnce(Gateway<App>) -> Gateway<App>) -> Self {
        let kv = Arc::new(InMemoryKv::new());
        let clock = ManualClock::starting_now();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());

        let outbox = Arc::new(OutboxStore::new(kv.clone(), shared.clone()));
        let app = App {
            outbox: outbox.clone(),
            records: Mutex::new(Vec::new()),
        };
        let gateway = relaygate::register_procedures!(
            Gateway::new(
                app,
                Arc::new(RateLimiter::new(kv.clone(), shared.clone())),
                Arc::new(IdempotencyStore::new(kv.clone(), shared)),
            ),
            procedures::records_create,
            procedures::records_list,
        );

        Self {
            kv,
            clock,
            outbox,
            gateway: Arc::new(configure(gateway)),
        }
    }
}
