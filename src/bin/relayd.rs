//! relayd: the relay gateway as a standalone HTTP server.
//!
//! Usage: `relayd [config.toml]` (or `RELAY_CONFIG=...`). Without a file the
//! defaults apply: in-memory storage, no sink, bound to 127.0.0.1:8080.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use relaygate::config::{StorageBackend, StorageConfig};
use relaygate::gateway::{self, Context, HandlerError};
use relaygate::outbox::{DeliveryTrigger, HttpSink};
use relaygate::{
    Clock, DeliveryWorker, Gateway, IdempotencyStore, InMemoryKv, KeyValueStore, OutboxStore,
    RateLimiter, RelayConfig, Signer, SystemClock,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

/// State handed to the built-in procedures.
struct App {
    outbox: Arc<OutboxStore>,
}

#[derive(Deserialize)]
struct PublishInput {
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct ExhaustedInput {
    #[serde(default = "default_exhausted_limit")]
    limit: usize,
}

fn default_exhausted_limit() -> usize {
    100
}

fn publish(ctx: &Context<App>) -> Result<Value, HandlerError> {
    let tenant = ctx.tenant_id()?;
    let input = ctx.input::<PublishInput>()?;
    if input.event.trim().is_empty() {
        return Err(HandlerError::Rejected("event name must not be empty".into()));
    }
    let event_id = ctx.state().outbox.append(tenant, &input.event, input.payload)?;
    Ok(json!({ "event_id": event_id }))
}

fn exhausted(ctx: &Context<App>) -> Result<Value, HandlerError> {
    let tenant = ctx.tenant_id()?;
    let limit = if ctx.raw_input().is_null() {
        default_exhausted_limit()
    } else {
        ctx.input::<ExhaustedInput>()?.limit
    };
    let events: Vec<_> = ctx
        .state()
        .outbox
        .exhausted(usize::MAX)?
        .into_iter()
        .filter(|event| event.tenant_id == tenant)
        .take(limit)
        .collect();
    Ok(json!({ "events": events }))
}

fn open_storage(config: &StorageConfig) -> Result<Arc<dyn KeyValueStore>, Box<dyn Error>> {
    match config.backend {
        StorageBackend::Memory => {
            warn!("using in-memory storage; nothing survives a restart");
            Ok(Arc::new(InMemoryKv::new()))
        }
        #[cfg(feature = "sqlite")]
        StorageBackend::Sqlite => {
            let path = config
                .path
                .as_deref()
                .ok_or("storage.path is required for the sqlite backend")?;
            info!(path = %path.display(), "opening sqlite storage");
            Ok(Arc::new(relaygate::SqliteKv::open(path)?))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageBackend::Sqlite => Err("relayd was built without the sqlite feature".into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RELAY_CONFIG").ok())
        .map(PathBuf::from);
    let config = RelayConfig::load(path.as_deref())?;

    let kv = open_storage(&config.storage)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let outbox = Arc::new(
        OutboxStore::new(kv.clone(), clock.clone())
            .with_max_attempts(config.delivery.max_attempts),
    );
    let limiter = Arc::new(RateLimiter::new(kv.clone(), clock.clone()));
    let idempotency = Arc::new(
        IdempotencyStore::new(kv, clock.clone()).with_settings(config.idempotency.settings()),
    );

    let mut worker = DeliveryWorker::<HttpSink>::new(outbox.clone(), clock)
        .with_settings(config.delivery.settings());
    match (&config.delivery.sink_url, &config.delivery.signing_secret) {
        (Some(url), Some(secret)) => {
            let sink = HttpSink::new(url.as_str(), config.delivery.timeout())?;
            worker = worker.with_sink(sink, Signer::new(secret.as_str())?);
            info!(sink = %url, "webhook delivery enabled");
        }
        _ => info!("no sink configured; events are marked delivered without a request"),
    }
    let delivery: Arc<dyn DeliveryTrigger> = Arc::new(worker);

    let gateway = Gateway::new(App { outbox }, limiter, idempotency)
        .with_policy(config.rate_limit.clone())
        .with_header_whitelist(config.idempotency.header_whitelist.iter().cloned())
        .with_idempotency_mode(config.idempotency.mode())
        .mutation_guarded(
            "events.publish",
            |ctx| ctx.has_field("event"),
            publish,
        )
        .query("outbox.exhausted", exhausted);

    let app = gateway::router(Arc::new(gateway), Some(delivery));
    gateway::serve(app, &config.server.bind).await?;
    Ok(())
}
