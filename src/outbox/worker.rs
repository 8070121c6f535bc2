use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::delivery::{DeliveryFailure, DeliveryRequest, DEFAULT_USER_AGENT};
use super::event::{FailureOutcome, OutboxEvent};
use super::sink::DeliverySink;
use super::store::OutboxStore;
use crate::clock::Clock;
use crate::error::StorageError;
use crate::lock::KeyLock;
use crate::signing::Signer;

/// Covers a full default tick: 50 events, 4 at a time, 30s each.
pub const DEFAULT_LEASE_SECS: u64 = 450;

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Identifies this worker in leases.
    pub worker_id: String,
    /// Most events claimed per tick.
    pub batch_limit: usize,
    /// Deliveries in flight at once within a tick.
    pub concurrency: usize,
    /// How long a claimed event stays invisible to other workers.
    pub lease: Duration,
    /// Hard cap on one delivery, whatever the sink does.
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            worker_id: format!("relay-worker-{}", std::process::id()),
            batch_limit: 50,
            concurrency: 4,
            lease: Duration::from_secs(DEFAULT_LEASE_SECS),
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl DeliverySettings {
    /// Longest a tick can keep a claimed event waiting: every round of
    /// `concurrency` deliveries may run into the timeout. Leases shorter
    /// than this can lapse before the event is attempted.
    pub fn min_lease(&self) -> Duration {
        let rounds = self.batch_limit.div_ceil(self.concurrency.max(1));
        self.timeout
            .saturating_mul(u32::try_from(rounds).unwrap_or(u32::MAX))
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Subset of `failed` that ran out of attempts on this tick.
    pub exhausted: usize,
    /// Claimed but abandoned because the tick was cancelled.
    pub cancelled: usize,
    /// Another tick was already running; nothing was touched.
    pub skipped: bool,
}

impl DeliveryReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Delivered => {
                self.processed += 1;
                self.succeeded += 1;
            }
            Outcome::Retrying | Outcome::Unrecorded => {
                self.processed += 1;
                self.failed += 1;
            }
            Outcome::Exhausted => {
                self.processed += 1;
                self.failed += 1;
                self.exhausted += 1;
            }
            Outcome::Cancelled => self.cancelled += 1,
        }
    }
}

enum Outcome {
    Delivered,
    Retrying,
    Exhausted,
    Cancelled,
    /// The attempt finished but its outcome was not written: the store
    /// failed, or the lease had already passed to another worker.
    Unrecorded,
}

/// Turns due outbox events into signed webhook deliveries.
///
/// The worker has no timer of its own: something outside calls
/// [`tick`](Self::tick) (cron, an HTTP endpoint, a loop in `main`). Ticks
/// never overlap; a tick that starts while another is running returns a
/// report with `skipped` set.
pub struct DeliveryWorker<S> {
    outbox: Arc<OutboxStore>,
    clock: Arc<dyn Clock>,
    target: Option<(S, Signer)>,
    settings: DeliverySettings,
    tick_lock: KeyLock,
}

impl<S: DeliverySink> DeliveryWorker<S> {
    /// A worker with no sink: every due event is marked delivered as-is.
    pub fn new(outbox: Arc<OutboxStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            outbox,
            clock,
            target: None,
            settings: DeliverySettings::default(),
            tick_lock: KeyLock::new(),
        }
    }

    pub fn with_sink(mut self, sink: S, signer: Signer) -> Self {
        self.target = Some((sink, signer));
        self
    }

    pub fn with_settings(mut self, settings: DeliverySettings) -> Self {
        if settings.lease < settings.min_lease() {
            warn!(
                lease = ?settings.lease,
                min_lease = ?settings.min_lease(),
                "lease is shorter than a full tick; late events may be claimed twice"
            );
        }
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    pub fn has_sink(&self) -> bool {
        self.target.is_some()
    }

    /// Run one delivery pass. Only a failure to read the outbox is an error;
    /// individual delivery failures are recorded on their events.
    #[instrument(skip_all, fields(worker_id = %self.settings.worker_id))]
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<DeliveryReport, StorageError> {
        let _guard = match self.tick_lock.try_acquire() {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!("delivery tick already running; skipping");
                return Ok(DeliveryReport::skipped());
            }
            Err(err) => {
                warn!(error = %err, "tick lock unusable; skipping");
                return Ok(DeliveryReport::skipped());
            }
        };

        let worker_id = self.settings.worker_id.clone();
        let (limit, lease) = (self.settings.batch_limit, self.settings.lease);
        let events = self
            .store(move |outbox| outbox.claim_due(&worker_id, limit, lease))
            .await
            .inspect_err(|err| error!(error = %err, "could not read due outbox events"))?;

        let mut report = DeliveryReport::default();
        if events.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<Outcome> = stream::iter(events)
            .map(|event| self.deliver_one(event, cancel))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            exhausted = report.exhausted,
            cancelled = report.cancelled,
            "delivery tick finished"
        );
        Ok(report)
    }

    #[instrument(
        skip(self, event, cancel),
        fields(event_id = %event.id, tenant_id = %event.tenant_id, event_name = %event.event_name)
    )]
    async fn deliver_one(&self, event: OutboxEvent, cancel: &CancellationToken) -> Outcome {
        if cancel.is_cancelled() {
            return self.abandon(&event).await;
        }

        let Some((sink, signer)) = &self.target else {
            info!("no sink configured; marking event delivered");
            return self.succeed(&event).await;
        };

        let request = match DeliveryRequest::build(
            &event,
            signer,
            &self.settings.user_agent,
            self.clock.now(),
        ) {
            Ok(request) => request,
            Err(failure) => return self.fail(&event, &failure).await,
        };

        let timeout = self.settings.timeout;
        let attempt = tokio::time::timeout(timeout, sink.deliver(&request));
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.abandon(&event).await,
            result = attempt => result.unwrap_or(Err(DeliveryFailure::Timeout(timeout))),
        };

        match result {
            Ok(()) => {
                info!(attempt = event.attempt_count + 1, "event delivered");
                self.succeed(&event).await
            }
            Err(failure) => self.fail(&event, &failure).await,
        }
    }

    async fn succeed(&self, event: &OutboxEvent) -> Outcome {
        let event_id = event.id.clone();
        match self.store(move |outbox| outbox.mark_delivered(&event_id)).await {
            Ok(()) => Outcome::Delivered,
            Err(err) => {
                error!(event_id = %event.id, error = %err, "could not record delivery");
                Outcome::Unrecorded
            }
        }
    }

    async fn fail(&self, event: &OutboxEvent, failure: &DeliveryFailure) -> Outcome {
        warn!(event_id = %event.id, error = %failure, "delivery attempt failed");
        let worker_id = self.settings.worker_id.clone();
        let event_id = event.id.clone();
        let message = failure.to_string();
        let recorded = self
            .store(move |outbox| outbox.mark_failed_by(&worker_id, &event_id, &message))
            .await;
        match recorded {
            Ok(FailureOutcome::Exhausted { .. }) => Outcome::Exhausted,
            Ok(FailureOutcome::Retrying { .. } | FailureOutcome::Ignored) => Outcome::Retrying,
            Ok(FailureOutcome::LeaseLost) => Outcome::Unrecorded,
            Err(err) => {
                error!(event_id = %event.id, error = %err, "could not record failed delivery");
                Outcome::Unrecorded
            }
        }
    }

    async fn abandon(&self, event: &OutboxEvent) -> Outcome {
        let worker_id = self.settings.worker_id.clone();
        let event_id = event.id.clone();
        if let Err(err) = self
            .store(move |outbox| outbox.release(&worker_id, &event_id))
            .await
        {
            warn!(event_id = %event.id, error = %err, "could not release lease; it will expire");
        }
        Outcome::Cancelled
    }

    /// Run a blocking outbox call off the async runtime.
    async fn store<T, F>(&self, call: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&OutboxStore) -> Result<T, StorageError> + Send + 'static,
    {
        let outbox = self.outbox.clone();
        tokio::task::spawn_blocking(move || call(outbox.as_ref()))
            .await
            .map_err(|err| StorageError::Unavailable(format!("outbox task failed: {err}")))?
    }
}

/// Object-safe handle on a worker, for callers that only need to start a
/// tick (the HTTP layer, schedulers).
pub trait DeliveryTrigger: Send + Sync {
    fn trigger(&self, cancel: CancellationToken)
        -> BoxFuture<'_, Result<DeliveryReport, StorageError>>;
}

impl<S: DeliverySink> DeliveryTrigger for DeliveryWorker<S> {
    fn trigger(
        &self,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<DeliveryReport, StorageError>> {
        Box::pin(async move { self.tick(&cancel).await })
    }
}
