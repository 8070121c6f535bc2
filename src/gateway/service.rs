//! Gateway: procedure registry plus the rate-limit and idempotency chain
//! every call passes through.
//!
//! ```ignore
//! let gateway = Gateway::new(app, limiter, idempotency)
//!     .mutation("records.create", |ctx| {
//!         let input = ctx.input::<CreateRecord>()?;
//!         Ok(json!({ "id": ctx.state().create(input)? }))
//!     })
//!     .query("records.list", |ctx| Ok(json!(ctx.state().list()?)));
//!
//! let response = gateway.dispatch(&ProcedureRequest::new("records.create", input));
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use super::context::Context;
use super::error::{GatewayError, HandlerError};
use super::session::Session;
use crate::idempotency::{
    derive_key, request_hash, Execution, IdempotencyError, IdempotencyMode, IdempotencyStore,
    RequestScope, StoredResponse, DEFAULT_HEADER_WHITELIST,
};
use crate::ratelimit::{
    BucketKey, ProcedureKind, RateLimitDecision, RateLimitPolicy, RateLimiter,
    DEFAULT_IDLE_EVICTION,
};

type Guard<R> = Box<dyn Fn(&Context<R>) -> bool + Send + Sync>;
type Handler<R> = Box<dyn Fn(&Context<R>) -> Result<Value, HandlerError> + Send + Sync>;

struct Procedure<R> {
    kind: ProcedureKind,
    guard: Option<Guard<R>>,
    handle: Handler<R>,
}

/// Placeholder for bucket and scope parts the session does not supply.
const ANONYMOUS: &str = "anonymous";

/// An inbound procedure call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureRequest {
    pub procedure: String,
    pub input: Value,
    /// Request headers, lowercased.
    #[serde(default)]
    pub session_variables: HashMap<String, String>,
    /// Network identity of the caller, for rate limiting.
    #[serde(default = "unknown_client")]
    pub client: String,
}

fn unknown_client() -> String {
    "unknown".to_string()
}

impl ProcedureRequest {
    pub fn new(procedure: impl Into<String>, input: Value) -> Self {
        Self {
            procedure: procedure.into(),
            input,
            session_variables: HashMap::new(),
            client: unknown_client(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.session_variables
            .insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureResponse {
    pub status: u16,
    pub body: Value,
    /// Present once the call got past procedure lookup.
    pub rate_limit: Option<RateLimitDecision>,
    /// Served from the idempotency cache.
    pub replayed: bool,
}

impl ProcedureResponse {
    fn from_error(err: &GatewayError, rate_limit: Option<RateLimitDecision>) -> Self {
        Self {
            status: err.status_code(),
            body: err.body(),
            rate_limit,
            replayed: false,
        }
    }
}

/// Counts from [`Gateway::sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub idempotency_purged: usize,
    pub buckets_evicted: usize,
}

/// Routes procedure calls to handlers.
///
/// Every call is rate limited per client, tenant and procedure. Mutations
/// carrying an idempotency key run at most once per key; retries get the
/// first response back. Queries skip idempotency.
pub struct Gateway<R> {
    state: R,
    procedures: HashMap<String, Procedure<R>>,
    limiter: Arc<RateLimiter>,
    idempotency: Arc<IdempotencyStore>,
    policy: RateLimitPolicy,
    header_whitelist: Vec<String>,
    mode: IdempotencyMode,
    idle_eviction: Duration,
}

impl<R: Send + Sync + 'static> Gateway<R> {
    pub fn new(state: R, limiter: Arc<RateLimiter>, idempotency: Arc<IdempotencyStore>) -> Self {
        Self {
            state,
            procedures: HashMap::new(),
            limiter,
            idempotency,
            policy: RateLimitPolicy::default(),
            header_whitelist: DEFAULT_HEADER_WHITELIST
                .iter()
                .map(|h| h.to_string())
                .collect(),
            mode: IdempotencyMode::default(),
            idle_eviction: DEFAULT_IDLE_EVICTION,
        }
    }

    pub fn with_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Headers that take part in the idempotency request hash.
    pub fn with_header_whitelist<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.header_whitelist = headers
            .into_iter()
            .map(|h| h.into().to_ascii_lowercase())
            .collect();
        self
    }

    pub fn with_idempotency_mode(mut self, mode: IdempotencyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Idle time after which [`sweep`](Self::sweep) evicts a rate-limit bucket.
    pub fn with_idle_eviction(mut self, idle: Duration) -> Self {
        self.idle_eviction = idle;
        self
    }

    pub fn mutation<F>(self, name: &str, handler: F) -> Self
    where
        F: Fn(&Context<R>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(name, ProcedureKind::Mutation, None, Box::new(handler))
    }

    pub fn query<F>(self, name: &str, handler: F) -> Self
    where
        F: Fn(&Context<R>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(name, ProcedureKind::Query, None, Box::new(handler))
    }

    /// Register a procedure whose `guard` must accept the context before the
    /// handler runs; rejection is `HandlerError::GuardRejected`.
    pub fn guarded<G, F>(self, name: &str, kind: ProcedureKind, guard: G, handler: F) -> Self
    where
        G: Fn(&Context<R>) -> bool + Send + Sync + 'static,
        F: Fn(&Context<R>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(name, kind, Some(Box::new(guard)), Box::new(handler))
    }

    pub fn mutation_guarded<G, F>(self, name: &str, guard: G, handler: F) -> Self
    where
        G: Fn(&Context<R>) -> bool + Send + Sync + 'static,
        F: Fn(&Context<R>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.guarded(name, ProcedureKind::Mutation, guard, handler)
    }

    pub fn query_guarded<G, F>(self, name: &str, guard: G, handler: F) -> Self
    where
        G: Fn(&Context<R>) -> bool + Send + Sync + 'static,
        F: Fn(&Context<R>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.guarded(name, ProcedureKind::Query, guard, handler)
    }

    fn register(
        mut self,
        name: &str,
        kind: ProcedureKind,
        guard: Option<Guard<R>>,
        handle: Handler<R>,
    ) -> Self {
        self.procedures
            .insert(name.to_string(), Procedure { kind, guard, handle });
        self
    }

    /// Registered procedures, sorted by name.
    pub fn procedures(&self) -> Vec<(&str, ProcedureKind)> {
        let mut names: Vec<(&str, ProcedureKind)> = self
            .procedures
            .iter()
            .map(|(name, procedure)| (name.as_str(), procedure.kind))
            .collect();
        names.sort_by(|a, b| a.0.cmp(b.0));
        names
    }

    pub fn state(&self) -> &R {
        &self.state
    }

    /// Full middleware chain: lookup, rate limit, idempotency, handler.
    pub fn dispatch(&self, request: &ProcedureRequest) -> ProcedureResponse {
        let name = request.procedure.as_str();
        let Some(entry) = self.procedures.get(name) else {
            debug!(procedure = name, "unknown procedure");
            return ProcedureResponse::from_error(
                &GatewayError::UnknownProcedure(name.to_string()),
                None,
            );
        };

        let session = Session::from_map(request.session_variables.clone());
        let tenant = session.tenant_id().unwrap_or(ANONYMOUS).to_string();

        let limit = self.policy.resolve(name, Some(entry.kind));
        let bucket = BucketKey::new(request.client.as_str(), tenant.as_str(), name);
        let decision = match self.limiter.admit(&bucket, limit) {
            Ok(decision) => decision,
            Err(err) => {
                error!(procedure = name, error = %err, "rate limiter storage failed");
                return ProcedureResponse::from_error(&GatewayError::Storage(err), None);
            }
        };
        if !decision.allowed {
            debug!(
                procedure = name,
                bucket = %bucket,
                retry_after = ?decision.retry_after,
                "rate limited"
            );
            return ProcedureResponse::from_error(
                &GatewayError::RateLimited(decision),
                Some(decision),
            );
        }

        let result = match entry.kind {
            ProcedureKind::Query => Ok((
                self.execute(name, entry, request, session).into_response(),
                false,
            )),
            ProcedureKind::Mutation => {
                self.execute_mutation(name, entry, request, session, &tenant)
            }
        };

        match result {
            Ok((response, replayed)) => ProcedureResponse {
                status: response.status,
                body: response.body,
                rate_limit: Some(decision),
                replayed,
            },
            Err(err) => {
                if err.status_code() >= 500 {
                    error!(procedure = name, error = %err, "idempotency layer failed");
                }
                ProcedureResponse::from_error(&err, Some(decision))
            }
        }
    }

    /// Purge expired idempotency records and idle rate-limit buckets.
    pub fn sweep(&self) -> Result<SweepReport, GatewayError> {
        let idempotency_purged = self.idempotency.sweep()?;
        let buckets_evicted = self.limiter.sweep(self.idle_eviction)?;
        Ok(SweepReport {
            idempotency_purged,
            buckets_evicted,
        })
    }

    fn execute_mutation(
        &self,
        name: &str,
        entry: &Procedure<R>,
        request: &ProcedureRequest,
        session: Session,
        tenant: &str,
    ) -> Result<(StoredResponse, bool), GatewayError> {
        let user = session.user_id().unwrap_or(ANONYMOUS).to_string();
        let path = format!("/rpc/{name}");

        let header_key = session.idempotency_key().map(str::to_string);
        let key = match (header_key, self.mode) {
            (Some(key), _) => key,
            (None, IdempotencyMode::DeriveWhenMissing) => {
                derive_key("POST", &path, tenant, &user, &request.input)
                    .map_err(|e| GatewayError::Canonicalize(e.to_string()))?
            }
            (None, IdempotencyMode::HeaderOnly) => {
                return Ok((
                    self.execute(name, entry, request, session).into_response(),
                    false,
                ));
            }
        };

        let headers = request
            .session_variables
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()));
        let hash = request_hash(&request.input, headers, &self.header_whitelist)
            .map_err(|e| GatewayError::Canonicalize(e.to_string()))?;
        let scope = RequestScope {
            method: "POST".to_string(),
            path,
            tenant_id: tenant.to_string(),
            user_id: user.clone(),
        };
        let scoped_key = format!("{tenant}:{user}:{key}");

        let outcome = self
            .idempotency
            .get_or_execute(&scoped_key, &hash, &scope, || {
                self.execute(name, entry, request, session)
            })
            .inspect_err(|err| {
                if matches!(err, IdempotencyError::Conflict { .. }) {
                    warn!(procedure = name, key = %scoped_key, "idempotency conflict");
                }
            })?;
        Ok((outcome.response, outcome.replayed))
    }

    /// Run the handler. Server-side failures (storage outages, 5xx) are
    /// transient: a retry with the same idempotency key runs again.
    fn execute(
        &self,
        name: &str,
        entry: &Procedure<R>,
        request: &ProcedureRequest,
        session: Session,
    ) -> Execution {
        match self.run(name, entry, request.input.clone(), session) {
            Ok(body) => Execution::Final(StoredResponse::ok(body)),
            Err(err) => {
                let response =
                    StoredResponse::new(err.status_code(), json!({ "error": err.to_string() }));
                if response.status >= 500 {
                    warn!(procedure = name, error = %err, "handler failed; response not cached");
                    Execution::Transient(response)
                } else {
                    debug!(procedure = name, error = %err, "handler returned an error");
                    Execution::Final(response)
                }
            }
        }
    }

    fn run(
        &self,
        name: &str,
        entry: &Procedure<R>,
        input: Value,
        session: Session,
    ) -> Result<Value, HandlerError> {
        let ctx = Context::new(name.to_string(), input, session, &self.state);
        if let Some(guard) = &entry.guard {
            if !guard(&ctx) {
                return Err(HandlerError::GuardRejected(name.to_string()));
            }
        }
        (entry.handle)(&ctx)
    }
}
