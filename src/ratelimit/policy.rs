use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a procedure changes state. Mutations get the stricter default
/// limit and go through idempotency handling; queries do neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureKind {
    Mutation,
    Query,
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureKind::Mutation => f.write_str("mutation"),
            ProcedureKind::Query => f.write_str("query"),
        }
    }
}

/// `limit` requests per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub window_ms: u64,
}

impl RateLimit {
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window_ms: window.as_millis() as u64,
        }
    }

    pub const fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            window_ms: 60_000,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("rate limit for {scope} must allow at least one request")]
    ZeroLimit { scope: String },
    #[error("rate limit window for {scope} must be positive")]
    ZeroWindow { scope: String },
}

/// Which limit applies to which procedure.
///
/// Resolution order: the procedure's own entry, then the default for its
/// kind, then the global default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub default: RateLimit,
    pub mutations: Option<RateLimit>,
    pub queries: Option<RateLimit>,
    pub operations: BTreeMap<String, RateLimit>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            default: RateLimit::per_minute(60),
            mutations: Some(RateLimit::per_minute(30)),
            queries: Some(RateLimit::per_minute(120)),
            operations: BTreeMap::new(),
        }
    }
}

impl RateLimitPolicy {
    /// Same limit for everything, no per-kind defaults.
    pub fn uniform(limit: RateLimit) -> Self {
        Self {
            default: limit,
            mutations: None,
            queries: None,
            operations: BTreeMap::new(),
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>, limit: RateLimit) -> Self {
        self.operations.insert(operation.into(), limit);
        self
    }

    pub fn resolve(&self, operation: &str, kind: Option<ProcedureKind>) -> RateLimit {
        if let Some(limit) = self.operations.get(operation) {
            return *limit;
        }
        let by_kind = match kind {
            Some(ProcedureKind::Mutation) => self.mutations,
            Some(ProcedureKind::Query) => self.queries,
            None => None,
        };
        by_kind.unwrap_or(self.default)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        let kinds = [("mutations", self.mutations), ("queries", self.queries)];
        let entries = std::iter::once(("default".to_string(), self.default))
            .chain(
                kinds
                    .into_iter()
                    .filter_map(|(scope, limit)| limit.map(|limit| (scope.to_string(), limit))),
            )
            .chain(
                self.operations
                    .iter()
                    .map(|(name, limit)| (name.clone(), *limit)),
            );
        for (scope, limit) in entries {
            if limit.limit == 0 {
                return Err(PolicyError::ZeroLimit { scope });
            }
            if limit.window_ms == 0 {
                return Err(PolicyError::ZeroWindow { scope });
            }
        }
        Ok(())
    }
}

/// Identity of one token bucket. Keeping client, tenant and operation apart
/// stops one noisy caller or endpoint from draining another's budget.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub client: String,
    pub tenant: String,
    pub operation: String,
}

impl BucketKey {
    pub fn new(
        client: impl Into<String>,
        tenant: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            client: client.into(),
            tenant: tenant.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.client, self.tenant, self.operation)
    }
}
