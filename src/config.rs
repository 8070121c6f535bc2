//! Process configuration: a TOML file, then environment overrides.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//!
//! [storage]
//! backend = "sqlite"
//! path = "relay.db"
//!
//! [delivery]
//! sink_url = "https://hooks.example.com/relay"
//! signing_secret = "change-me"
//!
//! [rate_limit.operations."records.import"]
//! limit = 5
//! window_ms = 60000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::idempotency::{IdempotencyMode, IdempotencySettings, DEFAULT_HEADER_WHITELIST};
use crate::outbox::{
    DeliverySettings, DEFAULT_LEASE_SECS, DEFAULT_MAX_ATTEMPTS, DEFAULT_USER_AGENT,
};
use crate::ratelimit::{PolicyError, RateLimitPolicy};

/// Upper bound for every duration setting: ten years.
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {name}: {value}")]
    Env { name: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub delivery: DeliveryConfig,
    pub idempotency: IdempotencyConfig,
    pub rate_limit: RateLimitPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database file for the `sqlite` backend.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// No URL means every event is marked delivered without a request.
    pub sink_url: Option<String>,
    pub signing_secret: Option<String>,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub batch_limit: usize,
    pub concurrency: usize,
    pub max_attempts: u32,
    /// Must cover a whole tick, see [`DeliverySettings::min_lease`].
    pub lease_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            sink_url: None,
            signing_secret: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_secs: 30,
            batch_limit: 50,
            concurrency: 4,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease_secs: DEFAULT_LEASE_SECS,
        }
    }
}

impl DeliveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn settings(&self) -> DeliverySettings {
        DeliverySettings {
            batch_limit: self.batch_limit,
            concurrency: self.concurrency,
            lease: Duration::from_secs(self.lease_secs),
            timeout: self.timeout(),
            user_agent: self.user_agent.clone(),
            ..DeliverySettings::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub ttl_secs: u64,
    pub pending_timeout_secs: u64,
    pub wait_ms: u64,
    pub header_whitelist: Vec<String>,
    /// Derive a key for mutations sent without `Idempotency-Key`.
    pub derive_keys: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            pending_timeout_secs: 60,
            wait_ms: 5_000,
            header_whitelist: DEFAULT_HEADER_WHITELIST
                .iter()
                .map(|h| h.to_string())
                .collect(),
            derive_keys: false,
        }
    }
}

impl IdempotencyConfig {
    pub fn settings(&self) -> IdempotencySettings {
        IdempotencySettings {
            ttl: Duration::from_secs(self.ttl_secs),
            pending_timeout: Duration::from_secs(self.pending_timeout_secs),
            wait: Duration::from_millis(self.wait_ms),
            ..IdempotencySettings::default()
        }
    }

    pub fn mode(&self) -> IdempotencyMode {
        if self.derive_keys {
            IdempotencyMode::DeriveWhenMissing
        } else {
            IdempotencyMode::HeaderOnly
        }
    }
}

impl RelayConfig {
    /// Read `path` if given (defaults otherwise), apply `RELAY_*` environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `RELAY_BIND`, `RELAY_DB_PATH`, `RELAY_SINK_URL`,
    /// `RELAY_SIGNING_SECRET` and `RELAY_MAX_ATTEMPTS`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(bind) = lookup("RELAY_BIND") {
            self.server.bind = bind;
        }
        if let Some(path) = lookup("RELAY_DB_PATH") {
            self.storage.backend = StorageBackend::Sqlite;
            self.storage.path = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("RELAY_SINK_URL") {
            self.delivery.sink_url = Some(url).filter(|url| !url.is_empty());
        }
        if let Some(secret) = lookup("RELAY_SIGNING_SECRET") {
            self.delivery.signing_secret = Some(secret);
        }
        if let Some(value) = lookup("RELAY_MAX_ATTEMPTS") {
            self.delivery.max_attempts = value.trim().parse().map_err(|_| ConfigError::Env {
                name: "RELAY_MAX_ATTEMPTS",
                value,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.delivery.sink_url {
            reqwest::Url::parse(url)
                .map_err(|e| ConfigError::Invalid(format!("delivery.sink_url {url:?}: {e}")))?;
            if self
                .delivery
                .signing_secret
                .as_deref()
                .map_or(true, str::is_empty)
            {
                return Err(ConfigError::Invalid(
                    "delivery.signing_secret is required when sink_url is set".into(),
                ));
            }
        }
        if self.delivery.batch_limit == 0 {
            return Err(ConfigError::Invalid("delivery.batch_limit must be positive".into()));
        }
        if self.delivery.concurrency == 0 {
            return Err(ConfigError::Invalid("delivery.concurrency must be positive".into()));
        }
        if self.delivery.max_attempts == 0 {
            return Err(ConfigError::Invalid("delivery.max_attempts must be positive".into()));
        }
        if self.delivery.timeout_secs == 0 {
            return Err(ConfigError::Invalid("delivery.timeout_secs must be positive".into()));
        }
        let durations = [
            ("delivery.timeout_secs", self.delivery.timeout_secs),
            ("delivery.lease_secs", self.delivery.lease_secs),
            ("idempotency.ttl_secs", self.idempotency.ttl_secs),
            ("idempotency.pending_timeout_secs", self.idempotency.pending_timeout_secs),
            ("idempotency.wait_ms", self.idempotency.wait_ms / 1000),
        ];
        for (name, secs) in durations {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{name} is longer than {MAX_DURATION_SECS}s"
                )));
            }
        }
        let min_lease = self.delivery.settings().min_lease();
        if Duration::from_secs(self.delivery.lease_secs) < min_lease {
            return Err(ConfigError::Invalid(format!(
                "delivery.lease_secs must be at least {}s (timeout_secs x ceil(batch_limit / concurrency))",
                min_lease.as_secs()
            )));
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.is_none() {
            return Err(ConfigError::Invalid(
                "storage.path is required for the sqlite backend".into(),
            ));
        }
        self.rate_limit.validate()?;
        Ok(())
    }
}
