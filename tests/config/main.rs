//! Loading `RelayConfig` from disk.

use std::io::Write;
use std::time::Duration;

use relaygate::config::StorageBackend;
use relaygate::idempotency::IdempotencyMode;
use relaygate::ratelimit::ProcedureKind;
use relaygate::{ConfigError, RelayConfig};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn full_file_loads() {
    let file = write_config(
        r#"
        [server]
        bind = "0.0.0.0:9090"

        [storage]
        backend = "sqlite"
        path = "/tmp/relay.db"

        [delivery]
        sink_url = "https://hooks.example.com/relay"
        signing_secret = "whsec"
        timeout_secs = 10
        max_attempts = 5

        [idempotency]
        ttl_secs = 3600
        header_whitelist = ["content-type", "x-api-version"]
        derive_keys = true

        [rate_limit.mutations]
        limit = 10
        window_ms = 60000

        [rate_limit.operations."records.import"]
        limit = 2
        window_ms = 1000
        "#,
    );

    let config = RelayConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.server.bind, "0.0.0.0:9090");
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert_eq!(config.delivery.max_attempts, 5);
    assert_eq!(config.delivery.settings().timeout, Duration::from_secs(10));
    assert_eq!(config.delivery.settings().batch_limit, 50);
    assert_eq!(config.idempotency.settings().ttl, Duration::from_secs(3600));
    assert_eq!(config.idempotency.mode(), IdempotencyMode::DeriveWhenMissing);
    assert_eq!(
        config
            .rate_limit
            .resolve("records.create", Some(ProcedureKind::Mutation))
            .limit,
        10
    );
    assert_eq!(
        config
            .rate_limit
            .resolve("records.import", Some(ProcedureKind::Mutation))
            .window(),
        Duration::from_secs(1)
    );
}

#[test]
fn zero_window_is_rejected() {
    let file = write_config(
        r#"
        [rate_limit.operations."records.import"]
        limit = 2
        window_ms = 0
        "#,
    );
    let err = RelayConfig::load(Some(file.path())).unwrap_err();
    assert!(matches!(err, ConfigError::Policy(_)), "{err}");
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let file = write_config("[delivery\nsink_url = ");
    assert!(matches!(
        RelayConfig::load(Some(file.path())),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn missing_file_is_a_read_error() {
    let err = RelayConfig::load(Some(std::path::Path::new("/nonexistent/relay.toml")))
        .unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}
