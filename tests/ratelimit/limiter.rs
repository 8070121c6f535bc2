use std::time::Duration;

use relaygate::ratelimit::{BucketKey, ProcedureKind, RateLimit, RateLimitPolicy};

use crate::support::{backends, limiter};

#[test]
fn sixty_first_request_in_window_is_denied() {
    for (name, kv) in backends() {
        let (limiter, clock) = limiter(kv);
        let limit = RateLimit::new(60, Duration::from_secs(60));
        let key = BucketKey::new("203.0.113.9", "T", "records.create");

        for n in 0..60 {
            let decision = limiter.admit(&key, limit).unwrap();
            assert!(decision.allowed, "{name}: request {n} denied");
            assert_eq!(decision.remaining, 59 - n);
            clock.advance(Duration::from_millis(10));
        }

        let denied = limiter.admit(&key, limit).unwrap();
        assert!(!denied.allowed, "{name}");
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after.unwrap() > Duration::ZERO);
        assert!(denied.retry_after_secs().unwrap() >= 1);
    }
}

#[test]
fn tokens_come_back_with_time() {
    for (name, kv) in backends() {
        let (limiter, clock) = limiter(kv);
        let limit = RateLimit::per_minute(2);
        let key = BucketKey::new("c", "T", "op");

        assert!(limiter.admit(&key, limit).unwrap().allowed);
        assert!(limiter.admit(&key, limit).unwrap().allowed);
        let denied = limiter.admit(&key, limit).unwrap();
        assert!(!denied.allowed);
        let wait = denied.retry_after_secs().unwrap();
        assert!((30..=31).contains(&wait), "{name}: {wait}");

        clock.advance(Duration::from_secs(31));
        assert!(limiter.admit(&key, limit).unwrap().allowed, "{name}");
        assert!(!limiter.admit(&key, limit).unwrap().allowed);
    }
}

#[test]
fn buckets_are_isolated_per_tenant_and_client() {
    for (name, kv) in backends() {
        let (limiter, _clock) = limiter(kv);
        let limit = RateLimit::per_minute(1);

        assert!(limiter.admit(&BucketKey::new("c1", "T", "op"), limit).unwrap().allowed);
        assert!(!limiter.admit(&BucketKey::new("c1", "T", "op"), limit).unwrap().allowed);
        assert!(
            limiter.admit(&BucketKey::new("c1", "U", "op"), limit).unwrap().allowed,
            "{name}"
        );
        assert!(limiter.admit(&BucketKey::new("c2", "T", "op"), limit).unwrap().allowed);
        assert!(limiter.admit(&BucketKey::new("c1", "T", "other"), limit).unwrap().allowed);
    }
}

#[test]
fn lowering_capacity_clamps_stored_tokens() {
    for (name, kv) in backends() {
        let (limiter, _clock) = limiter(kv);
        let key = BucketKey::new("c", "T", "op");

        limiter.admit(&key, RateLimit::per_minute(100)).unwrap();
        let decision = limiter.admit(&key, RateLimit::per_minute(5)).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.remaining, 4, "{name}");
    }
}

#[test]
fn sweep_evicts_idle_buckets() {
    for (name, kv) in backends() {
        let (limiter, clock) = limiter(kv);
        let limit = RateLimit::per_minute(10);
        limiter.admit(&BucketKey::new("c", "T", "idle"), limit).unwrap();
        clock.advance(Duration::from_secs(2 * 60 * 60));
        limiter.admit(&BucketKey::new("c", "T", "busy"), limit).unwrap();

        assert_eq!(limiter.sweep(Duration::from_secs(60 * 60)).unwrap(), 1, "{name}");
        assert!(limiter.bucket("c|T|idle").unwrap().is_none());
        assert!(limiter.bucket("c|T|busy").unwrap().is_some());
    }
}

#[test]
fn policy_table_drives_limits() {
    let policy: RateLimitPolicy = toml::from_str(
        r#"
        [default]
        limit = 60
        window_ms = 60000

        [operations."records.import"]
        limit = 1
        window_ms = 60000
        "#,
    )
    .unwrap();
    policy.validate().unwrap();

    let (limiter, _clock) = limiter(std::sync::Arc::new(relaygate::InMemoryKv::new()));
    let import = policy.resolve("records.import", Some(ProcedureKind::Mutation));
    let key = BucketKey::new("c", "T", "records.import");
    assert!(limiter.admit(&key, import).unwrap().allowed);
    assert!(!limiter.admit(&key, import).unwrap().allowed);

    assert_eq!(policy.resolve("records.list", Some(ProcedureKind::Query)).limit, 120);
    assert_eq!(policy.resolve("misc", None).limit, 60);
}

#[test]
fn outage_is_an_error() {
    let kv = std::sync::Arc::new(relaygate::InMemoryKv::new());
    let (limiter, _clock) = limiter(kv.clone());
    kv.simulate_outage(true);
    let err = limiter
        .admit(&BucketKey::new("c", "T", "op"), RateLimit::per_minute(1))
        .unwrap_err();
    assert!(err.is_unavailable());
}
