use std::sync::Arc;
use std::time::{Duration, Instant};

use analysis_core::config::RateLimiterConfig;
use analysis_core::{RateLimitStore, WorkerError};
use analysis_infrastructure::{InMemoryRateLimitStore, RateLimiter, RedisRateLimitStore};

fn limiter_with_store() -> (RateLimiter, Arc<InMemoryRateLimitStore>) {
    let store = Arc::new(InMemoryRateLimitStore::new());
    let limiter = RateLimiter::new(store.clone(), RateLimiterConfig::default());
    (limiter, store)
}

#[tokio::test]
async fn test_admits_up_to_limit_then_denies() {
    let (limiter, _) = limiter_with_store();
    let now = 1_700_000_000_000;

    for i in 0..5 {
        assert!(
            limiter.check_admission_at("gemini", 5, now + i).await,
            "call {i} should be admitted"
        );
    }
    assert!(!limiter.check_admission_at("gemini", 5, now + 10).await);

    let state = limiter.get_state_at("gemini", 5, now + 10).await;
    assert_eq!(state.current_count, 5);
    assert_eq!(state.limit, 5);
    assert!(!state.allowed);
}

#[tokio::test]
async fn test_denied_calls_are_not_recorded() {
    let (limiter, store) = limiter_with_store();
    let now = 1_700_000_000_000;

    for _ in 0..3 {
        limiter.check_admission_at("openai", 2, now).await;
    }

    assert_eq!(store.raw_len("ziraai:ratelimit:openai"), 2);
}

#[tokio::test]
async fn test_window_slides_after_sixty_seconds() {
    let (limiter, _) = limiter_with_store();
    let first = 1_700_000_000_000;

    assert!(limiter.check_admission_at("anthropic", 2, first).await);
    assert!(limiter.check_admission_at("anthropic", 2, first + 1_000).await);
    assert!(!limiter.check_admission_at("anthropic", 2, first + 59_999).await);

    // the first entry leaves the window, the second is still inside
    assert!(limiter.check_admission_at("anthropic", 2, first + 60_000).await);
    assert!(!limiter.check_admission_at("anthropic", 2, first + 60_500).await);

    assert!(limiter.check_admission_at("anthropic", 2, first + 120_001).await);
}

#[tokio::test]
async fn test_providers_have_independent_windows() {
    let (limiter, store) = limiter_with_store();
    let now = 1_700_000_000_000;

    assert!(limiter.check_admission_at("openai", 1, now).await);
    assert!(!limiter.check_admission_at("openai", 1, now).await);
    assert!(limiter.check_admission_at("gemini", 1, now).await);

    assert_eq!(store.raw_len("ziraai:ratelimit:openai"), 1);
    assert_eq!(store.raw_len("ziraai:ratelimit:gemini"), 1);
}

#[tokio::test]
async fn test_concurrent_callers_never_exceed_limit() {
    let (limiter, store) = limiter_with_store();
    let limiter = Arc::new(limiter);
    let limit = 50;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            let mut admitted: u32 = 0;
            for _ in 0..10 {
                if limiter.check_admission("openai", limit).await {
                    admitted += 1;
                }
            }
            admitted
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }

    assert_eq!(total, limit);
    assert_eq!(store.raw_len("ziraai:ratelimit:openai"), limit as usize);
}

#[tokio::test]
async fn test_store_outage_fails_open() {
    let (limiter, store) = limiter_with_store();
    store.set_unavailable(true);

    for _ in 0..10 {
        assert!(limiter.check_admission("gemini", 1).await);
    }

    let state = limiter.get_state("gemini", 1).await;
    assert_eq!(state.current_count, 0);
    assert!(state.allowed);

    assert!(!limiter.health_check().await);
    assert!(limiter.reset("gemini").await.is_err());

    store.set_unavailable(false);
    assert!(limiter.health_check().await);
}

#[tokio::test]
async fn test_wait_for_admission_times_out_promptly() {
    let (limiter, _) = limiter_with_store();
    assert!(limiter.check_admission("openai", 1).await);

    let max_wait = Duration::from_millis(400);
    let started = Instant::now();
    let admitted = limiter.wait_for_admission("openai", 1, max_wait).await;
    let elapsed = started.elapsed();

    assert!(!admitted);
    assert!(elapsed >= max_wait, "returned early after {elapsed:?}");
    assert!(
        elapsed < max_wait + Duration::from_millis(250),
        "overshot max wait: {elapsed:?}"
    );
}

#[tokio::test]
async fn test_wait_for_admission_succeeds_when_window_frees() {
    let store = Arc::new(InMemoryRateLimitStore::new());
    let config = RateLimiterConfig {
        window_ms: 300,
        ..RateLimiterConfig::default()
    };
    let limiter = RateLimiter::new(store, config);

    assert!(limiter.check_admission("gemini", 1).await);

    let started = Instant::now();
    assert!(
        limiter
            .wait_for_admission("gemini", 1, Duration::from_secs(3))
            .await
    );
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_wait_for_admission_returns_immediately_when_allowed() {
    let (limiter, _) = limiter_with_store();

    let started = Instant::now();
    assert!(
        limiter
            .wait_for_admission("openai", 10, Duration::from_secs(5))
            .await
    );
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn test_get_all_states() {
    let (limiter, _) = limiter_with_store();
    limiter.check_admission("openai", 10).await;
    limiter.check_admission("openai", 10).await;

    let states = limiter
        .get_all_states(&[("openai".to_string(), 10), ("gemini".to_string(), 20)])
        .await;

    assert_eq!(states.len(), 2);
    assert_eq!(states[0].provider, "openai");
    assert_eq!(states[0].current_count, 2);
    assert_eq!(states[1].provider, "gemini");
    assert_eq!(states[1].current_count, 0);
    assert_eq!(states[1].limit, 20);
    assert_eq!(states[1].window_duration_ms, 60_000);
}

fn unreachable_redis_config() -> RateLimiterConfig {
    RateLimiterConfig {
        url: "redis://127.0.0.1:1".to_string(),
        connect_timeout_ms: 200,
        reconnect_delay_ms: 100,
        ..RateLimiterConfig::default()
    }
}

#[tokio::test]
async fn test_starts_and_admits_without_redis() {
    let started = Instant::now();
    let limiter = RateLimiter::redis(unreachable_redis_config()).unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));

    let admitted = tokio::time::timeout(Duration::from_secs(2), async {
        let mut admitted = 0;
        for _ in 0..5 {
            if limiter.check_admission("gemini", 1).await {
                admitted += 1;
            }
        }
        admitted
    })
    .await
    .expect("admission should not block on an unreachable store");
    assert_eq!(admitted, 5);

    assert!(!limiter.health_check().await);
    assert_eq!(limiter.get_state("gemini", 1).await.current_count, 0);

    limiter.close().await;
}

#[tokio::test]
async fn test_invalid_redis_url_is_rejected() {
    let config = RateLimiterConfig {
        url: "not a url".to_string(),
        ..RateLimiterConfig::default()
    };
    assert!(RateLimiter::redis(config).is_err());
}

#[tokio::test]
async fn test_redis_store_connect_attempt_is_bounded() {
    let store = RedisRateLimitStore::new("redis://127.0.0.1:1", Duration::from_millis(200)).unwrap();

    let started = Instant::now();
    assert!(store.establish().await.is_err());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        store.ping().await,
        Err(WorkerError::RateLimitStore(_))
    ));
}
