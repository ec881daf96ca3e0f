//! Distributed sliding-window rate limiter
//!
//! Every worker instance shares one window per provider in the backing store. Each
//! admission check prunes entries older than the window, counts what remains and records
//! the current call only when the count is below the limit, all as one atomic step.
//!
//! When the store cannot be reached, admission **fails open**: the call is allowed and the
//! failure is logged. An outage of the store degrades to unlimited dispatch rather than
//! stopping the pipeline.

mod memory_store;
mod redis_store;

pub use memory_store::InMemoryRateLimitStore;
pub use redis_store::RedisRateLimitStore;

use analysis_core::config::RateLimiterConfig;
use analysis_core::{RateLimitStore, WorkerResult};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 1000;
const BACKOFF_JITTER_MS: u64 = 100;

/// Snapshot of one provider's window
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    pub provider: String,
    pub current_count: u64,
    pub limit: u32,
    /// Epoch milliseconds; entries at or before this instant no longer count
    pub window_start: i64,
    pub window_duration_ms: u64,
    pub allowed: bool,
}

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimiterConfig,
    connect_task: Option<JoinHandle<()>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimiterConfig) -> Self {
        Self {
            store,
            config,
            connect_task: None,
        }
    }

    /// Build a limiter backed by the Redis instance at `config.url`.
    ///
    /// Returns without waiting for Redis. The connection is established in the background and
    /// admission fails open until it is up. Only an unparseable URL is an error.
    pub fn redis(config: RateLimiterConfig) -> WorkerResult<Self> {
        let store = Arc::new(RedisRateLimitStore::new(
            &config.url,
            Duration::from_millis(config.connect_timeout_ms),
        )?);
        let connect_task =
            store.connect_in_background(Duration::from_millis(config.reconnect_delay_ms));

        info!(
            "Rate limiter initialized (prefix: {}, window: {}ms)",
            config.key_prefix, config.window_ms
        );

        Ok(Self {
            store,
            config,
            connect_task: Some(connect_task),
        })
    }

    fn window_start(&self, now_ms: i64) -> i64 {
        now_ms - self.config.window_ms as i64
    }

    /// Check and record one call for `provider`
    pub async fn check_admission(&self, provider: &str, limit_per_minute: u32) -> bool {
        self.check_admission_at(provider, limit_per_minute, Utc::now().timestamp_millis())
            .await
    }

    pub async fn check_admission_at(
        &self,
        provider: &str,
        limit_per_minute: u32,
        now_ms: i64,
    ) -> bool {
        let key = self.config.key_for(provider);
        let member = format!("{now_ms}-{}", Uuid::new_v4());

        match self
            .store
            .try_acquire(
                &key,
                now_ms,
                self.window_start(now_ms),
                limit_per_minute,
                &member,
                self.config.key_ttl_seconds,
            )
            .await
        {
            Ok(admission) if admission.allowed => {
                debug!(
                    provider,
                    count = admission.count,
                    limit = limit_per_minute,
                    "Rate limit check passed"
                );
                true
            }
            Ok(admission) => {
                warn!(
                    provider,
                    count = admission.count,
                    limit = limit_per_minute,
                    "Rate limit exceeded"
                );
                metrics::counter!("analysis_rate_limit_rejections_total", "provider" => provider.to_string())
                    .increment(1);
                false
            }
            Err(e) => {
                error!(provider, "Rate limit check failed, allowing request: {e}");
                metrics::counter!("analysis_rate_limit_fail_open_total", "provider" => provider.to_string())
                    .increment(1);
                true
            }
        }
    }

    /// Current window usage for monitoring. Prunes first, never records.
    pub async fn get_state(&self, provider: &str, limit_per_minute: u32) -> RateLimitState {
        self.get_state_at(provider, limit_per_minute, Utc::now().timestamp_millis())
            .await
    }

    pub async fn get_state_at(
        &self,
        provider: &str,
        limit_per_minute: u32,
        now_ms: i64,
    ) -> RateLimitState {
        let window_start = self.window_start(now_ms);
        let key = self.config.key_for(provider);

        let current_count = match self.store.window_count(&key, window_start).await {
            Ok(count) => count,
            Err(e) => {
                error!(provider, "Failed to read rate limit state: {e}");
                0
            }
        };

        RateLimitState {
            provider: provider.to_string(),
            current_count,
            limit: limit_per_minute,
            window_start,
            window_duration_ms: self.config.window_ms,
            allowed: current_count < u64::from(limit_per_minute),
        }
    }

    pub async fn get_all_states(&self, providers: &[(String, u32)]) -> Vec<RateLimitState> {
        let mut states = Vec::with_capacity(providers.len());
        for (provider, limit) in providers {
            states.push(self.get_state(provider, *limit).await);
        }
        states
    }

    /// Drop every recorded call for `provider`
    pub async fn reset(&self, provider: &str) -> WorkerResult<()> {
        self.store.clear(&self.config.key_for(provider)).await?;
        info!(provider, "Rate limit window reset");
        Ok(())
    }

    /// Poll `check_admission` with capped exponential backoff and jitter until admitted
    /// or `max_wait` has elapsed. Returns false on timeout.
    pub async fn wait_for_admission(
        &self,
        provider: &str,
        limit_per_minute: u32,
        max_wait: Duration,
    ) -> bool {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if self.check_admission(provider, limit_per_minute).await {
                if attempt > 0 {
                    debug!(provider, attempt, "Admitted after waiting {:?}", started.elapsed());
                }
                return true;
            }

            let elapsed = started.elapsed();
            if elapsed >= max_wait {
                warn!(provider, "Rate limit wait timed out after {:?}", elapsed);
                return false;
            }

            let delay = backoff_delay(attempt).min(max_wait - elapsed);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    pub async fn health_check(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                error!("Rate limiter health check failed: {e}");
                false
            }
        }
    }

    pub async fn close(&self) {
        if let Some(task) = &self.connect_task {
            task.abort();
        }
        info!("Rate limiter closed");
    }
}

/// `min(100 * 2^attempt, 1000)` ms plus up to 100 ms of random jitter
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(BACKOFF_CAP_MS);
    let jitter = rand::rng().random_range(0..BACKOFF_JITTER_MS);
    Duration::from_millis(base + jitter)
}
