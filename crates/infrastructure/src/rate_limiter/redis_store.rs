//! Redis sorted-set backed sliding window store

use std::sync::{Arc, Weak};
use std::time::Duration;

use analysis_core::{RateLimitStore, WindowAdmission, WorkerError, WorkerResult};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Prune, count and conditional record executed server-side in one step.
///
/// KEYS[1] window key, ARGV: window_start, now, limit, member, ttl_seconds.
/// Returns `{allowed, count}` where count includes the new entry when admitted.
const TRY_ACQUIRE_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
if count < tonumber(ARGV[3]) then
    redis.call('ZADD', KEYS[1], ARGV[2], ARGV[4])
    redis.call('EXPIRE', KEYS[1], ARGV[5])
    return {1, count + 1}
end
return {0, count}
"#;

/// Retries inside one connection attempt; later outages are retried by the manager itself
const CONNECT_RETRIES: usize = 1;

/// Store operations fail with `WorkerError::RateLimitStore` until the first connection
/// has been established.
pub struct RedisRateLimitStore {
    client: redis::Client,
    connection: RwLock<Option<ConnectionManager>>,
    connect_timeout: Duration,
    script: redis::Script,
}

impl RedisRateLimitStore {
    /// Parse the URL without touching the network
    pub fn new(url: &str, connect_timeout: Duration) -> WorkerResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| WorkerError::RateLimitStore(format!("Invalid Redis URL: {e}")))?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            connect_timeout,
            script: redis::Script::new(TRY_ACQUIRE_SCRIPT),
        })
    }

    /// Make one bounded connection attempt and verify the server answers PING
    pub async fn establish(&self) -> WorkerResult<()> {
        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(CONNECT_RETRIES)
            .set_connection_timeout(self.connect_timeout)
            .set_response_timeout(self.connect_timeout);

        let mut connection = tokio::time::timeout(
            self.connect_timeout * (CONNECT_RETRIES as u32 + 1),
            self.client.get_connection_manager_with_config(manager_config),
        )
        .await
        .map_err(|_| WorkerError::RateLimitStore("Timed out connecting to Redis".to_string()))?
        .map_err(|e| WorkerError::RateLimitStore(format!("Failed to connect to Redis: {e}")))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| WorkerError::RateLimitStore(e.to_string()))?;

        *self.connection.write().await = Some(connection);
        info!("Rate limit store connected");
        Ok(())
    }

    /// Keep calling `establish` every `retry_delay` until it succeeds or the store is dropped
    pub fn connect_in_background(self: &Arc<Self>, retry_delay: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let Some(current) = store.upgrade() else {
                    return;
                };
                attempt = attempt.saturating_add(1);

                match current.establish().await {
                    Ok(()) => return,
                    Err(e) => warn!(
                        attempt,
                        "Rate limit store unavailable, admission fails open until connected: {e}"
                    ),
                }
                drop(current);

                tokio::time::sleep(retry_delay).await;
            }
        })
    }

    async fn connection(&self) -> WorkerResult<ConnectionManager> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| WorkerError::RateLimitStore("Redis connection not established".to_string()))
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn try_acquire(
        &self,
        key: &str,
        now_ms: i64,
        window_start_ms: i64,
        limit: u32,
        member: &str,
        ttl_seconds: u64,
    ) -> WorkerResult<WindowAdmission> {
        let mut conn = self.connection().await?;

        let (allowed, count): (i64, u64) = self
            .script
            .key(key)
            .arg(window_start_ms)
            .arg(now_ms)
            .arg(limit)
            .arg(member)
            .arg(ttl_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| WorkerError::RateLimitStore(e.to_string()))?;

        debug!("Rate limit window {}: allowed={} count={}", key, allowed, count);

        Ok(WindowAdmission {
            allowed: allowed == 1,
            count,
        })
    }

    async fn window_count(&self, key: &str, window_start_ms: i64) -> WorkerResult<u64> {
        let mut conn = self.connection().await?;

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(window_start_ms)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| WorkerError::RateLimitStore(e.to_string()))?;

        Ok(count)
    }

    async fn clear(&self, key: &str) -> WorkerResult<()> {
        let mut conn = self.connection().await?;

        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| WorkerError::RateLimitStore(e.to_string()))?;

        Ok(())
    }

    async fn ping(&self) -> WorkerResult<()> {
        let mut conn = self.connection().await?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| WorkerError::RateLimitStore(e.to_string()))?;

        Ok(())
    }
}
