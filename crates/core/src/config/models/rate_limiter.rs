use serde::{Deserialize, Serialize};

fn default_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "ziraai:ratelimit:".to_string()
}

fn default_key_ttl_seconds() -> u64 {
    120
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

/// 基于Redis的滑动窗口限流配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default = "default_url")]
    pub url: String,

    /// 每个提供商的键为 `<key_prefix><provider>`
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// 每次记录后刷新的键过期时间
    #[serde(default = "default_key_ttl_seconds")]
    pub key_ttl_seconds: u64,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// 单次连接尝试的超时
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// 首次连接失败后的后台重试间隔，期间限流放行
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            key_prefix: default_key_prefix(),
            key_ttl_seconds: default_key_ttl_seconds(),
            window_ms: default_window_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err(anyhow::anyhow!("Redis URL必须是redis://或rediss://格式"));
        }

        if self.key_prefix.is_empty() {
            return Err(anyhow::anyhow!("限流键前缀不能为空"));
        }

        if self.window_ms == 0 {
            return Err(anyhow::anyhow!("限流窗口长度必须大于0"));
        }

        if self.connect_timeout_ms == 0 || self.reconnect_delay_ms == 0 {
            return Err(anyhow::anyhow!("Redis连接超时和重连间隔必须大于0"));
        }

        if self.key_ttl_seconds * 1000 < self.window_ms {
            return Err(anyhow::anyhow!("限流键过期时间不能短于窗口长度"));
        }

        Ok(())
    }

    pub fn key_for(&self, provider: &str) -> String {
        format!("{}{}", self.key_prefix, provider)
    }
}
