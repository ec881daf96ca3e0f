use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_worker_id() -> String {
    "analysis-worker-001".to_string()
}

fn default_rate_limit_per_minute() -> u32 {
    350
}

fn default_rate_limit_max_wait_ms() -> u64 {
    5000
}

fn default_health_check_interval_seconds() -> u64 {
    30
}

fn default_stats_reset_threshold() -> u64 {
    10_000
}

fn default_shutdown_timeout_seconds() -> u64 {
    30
}

/// Worker配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// 未单独配置的提供商使用的每分钟请求上限
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    #[serde(default)]
    pub provider_rate_limits: BTreeMap<String, u32>,

    /// 等待限流准入的最长时间
    #[serde(default = "default_rate_limit_max_wait_ms")]
    pub rate_limit_max_wait_ms: u64,

    #[serde(default = "default_health_check_interval_seconds")]
    pub health_check_interval_seconds: u64,

    /// 处理消息数达到该值后重置统计计数
    #[serde(default = "default_stats_reset_threshold")]
    pub stats_reset_threshold: u64,

    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            provider_rate_limits: BTreeMap::new(),
            rate_limit_max_wait_ms: default_rate_limit_max_wait_ms(),
            health_check_interval_seconds: default_health_check_interval_seconds(),
            stats_reset_threshold: default_stats_reset_threshold(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(anyhow::anyhow!("Worker ID不能为空"));
        }

        if self.rate_limit_per_minute == 0 {
            return Err(anyhow::anyhow!("每分钟请求上限必须大于0"));
        }

        if let Some((provider, _)) = self.provider_rate_limits.iter().find(|(_, l)| **l == 0) {
            return Err(anyhow::anyhow!("提供商 {provider} 的请求上限必须大于0"));
        }

        if self.health_check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("健康检查间隔必须大于0"));
        }

        if self.stats_reset_threshold == 0 {
            return Err(anyhow::anyhow!("统计重置阈值必须大于0"));
        }

        Ok(())
    }

    /// Per-minute request limit for a provider
    pub fn rate_limit_for(&self, provider: &str) -> u32 {
        self.provider_rate_limits
            .get(provider)
            .copied()
            .unwrap_or(self.rate_limit_per_minute)
    }
}
