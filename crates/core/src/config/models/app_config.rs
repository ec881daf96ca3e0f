use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    message_queue::MessageQueueConfig, observability::ObservabilityConfig,
    provider_selection::ProviderSelectionConfig, providers::ProviderEndpointConfig,
    rate_limiter::RateLimiterConfig, worker::WorkerConfig,
};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "ANALYSIS_WORKER";

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/analysis-worker.toml",
    "analysis-worker.toml",
    "/etc/analysis-worker/config.toml",
];

/// Worker configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub message_queue: MessageQueueConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(default)]
    pub provider_selection: ProviderSelectionConfig,
    /// 提供商名称到端点配置，按配置文件中的声明顺序排列
    #[serde(default)]
    pub providers: IndexMap<String, ProviderEndpointConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Built-in defaults
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: ANALYSIS_WORKER__)
    ///
    /// If `config_path` is None the default paths are searched and a missing file is not an error.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.worker.validate().context("Worker配置验证失败")?;

        self.message_queue
            .validate()
            .context("消息队列配置验证失败")?;

        self.rate_limiter.validate().context("限流配置验证失败")?;

        self.provider_selection
            .validate()
            .context("提供商选择配置验证失败")?;

        if self.providers.is_empty() {
            return Err(anyhow::anyhow!("至少需要配置一个AI提供商"));
        }

        for (name, provider) in &self.providers {
            provider
                .validate()
                .with_context(|| format!("提供商 {name} 配置验证失败"))?;

            if self.message_queue.queue_for(name).is_none() {
                return Err(anyhow::anyhow!("提供商 {name} 没有对应的任务队列"));
            }
        }

        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }

    /// Providers the selector may choose from, in declaration order
    pub fn available_providers(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}
