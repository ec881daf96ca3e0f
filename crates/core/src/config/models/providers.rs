use serde::{Deserialize, Serialize};

fn default_timeout_seconds() -> u64 {
    120
}

/// AI提供商HTTP端点配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEndpointConfig {
    pub endpoint: String,

    /// 保存API密钥的环境变量名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl ProviderEndpointConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key_env: None,
            model: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(anyhow::anyhow!("提供商端点必须是HTTP(S)地址: {}", self.endpoint));
        }

        if self.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("提供商请求超时必须大于0"));
        }

        Ok(())
    }

    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.is_empty())
    }
}
