use thiserror::Error;

/// 分析Worker错误类型定义
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("消息队列通道未初始化")]
    ChannelNotInitialized,

    #[error("速率限制存储错误: {0}")]
    RateLimitStore(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("无效的消息: {0}")]
    InvalidMessage(String),

    #[error("AI提供商 {provider} 调用失败: {message}")]
    Provider { provider: String, message: String },

    #[error("AI提供商不可用: {0}")]
    ProviderUnavailable(String),

    #[error("Rate limit exceeded after waiting: provider {provider} not admitted within {waited_ms}ms")]
    RateLimitExceeded { provider: String, waited_ms: u64 },

    #[error("网络错误: {0}")]
    Network(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

impl WorkerError {
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn provider_error<P: Into<String>, S: Into<String>>(provider: P, msg: S) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// The provider a failure is attributable to, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            WorkerError::Provider { provider, .. }
            | WorkerError::RateLimitExceeded { provider, .. } => Some(provider),
            WorkerError::ProviderUnavailable(provider) => Some(provider),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        WorkerError::Internal(err.to_string())
    }
}
