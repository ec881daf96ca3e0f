use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{WorkerError, WorkerResult};

fn default_attempt_number() -> u32 {
    1
}

/// 植物图像分析任务消息
///
/// 除 `analysis_id`、`provider` 和 `attemptNumber` 外的字段（图片地址、农户和田块上下文等）
/// 原样保存在 `payload` 中，交给提供商适配器解释。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub analysis_id: String,

    /// 生产者指定的提供商提示，MESSAGE_BASED 策略使用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(
        rename = "attemptNumber",
        alias = "attempt_number",
        default = "default_attempt_number"
    )]
    pub attempt_number: u32,

    /// 消费该消息的队列名称，由网关在解析后填写
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_queue: Option<String>,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl JobMessage {
    pub fn new(analysis_id: impl Into<String>) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            provider: None,
            attempt_number: default_attempt_number(),
            source_queue: None,
            payload: Map::new(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// 从队列投递的原始字节解析任务消息
    pub fn from_bytes(data: &[u8]) -> WorkerResult<Self> {
        let message: JobMessage = serde_json::from_slice(data)
            .map_err(|e| WorkerError::InvalidMessage(format!("JSON解析失败: {e}")))?;

        if message.analysis_id.trim().is_empty() {
            return Err(WorkerError::InvalidMessage(
                "analysis_id不能为空".to_string(),
            ));
        }

        Ok(message)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
