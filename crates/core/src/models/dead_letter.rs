use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JobMessage;

/// 死信记录
///
/// `original_message` 在消息可解析时是原始任务消息，否则是原始负载文本。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_message: Value,
    pub error: String,
    pub failure_timestamp: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_provider: Option<String>,
}

impl DeadLetterRecord {
    pub fn for_job(
        job: &JobMessage,
        error: impl Into<String>,
        attempt_count: u32,
        last_provider: Option<String>,
    ) -> Self {
        Self {
            original_message: job.to_value(),
            error: error.into(),
            failure_timestamp: Utc::now(),
            attempt_count,
            last_provider,
        }
    }

    pub fn for_unparseable(raw: &[u8], error: impl Into<String>) -> Self {
        Self {
            original_message: Value::String(String::from_utf8_lossy(raw).into_owned()),
            error: error.into(),
            failure_timestamp: Utc::now(),
            attempt_count: 1,
            last_provider: None,
        }
    }

    pub fn analysis_id(&self) -> Option<&str> {
        self.original_message
            .get("analysis_id")
            .and_then(Value::as_str)
    }

    /// 死信队列上的消息ID: `dlq-<analysis_id>-<epoch_ms>`
    pub fn message_id(&self, epoch_ms: i64) -> String {
        format!("dlq-{}-{}", self.analysis_id().unwrap_or("unknown"), epoch_ms)
    }
}
