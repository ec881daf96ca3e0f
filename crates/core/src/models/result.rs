use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 处理元数据，由分发循环在发布前写入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessingMetadata {
    #[serde(default)]
    pub processing_time_ms: u64,
    #[serde(default)]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_model: Option<String>,
    #[serde(default)]
    pub processing_timestamp: DateTime<Utc>,
    /// 适配器附加的其他字段（parse_success、workflow_version 等）
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 分析结果消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analysis_id: String,
    #[serde(default)]
    pub processing_metadata: ProcessingMetadata,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl AnalysisResult {
    pub fn new(analysis_id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            processing_metadata: ProcessingMetadata::default(),
            payload,
        }
    }

    /// 记录实际使用的提供商、耗时和处理时间
    pub fn stamp(&mut self, provider: &str, elapsed_ms: u64) {
        self.processing_metadata.provider = provider.to_string();
        self.processing_metadata.processing_time_ms = elapsed_ms;
        self.processing_metadata.processing_timestamp = Utc::now();
    }

    /// 结果队列上的消息ID: `<analysis_id>-<epoch_ms>`
    pub fn message_id(&self, epoch_ms: i64) -> String {
        format!("{}-{}", self.analysis_id, epoch_ms)
    }
}
