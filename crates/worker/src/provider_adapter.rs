use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use analysis_core::config::ProviderEndpointConfig;
use analysis_core::{
    AnalysisProvider, AnalysisResult, AppConfig, JobMessage, WorkerError, WorkerResult,
};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

/// 通过HTTP调用AI提供商分析端点的适配器
///
/// 把任务消息原样POST到端点，端点返回的JSON对象即为分析结果。
pub struct HttpProviderAdapter {
    name: String,
    endpoint: String,
    model: Option<String>,
    api_key: Option<String>,
    key_required: bool,
    client: reqwest::Client,
}

impl HttpProviderAdapter {
    pub fn new(name: impl Into<String>, config: &ProviderEndpointConfig) -> WorkerResult<Self> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| WorkerError::config_error(format!("创建HTTP客户端失败: {e}")))?;

        let api_key = config.api_key();
        if config.api_key_env.is_some() && api_key.is_none() {
            warn!(provider = %name, "未找到提供商API密钥，健康检查将失败");
        }

        Ok(Self {
            name,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            key_required: config.api_key_env.is_some(),
            client,
        })
    }

    fn parse_result(&self, job: &JobMessage, body: Value) -> WorkerResult<AnalysisResult> {
        let mut object = match body {
            Value::Object(map) => map,
            other => {
                return Err(WorkerError::provider_error(
                    &self.name,
                    format!("响应不是JSON对象: {other}"),
                ))
            }
        };

        object
            .entry("analysis_id")
            .or_insert_with(|| Value::String(job.analysis_id.clone()));

        let mut result: AnalysisResult = serde_json::from_value(Value::Object(object))
            .map_err(|e| WorkerError::provider_error(&self.name, format!("响应格式无效: {e}")))?;

        if result.processing_metadata.ai_model.is_none() {
            result.processing_metadata.ai_model = self.model.clone();
        }

        Ok(result)
    }
}

#[async_trait]
impl AnalysisProvider for HttpProviderAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(&self, job: &JobMessage) -> WorkerResult<AnalysisResult> {
        debug!(
            provider = %self.name,
            analysis_id = %job.analysis_id,
            "调用AI提供商: {}", self.endpoint
        );

        let mut request = self.client.post(&self.endpoint).json(job);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                WorkerError::provider_error(&self.name, format!("请求超时: {e}"))
            } else {
                WorkerError::Network(format!("{}: {e}", self.endpoint))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(WorkerError::provider_error(
                &self.name,
                format!("HTTP {}: {}", status.as_u16(), text),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| WorkerError::provider_error(&self.name, format!("解析响应失败: {e}")))?;

        self.parse_result(job, body)
    }

    async fn health_check(&self) -> bool {
        !self.key_required || self.api_key.is_some()
    }
}

/// 为配置中的每个提供商创建HTTP适配器
pub fn build_provider_adapters(
    config: &AppConfig,
) -> WorkerResult<HashMap<String, Arc<dyn AnalysisProvider>>> {
    let mut adapters: HashMap<String, Arc<dyn AnalysisProvider>> = HashMap::new();

    for (name, endpoint) in &config.providers {
        let adapter = HttpProviderAdapter::new(name, endpoint)?;
        adapters.insert(name.clone(), Arc::new(adapter));
    }

    info!(count = adapters.len(), "AI提供商适配器已创建");
    Ok(adapters)
}
