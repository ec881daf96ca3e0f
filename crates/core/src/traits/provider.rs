use async_trait::async_trait;

use crate::models::{AnalysisResult, JobMessage};
use crate::WorkerResult;

/// AI提供商适配器
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// 提供商名称（小写，如 `openai`）
    fn name(&self) -> &str;

    /// 执行图像分析并返回结果消息
    async fn analyze(&self, job: &JobMessage) -> WorkerResult<AnalysisResult>;

    async fn health_check(&self) -> bool {
        true
    }
}

/// 队列网关对每条任务消息调用的处理器
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: JobMessage) -> WorkerResult<()>;
}

/// 结果发布接口
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish_result(&self, result: &AnalysisResult) -> WorkerResult<()>;
}
