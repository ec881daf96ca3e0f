use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use analysis_core::config::WorkerConfig;
use analysis_core::{
    AnalysisProvider, JobHandler, JobMessage, ResultPublisher, WorkerError, WorkerResult,
};
use analysis_dispatcher::ProviderSelector;
use analysis_infrastructure::RateLimiter;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// 分发计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub processed: u64,
    pub failed: u64,
    pub rate_limited: u64,
}

impl DispatchStats {
    pub fn total(&self) -> u64 {
        self.processed + self.failed
    }
}

/// 分发循环：选择提供商、等待限流许可、调用适配器并发布结果
///
/// 作为 [`JobHandler`] 注册到队列网关。返回错误时网关负责写入死信队列并拒绝消息。
pub struct DispatchService {
    selector: Arc<ProviderSelector>,
    rate_limiter: Arc<RateLimiter>,
    providers: HashMap<String, Arc<dyn AnalysisProvider>>,
    publisher: Arc<dyn ResultPublisher>,
    config: WorkerConfig,
    processed: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
}

impl DispatchService {
    pub fn new(
        selector: Arc<ProviderSelector>,
        rate_limiter: Arc<RateLimiter>,
        providers: HashMap<String, Arc<dyn AnalysisProvider>>,
        publisher: Arc<dyn ResultPublisher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            selector,
            rate_limiter,
            providers,
            publisher,
            config,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.rate_limited.store(0, Ordering::Relaxed);
        info!("分发计数已重置");
    }

    pub fn providers(&self) -> &HashMap<String, Arc<dyn AnalysisProvider>> {
        &self.providers
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn rate_limit_for(&self, provider: &str) -> u32 {
        self.config.rate_limit_for(provider)
    }

    async fn dispatch(&self, job: &JobMessage, provider: &str, started: Instant) -> WorkerResult<()> {
        let limit = self.rate_limit_for(provider);
        let max_wait = Duration::from_millis(self.config.rate_limit_max_wait_ms);

        if !self
            .rate_limiter
            .wait_for_admission(provider, limit, max_wait)
            .await
        {
            self.rate_limited.fetch_add(1, Ordering::Relaxed);
            return Err(WorkerError::RateLimitExceeded {
                provider: provider.to_string(),
                waited_ms: elapsed_ms(started),
            });
        }

        let adapter = self
            .providers
            .get(provider)
            .ok_or_else(|| WorkerError::ProviderUnavailable(provider.to_string()))?;

        let mut result = adapter.analyze(job).await.map_err(|e| match e.provider() {
            Some(_) => e,
            None => WorkerError::provider_error(provider, e.to_string()),
        })?;

        let elapsed = elapsed_ms(started);
        result.stamp(provider, elapsed);

        self.publisher.publish_result(&result).await?;

        metrics::histogram!("analysis_processing_duration_ms", "provider" => provider.to_string())
            .record(elapsed as f64);
        debug!(
            analysis_id = %job.analysis_id,
            provider,
            elapsed_ms = elapsed,
            "分析结果已发布"
        );
        Ok(())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl JobHandler for DispatchService {
    async fn handle(&self, job: JobMessage) -> WorkerResult<()> {
        let started = Instant::now();
        let provider = self.selector.select_provider(job.provider.as_deref());

        info!(
            analysis_id = %job.analysis_id,
            provider = %provider,
            attempt = job.attempt_number,
            queue = job.source_queue.as_deref().unwrap_or("-"),
            "开始处理分析任务"
        );

        match self.dispatch(&job, &provider, started).await {
            Ok(()) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("analysis_jobs_processed_total", "provider" => provider.clone())
                    .increment(1);
                info!(
                    analysis_id = %job.analysis_id,
                    provider = %provider,
                    "分析任务处理完成"
                );
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("analysis_jobs_failed_total", "provider" => provider.clone())
                    .increment(1);
                if matches!(e, WorkerError::RateLimitExceeded { .. }) {
                    warn!(analysis_id = %job.analysis_id, provider = %provider, "{e}");
                } else {
                    error!(analysis_id = %job.analysis_id, provider = %provider, "分析任务处理失败: {e}");
                }
                Err(e)
            }
        }
    }
}
