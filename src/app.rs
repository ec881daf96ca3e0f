use std::sync::Arc;
use std::time::Duration;

use analysis_core::AppConfig;
use analysis_dispatcher::{ProviderSelector, SelectorConfig};
use analysis_infrastructure::{mask_url, QueueGateway, RateLimiter};
use analysis_worker::{build_provider_adapters, DispatchService, HealthMonitor};
use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::shutdown::ShutdownManager;

/// 分析Worker应用：连接RabbitMQ和Redis，消费提供商队列并分发任务
pub struct Application {
    config: AppConfig,
    gateway: QueueGateway,
    rate_limiter: Arc<RateLimiter>,
    selector: Arc<ProviderSelector>,
    service: Arc<DispatchService>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!(worker_id = %config.worker.worker_id, "初始化分析Worker");

        let rate_limiter = RateLimiter::redis(config.rate_limiter.clone())
            .with_context(|| format!("Redis地址无效: {}", mask_url(&config.rate_limiter.url)))?;
        let rate_limiter = Arc::new(rate_limiter);

        let selector = ProviderSelector::new(SelectorConfig::from_app_config(&config))
            .context("创建提供商选择器失败")?;
        selector.load_metadata_from_config(&config.provider_selection.metadata);
        let selector = Arc::new(selector);

        let adapters = build_provider_adapters(&config).context("创建AI提供商适配器失败")?;

        let gateway = QueueGateway::rabbitmq(config.message_queue.clone());

        let service = Arc::new(DispatchService::new(
            Arc::clone(&selector),
            Arc::clone(&rate_limiter),
            adapters,
            Arc::new(gateway.clone()),
            config.worker.clone(),
        ));

        Ok(Self {
            config,
            gateway,
            rate_limiter,
            selector,
            service,
        })
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, shutdown: &ShutdownManager) -> Result<()> {
        self.gateway
            .connect()
            .await
            .with_context(|| format!("连接RabbitMQ失败: {}", mask_url(&self.config.message_queue.url)))?;

        for provider in self.config.available_providers() {
            let Some(queue) = self.config.message_queue.queue_for(&provider) else {
                warn!(provider = %provider, "提供商没有配置队列，跳过");
                continue;
            };
            self.gateway
                .consume_provider_queue(queue, self.service.clone())
                .await
                .with_context(|| format!("注册队列消费者失败: {queue}"))?;
        }

        let stats = self.selector.get_stats();
        info!(
            worker_id = %self.config.worker.worker_id,
            strategy = %stats.strategy,
            providers = ?stats.available_providers,
            "分析Worker已启动"
        );

        let monitor = HealthMonitor::new(
            self.gateway.clone(),
            Arc::clone(&self.rate_limiter),
            Arc::clone(&self.service),
            Duration::from_secs(self.config.worker.health_check_interval_seconds),
            self.config.worker.stats_reset_threshold,
        )
        .start(shutdown.subscribe());

        let mut shutdown_rx: broadcast::Receiver<()> = shutdown.subscribe();
        let _ = shutdown_rx.recv().await;
        info!("收到关闭信号，停止消费");

        let limit = Duration::from_secs(self.config.worker.shutdown_timeout_seconds);
        shutdown
            .wait_with_timeout("关闭RabbitMQ连接", limit, self.gateway.close())
            .await;
        shutdown
            .wait_with_timeout("关闭速率限制器", limit, self.rate_limiter.close())
            .await;
        if let Err(e) = monitor.await {
            warn!("健康检查任务异常退出: {e}");
        }

        let final_stats = self.service.stats();
        info!(
            processed = final_stats.processed,
            failed = final_stats.failed,
            rate_limited = final_stats.rate_limited,
            "分析Worker已停止"
        );
        Ok(())
    }
}
