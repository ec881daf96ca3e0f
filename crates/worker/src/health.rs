use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use analysis_infrastructure::{QueueGateway, RateLimitState, RateLimiter};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::service::{DispatchService, DispatchStats};

/// 一次健康检查的结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub rabbitmq: bool,
    pub redis: bool,
    pub providers: BTreeMap<String, bool>,
    pub queue_depths: BTreeMap<String, u32>,
    pub rate_limits: Vec<RateLimitState>,
    pub stats: DispatchStats,
}

impl HealthReport {
    /// 消息队列可用即视为健康；限流存储不可用时按放行处理
    pub fn is_healthy(&self) -> bool {
        self.rabbitmq
    }

    pub fn unhealthy_providers(&self) -> Vec<&str> {
        self.providers
            .iter()
            .filter(|(_, healthy)| !**healthy)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// 周期性健康检查任务
pub struct HealthMonitor {
    gateway: QueueGateway,
    rate_limiter: Arc<RateLimiter>,
    service: Arc<DispatchService>,
    check_interval: Duration,
    stats_reset_threshold: u64,
}

impl HealthMonitor {
    pub fn new(
        gateway: QueueGateway,
        rate_limiter: Arc<RateLimiter>,
        service: Arc<DispatchService>,
        check_interval: Duration,
        stats_reset_threshold: u64,
    ) -> Self {
        Self {
            gateway,
            rate_limiter,
            service,
            check_interval,
            stats_reset_threshold,
        }
    }

    pub async fn check_once(&self) -> HealthReport {
        let rabbitmq = self.gateway.health_check().await;
        let redis = self.rate_limiter.health_check().await;

        let mut providers = BTreeMap::new();
        for (name, adapter) in self.service.providers() {
            providers.insert(name.clone(), adapter.health_check().await);
        }

        let mut queue_depths = BTreeMap::new();
        if rabbitmq {
            let config = self.gateway.config();
            let queues = config
                .provider_queues
                .values()
                .chain([&config.results_queue, &config.dead_letter_queue]);
            for queue in queues {
                match self.gateway.get_queue_depth(queue).await {
                    Ok(depth) => {
                        queue_depths.insert(queue.clone(), depth);
                    }
                    Err(e) => warn!(queue = %queue, "获取队列深度失败: {e}"),
                }
            }
        }

        let limits: Vec<(String, u32)> = providers
            .keys()
            .map(|name| (name.clone(), self.service.rate_limit_for(name)))
            .collect();
        let rate_limits = self
            .rate_limiter
            .get_all_states(&limits)
            .await;

        let stats = self.service.stats();
        if self.stats_reset_threshold > 0 && stats.total() >= self.stats_reset_threshold {
            self.service.reset_stats();
        }

        HealthReport {
            worker_id: self.service.worker_id().to_string(),
            timestamp: Utc::now(),
            rabbitmq,
            redis,
            providers,
            queue_depths,
            rate_limits,
            stats,
        }
    }

    /// 启动后台检查任务，收到关闭信号后退出
    pub fn start(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut ticker = interval(self.check_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.check_once().await;
                        log_report(&report);
                    }
                    _ = shutdown_rx.recv() => {
                        info!("健康检查任务已停止");
                        break;
                    }
                }
            }
        })
    }
}

fn log_report(report: &HealthReport) {
    if !report.is_healthy() {
        error!(worker_id = %report.worker_id, "RabbitMQ不可用");
    }
    if !report.redis {
        warn!(worker_id = %report.worker_id, "Redis不可用，限流按放行处理");
    }
    let unhealthy = report.unhealthy_providers();
    if !unhealthy.is_empty() {
        warn!(providers = ?unhealthy, "部分AI提供商不可用");
    }

    info!(
        worker_id = %report.worker_id,
        processed = report.stats.processed,
        failed = report.stats.failed,
        rate_limited = report.stats.rate_limited,
        queue_depths = ?report.queue_depths,
        "Worker健康状态"
    );

    for state in &report.rate_limits {
        metrics::gauge!("analysis_rate_limit_window_count", "provider" => state.provider.clone())
            .set(state.current_count as f64);
    }
    for (queue, depth) in &report.queue_depths {
        metrics::gauge!("analysis_queue_depth", "queue" => queue.clone()).set(f64::from(*depth));
    }
}
