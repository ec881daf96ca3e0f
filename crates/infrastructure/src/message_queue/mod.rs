//! 队列网关
//!
//! 负责RabbitMQ连接和通道的生命周期，把提供商队列中的任务消息交给 [`JobHandler`]，
//! 并把分析结果和死信记录发布到对应队列。
//!
//! # 连接状态机
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (error | close) -> Reconnecting -> Connecting -> ...
//! ```
//!
//! 连接出错或关闭后按固定间隔无限重连，重连成功后重新声明所有队列并重新注册消费者。
//! 旧连接上的未确认消息由Broker重新投递。

mod in_memory;
mod rabbitmq;

pub use in_memory::{InMemoryBroker, PublishedMessage};
pub use rabbitmq::RabbitMqConnector;

use analysis_core::config::MessageQueueConfig;
use analysis_core::{
    AnalysisResult, BrokerChannel, BrokerConnector, ConnectionEvent, DeadLetterRecord,
    InboundDelivery, JobHandler, JobMessage, PublishProperties, PublishStatus, QueueSpec,
    ResultPublisher, WorkerError, WorkerResult,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 连接生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

struct ConsumerRegistration {
    queue: String,
    handler: Arc<dyn JobHandler>,
}

struct GatewayInner {
    connector: Arc<dyn BrokerConnector>,
    config: MessageQueueConfig,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    state: watch::Sender<ConnectionState>,
    reconnecting: AtomicBool,
    closing: AtomicBool,
    /// 每建立一次连接加一，用于丢弃旧连接上迟到的事件
    generation: AtomicU64,
    consumers: Mutex<Vec<ConsumerRegistration>>,
    consumer_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// RabbitMQ队列网关
#[derive(Clone)]
pub struct QueueGateway {
    inner: Arc<GatewayInner>,
}

impl QueueGateway {
    pub fn new(connector: Arc<dyn BrokerConnector>, config: MessageQueueConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(GatewayInner {
                connector,
                config,
                channel: RwLock::new(None),
                state,
                reconnecting: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                consumers: Mutex::new(Vec::new()),
                consumer_tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// 使用lapin连接RabbitMQ的网关
    pub fn rabbitmq(config: MessageQueueConfig) -> Self {
        let connector = RabbitMqConnector::new(
            config.url.clone(),
            Duration::from_millis(config.publish_confirm_timeout_ms),
        );
        Self::new(Arc::new(connector), config)
    }

    /// 建立连接、设置预取数量并声明所有队列
    pub async fn connect(&self) -> WorkerResult<()> {
        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Connecting);

        match self.inner.establish().await {
            Ok(()) => {
                self.inner.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                error!("连接RabbitMQ失败 ({}): {e}", self.inner.connector.describe());
                self.inner.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// 以手动确认模式消费指定队列，重连后自动重新注册
    pub async fn consume_provider_queue(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
    ) -> WorkerResult<()> {
        let channel = self.inner.current_channel().await?;
        let generation = self.inner.generation.load(Ordering::SeqCst);

        self.inner
            .start_consumer(channel, queue.to_string(), Arc::clone(&handler), generation)
            .await?;

        self.inner.consumers.lock().await.push(ConsumerRegistration {
            queue: queue.to_string(),
            handler,
        });

        info!(queue, "开始消费提供商队列");
        Ok(())
    }

    /// 发布分析结果到结果队列
    pub async fn publish_result(&self, result: &AnalysisResult) -> WorkerResult<()> {
        let payload = serde_json::to_vec(result)
            .map_err(|e| WorkerError::Serialization(format!("序列化分析结果失败: {e}")))?;
        let now_ms = Utc::now().timestamp_millis();
        let queue = &self.inner.config.results_queue;

        let status = self
            .inner
            .publish(queue, &payload, result.message_id(now_ms), now_ms)
            .await?;

        if status == PublishStatus::Buffered {
            warn!(
                analysis_id = %result.analysis_id,
                queue = %queue,
                "结果消息已缓冲，Broker尚未确认"
            );
        } else {
            info!(analysis_id = %result.analysis_id, "分析结果已发布");
        }

        Ok(())
    }

    /// 包装原始任务和错误信息后发布到死信队列
    pub async fn publish_to_dead_letter_queue(
        &self,
        job: &JobMessage,
        error: &str,
        attempt_count: u32,
    ) -> WorkerResult<()> {
        let record = DeadLetterRecord::for_job(job, error, attempt_count, job.provider.clone());
        self.inner.publish_dead_letter_record(&record).await
    }

    /// Broker报告的队列待处理消息数
    pub async fn get_queue_depth(&self, queue: &str) -> WorkerResult<u32> {
        let channel = self.inner.current_channel().await?;
        channel.queue_depth(queue).await
    }

    /// 通道可用且结果队列可访问
    pub async fn health_check(&self) -> bool {
        let channel = match self.inner.current_channel().await {
            Ok(channel) => channel,
            Err(_) => return false,
        };

        if !channel.is_open() {
            return false;
        }

        match channel.queue_depth(&self.inner.config.results_queue).await {
            Ok(_) => true,
            Err(e) => {
                warn!("RabbitMQ健康检查失败: {e}");
                false
            }
        }
    }

    /// 关闭通道和连接，关闭过程中的错误只记录不返回
    pub async fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.abort_consumer_tasks();

        if let Some(channel) = self.inner.channel.write().await.take() {
            if let Err(e) = channel.close().await {
                debug!("关闭RabbitMQ连接时出错: {e}");
            }
        }

        self.inner.set_state(ConnectionState::Closed);
        info!("RabbitMQ连接已关闭");
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// 订阅连接状态变化
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn config(&self) -> &MessageQueueConfig {
        &self.inner.config
    }
}

#[async_trait]
impl ResultPublisher for QueueGateway {
    async fn publish_result(&self, result: &AnalysisResult) -> WorkerResult<()> {
        QueueGateway::publish_result(self, result).await
    }
}

impl GatewayInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("RabbitMQ连接状态: {:?} -> {:?}", previous, state);
        }
    }

    fn queue_specs(&self) -> Vec<QueueSpec> {
        self.config
            .provider_queues
            .values()
            .chain([&self.config.results_queue, &self.config.dead_letter_queue])
            .map(|name| QueueSpec {
                name: name.clone(),
                durable: true,
                message_ttl_ms: self.config.message_ttl_ms,
            })
            .collect()
    }

    async fn current_channel(&self) -> WorkerResult<Arc<dyn BrokerChannel>> {
        self.channel
            .read()
            .await
            .clone()
            .ok_or(WorkerError::ChannelNotInitialized)
    }

    /// 打开新连接并完成通道初始化
    async fn establish(self: &Arc<Self>) -> WorkerResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let channel = self.connector.open(events_tx).await?;

        if let Err(e) = self.prepare_channel(channel.as_ref()).await {
            if let Err(close_err) = channel.close().await {
                debug!("关闭未完成初始化的通道失败: {close_err}");
            }
            return Err(e);
        }

        *self.channel.write().await = Some(channel);
        self.watch_connection_events(events_rx, generation);

        info!(
            "成功连接到RabbitMQ: {} (prefetch: {})",
            self.connector.describe(),
            self.config.prefetch_count
        );
        Ok(())
    }

    async fn prepare_channel(&self, channel: &dyn BrokerChannel) -> WorkerResult<()> {
        channel.set_prefetch(self.config.prefetch_count).await?;

        for spec in self.queue_specs() {
            channel.declare_queue(&spec).await?;
            debug!("队列 {} 声明成功", spec.name);
        }

        info!("所有队列初始化完成");
        Ok(())
    }

    fn watch_connection_events(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        generation: u64,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(event) = events.recv().await {
                inner.handle_connection_event(event, generation);
            }
        });
    }

    fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent, generation: u64) {
        if self.closing.load(Ordering::SeqCst) {
            debug!("网关正在关闭，忽略连接事件: {:?}", event);
            return;
        }

        if generation != self.generation.load(Ordering::SeqCst) {
            debug!("忽略旧连接的事件: {:?}", event);
            return;
        }

        match &event {
            ConnectionEvent::Error(message) => error!("RabbitMQ连接错误: {message}"),
            ConnectionEvent::Closed => warn!("RabbitMQ连接已断开"),
            ConnectionEvent::ConsumerEnded { queue } => warn!(queue = %queue, "消费者已停止"),
        }

        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("重连已在进行中");
            return;
        }

        self.set_state(ConnectionState::Reconnecting);
        tokio::spawn(Arc::clone(self).reconnect_loop());
    }

    fn reconnect_loop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            let delay = Duration::from_millis(self.config.reconnect_delay_ms);
            self.teardown().await;

            let mut attempt: u64 = 0;
            loop {
                tokio::time::sleep(delay).await;
                if self.closing.load(Ordering::SeqCst) {
                    break;
                }

                attempt += 1;
                self.set_state(ConnectionState::Connecting);
                info!(attempt, "尝试重新连接RabbitMQ");

                match self.establish().await {
                    Ok(()) => match self.restart_consumers().await {
                        Ok(()) => {
                            self.set_state(ConnectionState::Connected);
                            info!(attempt, "RabbitMQ重连成功");
                            break;
                        }
                        Err(e) => {
                            error!("重连后恢复消费者失败: {e}");
                            self.teardown().await;
                        }
                    },
                    Err(e) => error!(attempt, "RabbitMQ重连失败: {e}"),
                }

                self.set_state(ConnectionState::Reconnecting);
            }

            self.reconnecting.store(false, Ordering::SeqCst);
        }
        .boxed()
    }

    /// 丢弃当前通道和消费者任务
    async fn teardown(&self) {
        self.abort_consumer_tasks();

        if let Some(channel) = self.channel.write().await.take() {
            if let Err(e) = channel.close().await {
                debug!("关闭旧连接失败: {e}");
            }
        }
    }

    fn abort_consumer_tasks(&self) {
        let mut tasks = self
            .consumer_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    async fn restart_consumers(self: &Arc<Self>) -> WorkerResult<()> {
        let channel = self.current_channel().await?;
        let generation = self.generation.load(Ordering::SeqCst);
        let consumers = self.consumers.lock().await;

        for registration in consumers.iter() {
            self.start_consumer(
                Arc::clone(&channel),
                registration.queue.clone(),
                Arc::clone(&registration.handler),
                generation,
            )
            .await?;
            info!(queue = %registration.queue, "消费者已重新注册");
        }

        Ok(())
    }

    async fn start_consumer(
        self: &Arc<Self>,
        channel: Arc<dyn BrokerChannel>,
        queue: String,
        handler: Arc<dyn JobHandler>,
        generation: u64,
    ) -> WorkerResult<()> {
        let consumer_tag = format!("analysis-worker-{queue}-{generation}");
        let mut deliveries = channel.consume(&queue, &consumer_tag).await?;
        debug!("为队列 {} 创建消费者: {}", queue, consumer_tag);

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(item) = deliveries.next().await {
                match item {
                    Ok(delivery) => {
                        let inner = Arc::clone(&inner);
                        let channel = Arc::clone(&channel);
                        let handler = Arc::clone(&handler);
                        let queue = queue.clone();
                        tokio::spawn(async move {
                            inner
                                .process_delivery(channel, &queue, handler, delivery)
                                .await;
                        });
                    }
                    Err(e) => {
                        error!(queue = %queue, "接收消息失败: {e}");
                        break;
                    }
                }
            }

            inner.handle_connection_event(ConnectionEvent::ConsumerEnded { queue }, generation);
        });

        self.consumer_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);

        Ok(())
    }

    /// 处理一次投递：解析、调用处理器，然后确认或拒绝
    async fn process_delivery(
        &self,
        channel: Arc<dyn BrokerChannel>,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        delivery: InboundDelivery,
    ) {
        let delivery_tag = delivery.delivery_tag;

        let job = match JobMessage::from_bytes(&delivery.data) {
            Ok(mut job) => {
                job.source_queue = Some(queue.to_string());
                job
            }
            Err(e) => {
                error!(queue, delivery_tag, "消息解析失败: {e}");
                metrics::counter!("analysis_messages_rejected_total", "reason" => "unparseable")
                    .increment(1);
                let record = DeadLetterRecord::for_unparseable(&delivery.data, e.to_string());
                self.dead_letter_and_reject(channel.as_ref(), delivery_tag, &record)
                    .await;
                return;
            }
        };

        debug!(
            analysis_id = %job.analysis_id,
            queue,
            redelivered = delivery.redelivered,
            "收到分析任务"
        );

        match handler.handle(job.clone()).await {
            Ok(()) => {
                if let Err(e) = channel.ack(delivery_tag).await {
                    error!(analysis_id = %job.analysis_id, "确认消息失败: {e}");
                }
            }
            Err(e) => {
                error!(analysis_id = %job.analysis_id, queue, "处理分析任务失败: {e}");
                metrics::counter!("analysis_messages_rejected_total", "reason" => "handler_failed")
                    .increment(1);
                let last_provider = e.provider().map(str::to_string).or(job.provider.clone());
                let record =
                    DeadLetterRecord::for_job(&job, e.to_string(), job.attempt_number, last_provider);
                self.dead_letter_and_reject(channel.as_ref(), delivery_tag, &record)
                    .await;
            }
        }
    }

    async fn dead_letter_and_reject(
        &self,
        channel: &dyn BrokerChannel,
        delivery_tag: u64,
        record: &DeadLetterRecord,
    ) {
        if let Err(e) = self.publish_dead_letter_record(record).await {
            error!(
                analysis_id = record.analysis_id().unwrap_or("unknown"),
                "发布死信记录失败，消息将被丢弃: {e}"
            );
            metrics::counter!("analysis_dead_letter_publish_failures_total").increment(1);
        }

        if let Err(e) = channel.nack(delivery_tag, false).await {
            error!(delivery_tag, "拒绝消息失败: {e}");
        }
    }

    async fn publish_dead_letter_record(&self, record: &DeadLetterRecord) -> WorkerResult<()> {
        let payload = serde_json::to_vec(record)
            .map_err(|e| WorkerError::Serialization(format!("序列化死信记录失败: {e}")))?;
        let now_ms = Utc::now().timestamp_millis();

        let status = self
            .publish(
                &self.config.dead_letter_queue,
                &payload,
                record.message_id(now_ms),
                now_ms,
            )
            .await?;

        if status == PublishStatus::Buffered {
            warn!("死信消息已缓冲，Broker尚未确认");
        }

        warn!(
            analysis_id = record.analysis_id().unwrap_or("unknown"),
            error = %record.error,
            "消息已发送到死信队列"
        );
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        message_id: String,
        timestamp_ms: i64,
    ) -> WorkerResult<PublishStatus> {
        let channel = self.current_channel().await?;
        channel
            .publish(
                queue,
                payload,
                PublishProperties::persistent_json(message_id, timestamp_ms),
            )
            .await
    }
}

/// 隐藏URL中的密码，用于日志输出
pub fn mask_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() && parsed.set_password(Some("****")).is_err() {
                return "<invalid url>".to_string();
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
