use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::WorkerResult;

/// 一次消息投递
#[derive(Debug, Clone, PartialEq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub data: Vec<u8>,
}

/// 投递流，流结束表示消费者被取消或通道已关闭
pub type DeliveryStream = BoxStream<'static, WorkerResult<InboundDelivery>>;

/// 发布消息的属性
#[derive(Debug, Clone, PartialEq)]
pub struct PublishProperties {
    pub message_id: String,
    pub content_type: String,
    pub timestamp_ms: i64,
    pub persistent: bool,
}

impl PublishProperties {
    /// 持久化的JSON消息
    pub fn persistent_json(message_id: String, timestamp_ms: i64) -> Self {
        Self {
            message_id,
            content_type: "application/json".to_string(),
            timestamp_ms,
            persistent: true,
        }
    }
}

/// 发布结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    /// Broker已确认
    Accepted,
    /// 消息已写入通道但未在等待时间内得到确认
    Buffered,
}

/// 连接级事件，任一事件都会触发重连
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Error(String),
    Closed,
    ConsumerEnded { queue: String },
}

pub type ConnectionEventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// 队列声明参数
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub message_ttl_ms: u32,
}

/// 消息Broker连接器
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// 打开一个新连接及其通道，连接级错误通过 `events` 上报
    async fn open(&self, events: ConnectionEventSender) -> WorkerResult<Arc<dyn BrokerChannel>>;

    /// 用于日志的目标描述（不包含凭据）
    fn describe(&self) -> String;
}

/// 消息Broker通道抽象接口
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// 设置通道级预取数量
    async fn set_prefetch(&self, count: u16) -> WorkerResult<()>;

    /// 声明队列（幂等）
    async fn declare_queue(&self, spec: &QueueSpec) -> WorkerResult<()>;

    /// 以手动确认模式注册消费者
    async fn consume(&self, queue: &str, consumer_tag: &str) -> WorkerResult<DeliveryStream>;

    /// 确认消息处理完成
    async fn ack(&self, delivery_tag: u64) -> WorkerResult<()>;

    /// 拒绝消息
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> WorkerResult<()>;

    /// 通过默认交换机发布消息到指定队列
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> WorkerResult<PublishStatus>;

    /// 获取队列中等待的消息数量
    async fn queue_depth(&self, queue: &str) -> WorkerResult<u32>;

    fn is_open(&self) -> bool;

    /// 关闭通道和底层连接
    async fn close(&self) -> WorkerResult<()>;
}
