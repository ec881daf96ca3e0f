use analysis_core::{
    BrokerChannel, BrokerConnector, ConnectionEvent, ConnectionEventSender, DeliveryStream,
    InboundDelivery, PublishProperties, PublishStatus, QueueSpec, WorkerError, WorkerResult,
};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// 已发布的消息
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub properties: PublishProperties,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    data: Vec<u8>,
    message_id: Option<String>,
    redelivered: bool,
}

struct Consumer {
    queue: String,
    sender: mpsc::UnboundedSender<WorkerResult<InboundDelivery>>,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    declared: Vec<QueueSpec>,
    live_connection: Option<u64>,
    connection_seq: u64,
    connect_count: usize,
    failing_connects: usize,
    events: Option<ConnectionEventSender>,
    prefetch: Option<u16>,
    consumers: Vec<Consumer>,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    published: Vec<PublishedMessage>,
    buffer_publishes: bool,
    nacked_publish_queues: HashSet<String>,
}

impl BrokerState {
    /// 在预取上限内把就绪消息推送给消费者
    fn dispatch(&mut self) {
        let mut idx = 0;
        while idx < self.consumers.len() {
            if let Some(limit) = self.prefetch {
                if self.unacked.len() >= usize::from(limit) {
                    return;
                }
            }

            let queue = self.consumers[idx].queue.clone();
            let Some(message) = self.queues.get_mut(&queue).and_then(VecDeque::pop_front) else {
                idx += 1;
                continue;
            };

            self.next_tag += 1;
            let delivery_tag = self.next_tag;
            let delivery = InboundDelivery {
                delivery_tag,
                message_id: message.message_id.clone(),
                redelivered: message.redelivered,
                data: message.data.clone(),
            };

            if self.consumers[idx].sender.unbounded_send(Ok(delivery)).is_err() {
                // 消费者已经离开
                self.queues.entry(queue).or_default().push_front(message);
                self.consumers.remove(idx);
                continue;
            }

            self.unacked.insert(delivery_tag, Unacked { queue, message });
        }
    }

    /// 断开当前连接：结束所有消费者流，未确认消息重新入队
    fn drop_connection(&mut self) {
        self.live_connection = None;
        self.consumers.clear();

        let mut tags: Vec<u64> = self.unacked.keys().copied().collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(Unacked { queue, mut message }) = self.unacked.remove(&tag) {
                message.redelivered = true;
                self.queues.entry(queue).or_default().push_front(message);
            }
        }
    }
}

/// 进程内消息Broker
///
/// 行为接近RabbitMQ默认交换机：手动确认、通道级预取、断线后未确认消息重新投递。
/// 同时记录所有确认、拒绝和发布操作，供测试断言使用。
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 以生产者身份向队列投放一条原始消息
    pub fn push_raw(&self, queue: &str, data: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage {
                data: data.into(),
                message_id: None,
                redelivered: false,
            });
        state.dispatch();
    }

    pub fn push_json(&self, queue: &str, value: &serde_json::Value) {
        self.push_raw(queue, value.to_string());
    }

    /// 模拟Broker端关闭连接
    pub fn simulate_connection_close(&self) {
        let events = {
            let mut state = self.lock();
            state.drop_connection();
            state.events.take()
        };

        if let Some(events) = events {
            let _ = events.send(ConnectionEvent::Closed);
        }
    }

    /// 让接下来 `count` 次连接尝试失败
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    /// 发布后不返回确认，模拟Broker缓冲
    pub fn set_buffer_publishes(&self, buffer: bool) {
        self.lock().buffer_publishes = buffer;
    }

    /// 发布到该队列时返回Broker拒绝
    pub fn reject_publishes_to(&self, queue: &str) {
        self.lock().nacked_publish_queues.insert(queue.to_string());
    }

    pub fn published_to(&self, queue: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.queue == queue)
            .cloned()
            .collect()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.lock().nacked.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connect_count
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.lock().prefetch
    }

    pub fn declared_queues(&self) -> Vec<QueueSpec> {
        self.lock().declared.clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .consumers
            .iter()
            .filter(|c| c.queue == queue)
            .count()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().live_connection.is_some()
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn open(&self, events: ConnectionEventSender) -> WorkerResult<Arc<dyn BrokerChannel>> {
        let mut state = self.lock();

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(WorkerError::MessageQueue("连接RabbitMQ失败: connection refused".into()));
        }

        if state.live_connection.is_some() {
            state.drop_connection();
        }

        state.connection_seq += 1;
        state.connect_count += 1;
        let connection_id = state.connection_seq;
        state.live_connection = Some(connection_id);
        state.events = Some(events);

        debug!(connection_id, "in-memory broker connection opened");

        Ok(Arc::new(InMemoryChannel {
            broker: self.clone(),
            connection_id,
        }))
    }

    fn describe(&self) -> String {
        "memory://broker".to_string()
    }
}

struct InMemoryChannel {
    broker: InMemoryBroker,
    connection_id: u64,
}

impl InMemoryChannel {
    fn open_state(&self) -> WorkerResult<MutexGuard<'_, BrokerState>> {
        let state = self.broker.lock();
        if state.live_connection != Some(self.connection_id) {
            return Err(WorkerError::MessageQueue("通道已关闭".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn set_prefetch(&self, count: u16) -> WorkerResult<()> {
        let mut state = self.open_state()?;
        state.prefetch = Some(count);
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> WorkerResult<()> {
        let mut state = self.open_state()?;
        state.queues.entry(spec.name.clone()).or_default();
        state.declared.push(spec.clone());
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> WorkerResult<DeliveryStream> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(WorkerError::MessageQueue(format!("队列 {queue} 不存在")));
        }

        let (sender, receiver) = mpsc::unbounded();
        state.consumers.push(Consumer {
            queue: queue.to_string(),
            sender,
        });
        state.dispatch();

        Ok(receiver.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> WorkerResult<()> {
        let mut state = self.open_state()?;
        if state.unacked.remove(&delivery_tag).is_none() {
            return Err(WorkerError::MessageQueue(format!(
                "未知的投递标签: {delivery_tag}"
            )));
        }
        state.acked.push(delivery_tag);
        state.dispatch();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> WorkerResult<()> {
        let mut state = self.open_state()?;
        let Some(Unacked { queue, mut message }) = state.unacked.remove(&delivery_tag) else {
            return Err(WorkerError::MessageQueue(format!(
                "未知的投递标签: {delivery_tag}"
            )));
        };

        state.nacked.push((delivery_tag, requeue));
        if requeue {
            message.redelivered = true;
            state.queues.entry(queue).or_default().push_front(message);
        }
        state.dispatch();
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> WorkerResult<PublishStatus> {
        let mut state = self.open_state()?;

        if state.nacked_publish_queues.contains(queue) {
            return Err(WorkerError::MessageQueue(format!("Broker拒绝发布到 {queue}")));
        }

        state.published.push(PublishedMessage {
            queue: queue.to_string(),
            payload: payload.to_vec(),
            properties: properties.clone(),
        });
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage {
                data: payload.to_vec(),
                message_id: Some(properties.message_id),
                redelivered: false,
            });
        state.dispatch();

        if state.buffer_publishes {
            Ok(PublishStatus::Buffered)
        } else {
            Ok(PublishStatus::Accepted)
        }
    }

    async fn queue_depth(&self, queue: &str) -> WorkerResult<u32> {
        let state = self.open_state()?;
        state
            .queues
            .get(queue)
            .map(|q| q.len() as u32)
            .ok_or_else(|| WorkerError::MessageQueue(format!("队列 {queue} 不存在")))
    }

    fn is_open(&self) -> bool {
        self.broker.lock().live_connection == Some(self.connection_id)
    }

    async fn close(&self) -> WorkerResult<()> {
        let mut state = self.broker.lock();
        if state.live_connection == Some(self.connection_id) {
            state.drop_connection();
            state.events = None;
        }
        Ok(())
    }
}
