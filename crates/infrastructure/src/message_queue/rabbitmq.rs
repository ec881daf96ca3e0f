use analysis_core::{
    BrokerChannel, BrokerConnector, ConnectionEvent, ConnectionEventSender, DeliveryStream,
    InboundDelivery, PublishProperties, PublishStatus, QueueSpec, WorkerError, WorkerResult,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::mask_url;

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

/// 基于lapin的RabbitMQ连接器
pub struct RabbitMqConnector {
    url: String,
    confirm_timeout: Duration,
}

impl RabbitMqConnector {
    pub fn new(url: String, confirm_timeout: Duration) -> Self {
        Self {
            url,
            confirm_timeout,
        }
    }
}

#[async_trait]
impl BrokerConnector for RabbitMqConnector {
    async fn open(&self, events: ConnectionEventSender) -> WorkerResult<Arc<dyn BrokerChannel>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| WorkerError::MessageQueue(format!("连接RabbitMQ失败: {e}")))?;

        let connection_events = events.clone();
        connection.on_error(move |err| {
            let _ = connection_events.send(ConnectionEvent::Error(err.to_string()));
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| WorkerError::MessageQueue(format!("创建通道失败: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| WorkerError::MessageQueue(format!("启用发布确认失败: {e}")))?;

        channel.on_error(move |err| {
            let _ = events.send(ConnectionEvent::Error(format!("通道错误: {err}")));
        });

        Ok(Arc::new(RabbitMqChannel {
            connection,
            channel,
            confirm_timeout: self.confirm_timeout,
        }))
    }

    fn describe(&self) -> String {
        mask_url(&self.url)
    }
}

struct RabbitMqChannel {
    connection: Connection,
    channel: Channel,
    confirm_timeout: Duration,
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn set_prefetch(&self, count: u16) -> WorkerResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: true })
            .await
            .map_err(|e| WorkerError::MessageQueue(format!("设置预取数量失败: {e}")))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> WorkerResult<()> {
        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-message-ttl".into(),
            AMQPValue::LongInt(i32::try_from(spec.message_ttl_ms).unwrap_or(i32::MAX)),
        );

        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| {
                WorkerError::MessageQueue(format!("声明队列 {} 失败: {e}", spec.name))
            })?;

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> WorkerResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| WorkerError::MessageQueue(format!("创建消费者失败: {e}")))?;

        let deliveries = consumer.map(|item| {
            item.map(|delivery| InboundDelivery {
                delivery_tag: delivery.delivery_tag,
                message_id: delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string()),
                redelivered: delivery.redelivered,
                data: delivery.data,
            })
            .map_err(|e| WorkerError::MessageQueue(format!("接收消息失败: {e}")))
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> WorkerResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| WorkerError::MessageQueue(format!("确认消息失败: {e}")))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> WorkerResult<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| WorkerError::MessageQueue(format!("拒绝消息失败: {e}")))
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> WorkerResult<PublishStatus> {
        let delivery_mode = if properties.persistent {
            PERSISTENT
        } else {
            TRANSIENT
        };
        let basic_properties = BasicProperties::default()
            .with_delivery_mode(delivery_mode)
            .with_content_type(properties.content_type.into())
            .with_message_id(properties.message_id.into())
            .with_timestamp(u64::try_from(properties.timestamp_ms / 1000).unwrap_or_default());

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                basic_properties,
            )
            .await
            .map_err(|e| {
                WorkerError::MessageQueue(format!("发布消息到队列 {queue} 失败: {e}"))
            })?;

        match tokio::time::timeout(self.confirm_timeout, confirm).await {
            Ok(Ok(confirmation)) if confirmation.is_nack() => Err(WorkerError::MessageQueue(
                format!("Broker拒绝了发布到队列 {queue} 的消息"),
            )),
            Ok(Ok(_)) => {
                debug!("消息已发布到队列: {}", queue);
                Ok(PublishStatus::Accepted)
            }
            Ok(Err(e)) => Err(WorkerError::MessageQueue(format!("消息发布确认失败: {e}"))),
            Err(_) => {
                warn!(
                    "等待队列 {} 的发布确认超时 ({:?})",
                    queue, self.confirm_timeout
                );
                Ok(PublishStatus::Buffered)
            }
        }
    }

    async fn queue_depth(&self, queue: &str) -> WorkerResult<u32> {
        let info = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| WorkerError::MessageQueue(format!("获取队列 {queue} 信息失败: {e}")))?;

        Ok(info.message_count())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> WorkerResult<()> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "正常关闭").await {
                debug!("关闭通道失败: {e}");
            }
        }

        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| WorkerError::MessageQueue(format!("关闭连接失败: {e}")))
    }
}
