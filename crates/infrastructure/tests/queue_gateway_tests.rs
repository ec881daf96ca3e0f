use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use analysis_core::config::MessageQueueConfig;
use analysis_core::{AnalysisResult, JobHandler, JobMessage, WorkerError, WorkerResult};
use analysis_infrastructure::{ConnectionState, InMemoryBroker, QueueGateway};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

const GEMINI_QUEUE: &str = "gemini-analysis-queue";
const RESULTS_QUEUE: &str = "analysis-results-queue";
const DLQ: &str = "analysis-dlq";

/// 记录收到的任务，可配置为失败或等待放行
struct TestHandler {
    calls: AtomicUsize,
    jobs: Mutex<Vec<JobMessage>>,
    failure: Option<(String, String)>,
    gate: Option<Arc<Semaphore>>,
}

impl TestHandler {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            jobs: Mutex::new(Vec::new()),
            failure: None,
            gate: None,
        })
    }

    fn failing(provider: &str, message: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            jobs: Mutex::new(Vec::new()),
            failure: Some((provider.to_string(), message.to_string())),
            gate: None,
        })
    }

    fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            jobs: Mutex::new(Vec::new()),
            failure: None,
            gate: Some(gate),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for TestHandler {
    async fn handle(&self, job: JobMessage) -> WorkerResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().unwrap().push(job);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        match &self.failure {
            Some((provider, message)) => Err(WorkerError::provider_error(provider, message)),
            None => Ok(()),
        }
    }
}

fn test_config() -> MessageQueueConfig {
    MessageQueueConfig {
        reconnect_delay_ms: 50,
        ..MessageQueueConfig::default()
    }
}

async fn connected_gateway(config: MessageQueueConfig) -> (QueueGateway, InMemoryBroker) {
    let broker = InMemoryBroker::new();
    let gateway = QueueGateway::new(Arc::new(broker.clone()), config);
    gateway.connect().await.unwrap();
    (gateway, broker)
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn job_json(analysis_id: &str) -> serde_json::Value {
    json!({
        "analysis_id": analysis_id,
        "image_url": "https://cdn.example.com/leaf.jpg",
        "farmer_id": "F-001"
    })
}

#[tokio::test]
async fn test_connect_declares_queues_and_prefetch() {
    let (gateway, broker) = connected_gateway(test_config()).await;

    assert_eq!(gateway.state(), ConnectionState::Connected);
    assert_eq!(broker.prefetch(), Some(10));

    let declared = broker.declared_queues();
    assert_eq!(declared.len(), 5);
    for name in [
        "openai-analysis-queue",
        "gemini-analysis-queue",
        "anthropic-analysis-queue",
        RESULTS_QUEUE,
        DLQ,
    ] {
        let spec = declared.iter().find(|s| s.name == name).unwrap();
        assert!(spec.durable);
        assert_eq!(spec.message_ttl_ms, 86_400_000);
    }
}

#[tokio::test]
async fn test_connect_failure_leaves_gateway_disconnected() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(1);
    let gateway = QueueGateway::new(Arc::new(broker.clone()), test_config());

    assert!(gateway.connect().await.is_err());
    assert_eq!(gateway.state(), ConnectionState::Disconnected);
    assert!(!gateway.health_check().await);

    gateway.connect().await.unwrap();
    assert!(gateway.is_connected());
}

#[tokio::test]
async fn test_successful_job_is_acked() {
    let (gateway, broker) = connected_gateway(test_config()).await;
    let handler = TestHandler::succeeding();
    gateway
        .consume_provider_queue(GEMINI_QUEUE, handler.clone())
        .await
        .unwrap();

    broker.push_json(GEMINI_QUEUE, &job_json("a-1"));

    wait_until(|| broker.acked().len() == 1).await;
    assert!(broker.nacked().is_empty());
    assert!(broker.published_to(DLQ).is_empty());

    let jobs = handler.jobs.lock().unwrap();
    assert_eq!(jobs[0].analysis_id, "a-1");
    assert_eq!(jobs[0].source_queue.as_deref(), Some(GEMINI_QUEUE));
    assert_eq!(jobs[0].payload["farmer_id"], "F-001");
}

#[tokio::test]
async fn test_unparseable_message_is_dead_lettered_once() {
    let (gateway, broker) = connected_gateway(test_config()).await;
    let handler = TestHandler::succeeding();
    gateway
        .consume_provider_queue(GEMINI_QUEUE, handler.clone())
        .await
        .unwrap();

    broker.push_raw(GEMINI_QUEUE, "{not json");

    wait_until(|| broker.nacked().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handler.calls(), 0);
    assert!(broker.acked().is_empty());
    assert!(!broker.nacked()[0].1);
    assert!(broker.published_to(RESULTS_QUEUE).is_empty());

    let dead_letters = broker.published_to(DLQ);
    assert_eq!(dead_letters.len(), 1);
    let record = dead_letters[0].json();
    assert_eq!(record["originalMessage"], "{not json");
    assert_eq!(record["attemptCount"], 1);
    assert!(record["error"].as_str().unwrap().contains("JSON"));
    assert!(dead_letters[0].properties.persistent);
    assert!(dead_letters[0]
        .properties
        .message_id
        .starts_with("dlq-unknown-"));
}

#[tokio::test]
async fn test_missing_analysis_id_is_dead_lettered() {
    let (gateway, broker) = connected_gateway(test_config()).await;
    let handler = TestHandler::succeeding();
    gateway
        .consume_provider_queue(GEMINI_QUEUE, handler.clone())
        .await
        .unwrap();

    broker.push_json(GEMINI_QUEUE, &json!({ "image_url": "x" }));

    wait_until(|| broker.nacked().len() == 1).await;
    assert_eq!(handler.calls(), 0);
    assert_eq!(broker.published_to(DLQ).len(), 1);
}

#[tokio::test]
async fn test_handler_failure_nacks_and_dead_letters() {
    let (gateway, broker) = connected_gateway(test_config()).await;
    let handler = TestHandler::failing("openai", "provider returned 500");
    gateway
        .consume_provider_queue(GEMINI_QUEUE, handler.clone())
        .await
        .unwrap();

    let mut job = job_json("a-2");
    job["attemptNumber"] = json!(2);
    job["provider"] = json!("gemini");
    broker.push_json(GEMINI_QUEUE, &job);

    wait_until(|| broker.nacked().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handler.calls(), 1);
    assert!(broker.acked().is_empty());
    assert_eq!(broker.nacked().len(), 1);
    assert!(!broker.nacked()[0].1);
    assert!(broker.published_to(RESULTS_QUEUE).is_empty());

    let dead_letters = broker.published_to(DLQ);
    assert_eq!(dead_letters.len(), 1);
    let record = dead_letters[0].json();
    assert_eq!(record["originalMessage"]["analysis_id"], "a-2");
    assert_eq!(record["attemptCount"], 2);
    assert_eq!(record["lastProvider"], "openai");
    assert!(record["error"]
        .as_str()
        .unwrap()
        .contains("provider returned 500"));
    assert!(dead_letters[0].properties.message_id.starts_with("dlq-a-2-"));
}

#[tokio::test]
async fn test_failed_dead_letter_publish_still_rejects_delivery() {
    let (gateway, broker) = connected_gateway(test_config()).await;
    broker.reject_publishes_to(DLQ);
    let handler = TestHandler::failing("gemini", "provider returned 503");
    gateway
        .consume_provider_queue(GEMINI_QUEUE, handler.clone())
        .await
        .unwrap();

    broker.push_json(GEMINI_QUEUE, &job_json("a-9"));

    wait_until(|| broker.nacked().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handler.calls(), 1);
    assert!(!broker.nacked()[0].1);
    assert!(broker.published_to(DLQ).is_empty());
    assert_eq!(broker.ready_count(GEMINI_QUEUE), 0);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_publish_result() {
    let (gateway, broker) = connected_gateway(test_config()).await;

    let mut result = AnalysisResult::new("a-3", serde_json::Map::new());
    result.stamp("gemini", 1200);
    gateway.publish_result(&result).await.unwrap();

    let published = broker.published_to(RESULTS_QUEUE);
    assert_eq!(published.len(), 1);
    assert!(published[0].properties.persistent);
    assert_eq!(published[0].properties.content_type, "application/json");
    assert!(published[0].properties.message_id.starts_with("a-3-"));

    let body = published[0].json();
    assert_eq!(body["analysis_id"], "a-3");
    assert_eq!(body["processing_metadata"]["provider"], "gemini");

    assert_eq!(gateway.get_queue_depth(RESULTS_QUEUE).await.unwrap(), 1);
}

#[tokio::test]
async fn test_buffered_publish_is_not_an_error() {
    let (gateway, broker) = connected_gateway(test_config()).await;
    broker.set_buffer_publishes(true);

    let result = AnalysisResult::new("a-4", serde_json::Map::new());
    assert!(gateway.publish_result(&result).await.is_ok());
    assert_eq!(broker.published_to(RESULTS_QUEUE).len(), 1);
}

#[tokio::test]
async fn test_publish_to_dead_letter_queue() {
    let (gateway, broker) = connected_gateway(test_config()).await;

    let job = JobMessage::new("a-5").with_provider("anthropic");
    gateway
        .publish_to_dead_letter_queue(&job, "Rate limit exceeded after waiting", 3)
        .await
        .unwrap();

    let record = broker.published_to(DLQ)[0].json();
    assert_eq!(record["attemptCount"], 3);
    assert_eq!(record["lastProvider"], "anthropic");
    assert!(record["failureTimestamp"].is_string());
}

#[tokio::test]
async fn test_publish_without_connection_fails() {
    let gateway = QueueGateway::new(Arc::new(InMemoryBroker::new()), test_config());
    let result = AnalysisResult::new("a-6", serde_json::Map::new());

    let err = gateway.publish_result(&result).await.unwrap_err();
    assert!(matches!(err, WorkerError::ChannelNotInitialized));
}

#[tokio::test]
async fn test_prefetch_bounds_in_flight_messages() {
    let config = MessageQueueConfig {
        prefetch_count: 2,
        ..test_config()
    };
    let (gateway, broker) = connected_gateway(config).await;
    let gate = Arc::new(Semaphore::new(0));
    let handler = TestHandler::gated(gate.clone());
    gateway
        .consume_provider_queue(GEMINI_QUEUE, handler.clone())
        .await
        .unwrap();

    for i in 0..5 {
        broker.push_json(GEMINI_QUEUE, &job_json(&format!("p-{i}")));
    }

    wait_until(|| handler.calls() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.calls(), 2);
    assert_eq!(broker.unacked_count(), 2);
    assert_eq!(broker.ready_count(GEMINI_QUEUE), 3);

    gate.add_permits(5);
    wait_until(|| broker.acked().len() == 5).await;
    assert_eq!(handler.calls(), 5);
}

#[tokio::test]
async fn test_reconnects_and_resumes_consuming_after_close() {
    let (gateway, broker) = connected_gateway(test_config()).await;
    let handler = TestHandler::succeeding();
    gateway
        .consume_provider_queue(GEMINI_QUEUE, handler.clone())
        .await
        .unwrap();

    broker.push_json(GEMINI_QUEUE, &job_json("r-1"));
    wait_until(|| broker.acked().len() == 1).await;

    let mut states = gateway.subscribe_state();
    broker.simulate_connection_close();

    states
        .wait_for(|state| *state == ConnectionState::Reconnecting)
        .await
        .unwrap();
    wait_until(|| gateway.state() == ConnectionState::Connected).await;

    assert_eq!(broker.connect_count(), 2);
    assert_eq!(broker.consumer_count(GEMINI_QUEUE), 1);
    // every queue is asserted again on the new channel
    assert_eq!(broker.declared_queues().len(), 10);

    broker.push_json(GEMINI_QUEUE, &job_json("r-2"));
    wait_until(|| broker.acked().len() == 2).await;
    assert_eq!(handler.calls(), 2);
    assert!(gateway.health_check().await);
}

#[tokio::test]
async fn test_reconnect_retries_until_broker_returns() {
    let (gateway, broker) = connected_gateway(test_config()).await;
    gateway
        .consume_provider_queue(GEMINI_QUEUE, TestHandler::succeeding())
        .await
        .unwrap();

    broker.fail_next_connects(3);
    broker.simulate_connection_close();

    wait_until(|| gateway.state() == ConnectionState::Connected && broker.connect_count() == 2)
        .await;
    assert_eq!(broker.consumer_count(GEMINI_QUEUE), 1);
}

#[tokio::test]
async fn test_in_flight_message_is_redelivered_after_reconnect() {
    let (gateway, broker) = connected_gateway(test_config()).await;
    let gate = Arc::new(Semaphore::new(0));
    let handler = TestHandler::gated(gate.clone());
    gateway
        .consume_provider_queue(GEMINI_QUEUE, handler.clone())
        .await
        .unwrap();

    broker.push_json(GEMINI_QUEUE, &job_json("i-1"));
    wait_until(|| handler.calls() == 1).await;

    broker.simulate_connection_close();
    wait_until(|| handler.calls() == 2).await;
    wait_until(|| gateway.state() == ConnectionState::Connected).await;

    gate.add_permits(2);
    wait_until(|| broker.acked().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the ack for the first delivery went to the closed channel and was dropped
    assert_eq!(broker.acked().len(), 1);
    assert_eq!(broker.unacked_count(), 0);
    assert!(broker.published_to(DLQ).is_empty());
}

#[tokio::test]
async fn test_close_is_terminal() {
    let (gateway, broker) = connected_gateway(test_config()).await;
    gateway
        .consume_provider_queue(GEMINI_QUEUE, TestHandler::succeeding())
        .await
        .unwrap();

    gateway.close().await;

    assert_eq!(gateway.state(), ConnectionState::Closed);
    assert!(!broker.is_connected());
    assert!(!gateway.health_check().await);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(broker.connect_count(), 1);

    // closing twice is harmless
    gateway.close().await;
}
