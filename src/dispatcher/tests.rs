use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ConsumerHandler, Dispatcher, HandlerError};
use crate::broker::{Broker, Delivery, QueueOptions};
use crate::utils::BrokerError;

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let start = tokio::time::Instant::now();
    while !condition() {
        if start.elapsed() > deadline {
            panic!("condition not reached within {:?}", deadline);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl ConsumerHandler for RecordingHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let payload = String::from_utf8(delivery.message.payload.clone()).unwrap();
        self.seen.lock().unwrap().push(payload);
        Ok(())
    }
}

struct FlakyHandler {
    failures_left: AtomicU32,
    redeliveries_seen: Mutex<Vec<u32>>,
}

impl FlakyHandler {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            redeliveries_seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ConsumerHandler for FlakyHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        self.redeliveries_seen
            .lock()
            .unwrap()
            .push(delivery.redeliveries);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(HandlerError::Retry);
        }
        Ok(())
    }
}

#[derive(Default)]
struct RejectingHandler {
    calls: AtomicU32,
}

#[async_trait]
impl ConsumerHandler for RejectingHandler {
    async fn handle(&self, _delivery: &Delivery) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Drop)
    }
}

#[derive(Default)]
struct PanickingOnceHandler {
    panicked: AtomicBool,
}

#[async_trait]
impl ConsumerHandler for PanickingOnceHandler {
    async fn handle(&self, _delivery: &Delivery) -> Result<(), HandlerError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("handler blew up");
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_start_requires_existing_queue() {
    let broker = Arc::new(Broker::new());
    let handler = Arc::new(RecordingHandler::default());
    let result = Dispatcher::new(broker).register("ghost", handler).start();
    assert!(matches!(result, Err(BrokerError::QueueNotFound(_))));
}

#[tokio::test]
async fn test_handlers_receive_published_messages() {
    let broker = Arc::new(Broker::new());
    broker.declare_queue("jobs", QueueOptions::default()).unwrap();
    for i in 0..3 {
        broker.publish("", "jobs", format!("m{i}")).unwrap();
    }

    let handler = Arc::new(RecordingHandler::default());
    let handle = Dispatcher::new(Arc::clone(&broker))
        .register("jobs", Arc::clone(&handler) as Arc<dyn ConsumerHandler>)
        .start()
        .unwrap();
    wait_until(Duration::from_secs(2), || {
        handler.seen.lock().unwrap().len() == 3
    })
    .await;
    handle.shutdown().await;

    assert_eq!(
        *handler.seen.lock().unwrap(),
        vec!["m0".to_string(), "m1".to_string(), "m2".to_string()]
    );
    assert_eq!(broker.queue_depth("jobs").unwrap(), 0);
    assert_eq!(broker.unacked("jobs").unwrap(), 0);
}

#[tokio::test]
async fn test_retry_verdict_redelivers_until_success() {
    let broker = Arc::new(Broker::new());
    broker.declare_queue("jobs", QueueOptions::default()).unwrap();
    broker.publish("", "jobs", "flaky").unwrap();

    let handler = Arc::new(FlakyHandler::new(2));
    let handle = Dispatcher::new(Arc::clone(&broker))
        .register("jobs", Arc::clone(&handler) as Arc<dyn ConsumerHandler>)
        .start()
        .unwrap();
    wait_until(Duration::from_secs(2), || {
        handler.redeliveries_seen.lock().unwrap().len() == 3
    })
    .await;
    handle.shutdown().await;

    assert_eq!(*handler.redeliveries_seen.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(broker.queue_depth("jobs").unwrap(), 0);
    assert_eq!(broker.unacked("jobs").unwrap(), 0);
    let stats = broker.stats();
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.requeued, 2);
}

#[tokio::test]
async fn test_drop_verdict_discards_message() {
    let broker = Arc::new(Broker::new());
    broker.declare_queue("jobs", QueueOptions::default()).unwrap();
    broker.publish("", "jobs", "bad").unwrap();

    let handler = Arc::new(RejectingHandler::default());
    let handle = Dispatcher::new(Arc::clone(&broker))
        .register("jobs", Arc::clone(&handler) as Arc<dyn ConsumerHandler>)
        .start()
        .unwrap();
    wait_until(Duration::from_secs(2), || broker.stats().dropped == 1).await;
    handle.shutdown().await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.queue_depth("jobs").unwrap(), 0);
    assert_eq!(broker.unacked("jobs").unwrap(), 0);
}

#[tokio::test]
async fn test_multiple_workers_drain_queue() {
    let broker = Arc::new(Broker::new());
    broker.declare_queue("jobs", QueueOptions::default()).unwrap();
    for i in 0..9 {
        broker.publish("", "jobs", format!("m{i}")).unwrap();
    }

    let handler = Arc::new(RecordingHandler::default());
    let handle = Dispatcher::new(Arc::clone(&broker))
        .register_workers("jobs", Arc::clone(&handler) as Arc<dyn ConsumerHandler>, 3)
        .start()
        .unwrap();
    wait_until(Duration::from_secs(2), || {
        handler.seen.lock().unwrap().len() == 9
    })
    .await;
    handle.shutdown().await;

    let mut seen = handler.seen.lock().unwrap().clone();
    seen.sort();
    let expected: Vec<String> = (0..9).map(|i| format!("m{i}")).collect();
    assert_eq!(seen, expected);
    assert_eq!(broker.queue_depth("jobs").unwrap(), 0);
}

#[tokio::test]
async fn test_shutdown_recovers_delivery_after_worker_panic() {
    let broker = Arc::new(Broker::new());
    broker.declare_queue("jobs", QueueOptions::default()).unwrap();
    broker.publish("", "jobs", "boom").unwrap();

    let handler = Arc::new(PanickingOnceHandler::default());
    let handle = Dispatcher::new(Arc::clone(&broker))
        .register("jobs", Arc::clone(&handler) as Arc<dyn ConsumerHandler>)
        .start()
        .unwrap();
    wait_until(Duration::from_secs(2), || {
        handler.panicked.load(Ordering::SeqCst)
    })
    .await;
    // Give the worker task a moment to unwind.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown().await;

    // The in-flight delivery went back to the head of the queue.
    assert_eq!(broker.queue_depth("jobs").unwrap(), 1);
    assert_eq!(broker.unacked("jobs").unwrap(), 0);
}

#[tokio::test]
async fn test_shutdown_completes_after_queue_is_deleted() {
    let broker = Arc::new(Broker::new());
    broker.declare_queue("jobs", QueueOptions::default()).unwrap();
    let handle = Dispatcher::new(Arc::clone(&broker))
        .register("jobs", Arc::new(RecordingHandler::default()))
        .start()
        .unwrap();

    // The workers stop on their own; shutdown still has to join them and
    // survive the recover call against the missing queue.
    broker.delete_queue("jobs").unwrap();
    handle.shutdown().await;

    assert_eq!(
        broker.queue_depth("jobs"),
        Err(BrokerError::QueueNotFound("jobs".to_string()))
    );
}
