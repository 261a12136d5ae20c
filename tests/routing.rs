//! Routing scenarios driven end to end through the public API: a
//! configured topic topology, work-queue delivery over the default
//! exchange, and handler-driven consumption through the dispatcher.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use switchyard::broker::{AckMode, Broker, Delivery, ExchangeKind, QueueOptions};
use switchyard::config::{BindingSpec, ExchangeSpec, QueueSpec, TopologySettings};
use switchyard::dispatcher::{ConsumerHandler, Dispatcher, HandlerError};
use switchyard::BrokerError;

fn payload_str(delivery: &Delivery) -> String {
    String::from_utf8_lossy(&delivery.message.payload).into_owned()
}

/// The notification layout from the demo configuration: one topic exchange
/// feeding an email queue and an sms queue.
fn notification_topology() -> TopologySettings {
    TopologySettings {
        exchanges: vec![ExchangeSpec {
            name: "exchange_topics_inform".to_string(),
            kind: ExchangeKind::Topic,
            durable: false,
        }],
        queues: vec![
            QueueSpec {
                name: "queue_inform_email".to_string(),
                durable: false,
                max_length: None,
            },
            QueueSpec {
                name: "queue_inform_sms".to_string(),
                durable: false,
                max_length: None,
            },
        ],
        bindings: vec![
            BindingSpec {
                exchange: "exchange_topics_inform".to_string(),
                queue: "queue_inform_email".to_string(),
                pattern: "inform.#.email.#".to_string(),
            },
            BindingSpec {
                exchange: "exchange_topics_inform".to_string(),
                queue: "queue_inform_sms".to_string(),
                pattern: "inform.#.sms.#".to_string(),
            },
        ],
    }
}

#[derive(Default)]
struct CollectingHandler {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl ConsumerHandler for CollectingHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(payload_str(delivery));
        Ok(())
    }
}

#[test]
fn test_configured_topology_routes_notifications() {
    let broker = Broker::new();
    broker.install_topology(&notification_topology()).unwrap();

    assert_eq!(
        broker
            .publish("exchange_topics_inform", "inform.email.sms", "both")
            .unwrap(),
        2
    );
    assert_eq!(
        broker
            .publish("exchange_topics_inform", "inform.email", "email only")
            .unwrap(),
        1
    );

    let first = broker
        .try_consume("queue_inform_email", AckMode::Auto)
        .unwrap();
    let second = broker
        .try_consume("queue_inform_email", AckMode::Auto)
        .unwrap();
    assert_eq!(payload_str(&first), "both");
    assert_eq!(payload_str(&second), "email only");

    let sms = broker
        .try_consume("queue_inform_sms", AckMode::Auto)
        .unwrap();
    assert_eq!(payload_str(&sms), "both");
    assert_eq!(
        broker.try_consume("queue_inform_sms", AckMode::Auto),
        Err(BrokerError::Empty)
    );
}

#[tokio::test]
async fn test_work_queue_shares_messages_between_consumers() {
    let broker = Arc::new(Broker::new());
    broker.declare_queue("tasks", QueueOptions::default()).unwrap();

    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let mut taken = Vec::new();
                for _ in 0..3 {
                    let delivery = broker
                        .consume_timeout("tasks", AckMode::Auto, Duration::from_secs(5))
                        .await
                        .unwrap();
                    taken.push(payload_str(&delivery));
                }
                taken
            })
        })
        .collect();

    for i in 0..6 {
        broker.publish("", "tasks", format!("job-{i}")).unwrap();
    }

    let mut all = Vec::new();
    for consumer in consumers {
        all.extend(consumer.await.unwrap());
    }
    all.sort();
    let expected: Vec<String> = (0..6).map(|i| format!("job-{i}")).collect();
    assert_eq!(all, expected);
    assert_eq!(broker.queue_depth("tasks").unwrap(), 0);
}

#[tokio::test]
async fn test_dispatcher_drives_registered_handlers() {
    let broker = Arc::new(Broker::new());
    broker.install_topology(&notification_topology()).unwrap();

    let email = Arc::new(CollectingHandler::default());
    let sms = Arc::new(CollectingHandler::default());
    let handle = Dispatcher::new(Arc::clone(&broker))
        .register("queue_inform_email", Arc::clone(&email) as Arc<dyn ConsumerHandler>)
        .register("queue_inform_sms", Arc::clone(&sms) as Arc<dyn ConsumerHandler>)
        .start()
        .unwrap();

    broker
        .publish("exchange_topics_inform", "inform.email.sms", "both")
        .unwrap();
    broker
        .publish("exchange_topics_inform", "inform.sms", "sms only")
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if email.seen.lock().unwrap().len() == 1 && sms.seen.lock().unwrap().len() == 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "handlers never saw the messages"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    assert_eq!(*email.seen.lock().unwrap(), vec!["both"]);
    assert_eq!(*sms.seen.lock().unwrap(), vec!["both", "sms only"]);
    assert_eq!(broker.unacked("queue_inform_email").unwrap(), 0);
    assert_eq!(broker.unacked("queue_inform_sms").unwrap(), 0);
}
