//! The `dispatcher` module runs registered consumer handlers against
//! queues, the push-style counterpart to calling [`Broker::consume`] by
//! hand.
//!
//! Handlers are registered per queue with a worker count, then `start`
//! spawns the workers. Each worker consumes under manual acknowledgment,
//! invokes the handler, and settles the delivery from the handler's
//! verdict: ack on success, requeue on [`HandlerError::Retry`] (bounded by
//! the broker's redelivery cap), discard on [`HandlerError::Drop`].
//!
//! Shutdown is graceful: workers finish the message in their hands, then
//! any deliveries left in flight are recovered back onto their queues.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{AckMode, Broker, Delivery};
use crate::utils::BrokerError;

#[cfg(test)]
mod tests;

/// What a failing handler wants done with the delivery.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerError {
    /// Return the delivery to its queue for another attempt.
    #[error("handler failed, delivery should be retried")]
    Retry,
    /// Discard the delivery.
    #[error("handler failed, delivery should be dropped")]
    Drop,
}

/// A message callback bound to a queue through [`Dispatcher::register`].
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

struct Registration {
    queue: String,
    handler: Arc<dyn ConsumerHandler>,
    workers: usize,
}

/// Builder that pairs queues with handlers before spawning workers.
pub struct Dispatcher {
    broker: Arc<Broker>,
    registrations: Vec<Registration>,
}

impl Dispatcher {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            registrations: Vec::new(),
        }
    }

    /// Registers a handler with a single worker.
    pub fn register(self, queue: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.register_workers(queue, handler, 1)
    }

    /// Registers a handler served by `workers` concurrent workers.
    pub fn register_workers(
        mut self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        workers: usize,
    ) -> Self {
        self.registrations.push(Registration {
            queue: queue.to_string(),
            handler,
            workers: workers.max(1),
        });
        self
    }

    /// Validates that every registered queue exists, then spawns the
    /// workers. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<DispatcherHandle, BrokerError> {
        for registration in &self.registrations {
            self.broker.queue_depth(&registration.queue)?;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();
        let mut queues: Vec<String> = Vec::new();
        for registration in self.registrations {
            if !queues.contains(&registration.queue) {
                queues.push(registration.queue.clone());
            }
            for _ in 0..registration.workers {
                workers.push(tokio::spawn(run_worker(
                    Arc::clone(&self.broker),
                    registration.queue.clone(),
                    Arc::clone(&registration.handler),
                    shutdown_rx.clone(),
                )));
            }
        }
        info!(
            "Dispatcher started {} workers across {} queues",
            workers.len(),
            queues.len()
        );
        Ok(DispatcherHandle {
            broker: self.broker,
            shutdown_tx,
            workers,
            queues,
        })
    }
}

/// Running dispatcher; dropping it leaves the workers running detached.
pub struct DispatcherHandle {
    broker: Arc<Broker>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    queues: Vec<String>,
}

impl DispatcherHandle {
    /// Signals every worker, waits for each to finish the message in its
    /// hands, then returns any deliveries left in flight to their queues.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for result in join_all(self.workers).await {
            if let Err(e) = result {
                error!("Consumer worker panicked: {}", e);
            }
        }
        for queue in &self.queues {
            if let Err(e) = self.broker.recover(queue) {
                debug!("Skipping recover for queue {}: {}", queue, e);
            }
        }
        info!("Dispatcher stopped");
    }
}

async fn run_worker(
    broker: Arc<Broker>,
    queue: String,
    handler: Arc<dyn ConsumerHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.changed() => break,
            result = broker.consume(&queue, AckMode::Manual) => match result {
                Ok(delivery) => delivery,
                Err(e) => {
                    warn!("Consumer worker for queue {} stopping: {}", queue, e);
                    break;
                }
            },
        };
        let Some(tag) = delivery.delivery_tag else {
            continue;
        };
        let settled = match handler.handle(&delivery).await {
            Ok(()) => broker.ack(&queue, tag),
            Err(HandlerError::Retry) => {
                debug!(
                    "Handler asked to retry message {} on queue {}",
                    delivery.message.message_id, queue
                );
                broker.nack(&queue, tag, true)
            }
            Err(HandlerError::Drop) => {
                warn!(
                    "Handler dropped message {} on queue {}",
                    delivery.message.message_id, queue
                );
                broker.nack(&queue, tag, false)
            }
        };
        if let Err(e) = settled {
            debug!("Could not settle delivery {} on queue {}: {}", tag, queue, e);
        }
    }
}
