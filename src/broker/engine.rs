//! Broker engine
//!
//! This module contains the in-memory routing core responsible for:
//! - managing the exchange and queue registry and their bindings
//! - matching routing keys and appending messages to matched queues
//! - blocking and non-blocking consumption with FIFO handoff
//! - tracking manually acknowledged deliveries and requeuing them
//! - notifying the persistence collaborator about durable state
//!
//! Concurrency and usage notes:
//! - The registry sits behind one `RwLock`. Structural operations hold the
//!   write lock for the map mutation only; publish and consume hold the
//!   read lock just long enough to snapshot bindings or clone a queue
//!   handle, so queues never block each other.
//! - No lock is held across an await. Blocked consumers park on a oneshot
//!   channel inside the queue, and publishers complete the handoff without
//!   leaving the queue lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::exchange::{Exchange, ExchangeKind, ExchangeOptions};
use crate::broker::matcher::select_queues;
use crate::broker::message::{AckMode, Delivery, Message};
use crate::broker::queue::{NackOutcome, PopOrWait, Queue, QueueOptions, RecvGuard};
use crate::config::settings::{BrokerSettings, TopologySettings};
use crate::persistence::store::{NoopStore, Store, StoredBinding, StoredExchange, StoredQueue};
use crate::utils::BrokerError;

/// Longest accepted exchange or queue name, in bytes.
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Default)]
struct Registry {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Arc<Queue>>,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    unroutable: AtomicU64,
    consumed: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

/// A point-in-time snapshot of the broker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Accepted publish calls.
    pub published: u64,
    /// Message copies placed into queues, backlogged or handed off.
    pub delivered: u64,
    /// Publishes that matched no queue.
    pub unroutable: u64,
    /// Deliveries handed to consumers.
    pub consumed: u64,
    /// Deliveries settled by ack.
    pub acked: u64,
    /// Envelopes returned to a backlog by nack or recover.
    pub requeued: u64,
    /// Messages discarded: rejected on overflow, nacked without requeue,
    /// past the redelivery cap, or purged with a deleted queue.
    pub dropped: u64,
}

/// The routing core: an exchange/queue registry with publish dispatch and
/// FIFO consumption.
///
/// All methods take `&self`; a `Broker` is shared between tasks as a plain
/// `Arc<Broker>`.
pub struct Broker {
    registry: RwLock<Registry>,
    settings: BrokerSettings,
    store: Arc<dyn Store>,
    counters: Counters,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// Creates a broker with default settings and no persistence.
    pub fn new() -> Self {
        Self::with_settings(BrokerSettings::default())
    }

    pub fn with_settings(settings: BrokerSettings) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            settings,
            store: Arc::new(NoopStore),
            counters: Counters::default(),
        }
    }

    /// Creates a broker around `store` and restores the durable topology
    /// and backlogs recorded by a previous run.
    pub fn with_persistence(settings: BrokerSettings, store: Arc<dyn Store>) -> Self {
        let broker = Self {
            registry: RwLock::new(Registry::default()),
            settings,
            store,
            counters: Counters::default(),
        };
        broker.restore();
        broker
    }

    fn restore(&self) {
        let state = self.store.load_state();
        if state.exchanges.is_empty() && state.queues.is_empty() {
            return;
        }
        let mut registry = self.write();
        for stored in &state.exchanges {
            registry.exchanges.insert(
                stored.name.clone(),
                Exchange::new(&stored.name, stored.kind, stored.opts),
            );
        }
        for stored in &state.queues {
            registry
                .queues
                .insert(stored.name.clone(), Queue::new(stored.name.clone(), stored.opts));
        }
        let mut bindings = 0usize;
        for stored in &state.bindings {
            if !registry.queues.contains_key(&stored.queue) {
                warn!("Skipping stored binding to unknown queue {}", stored.queue);
                continue;
            }
            match registry.exchanges.get_mut(&stored.exchange) {
                Some(exchange) => {
                    exchange.bind(&stored.queue, &stored.pattern);
                    bindings += 1;
                }
                None => warn!(
                    "Skipping stored binding to unknown exchange {}",
                    stored.exchange
                ),
            }
        }
        let mut messages = 0usize;
        for (name, queue) in &registry.queues {
            if !queue.is_durable() {
                continue;
            }
            for message in self.store.load_messages(name) {
                let message = Arc::new(message);
                match queue.enqueue(Arc::clone(&message)) {
                    Ok(_) => messages += 1,
                    Err(e) => {
                        self.store.remove_message(name, &message);
                        warn!("Dropping stored message {}: {}", message.message_id, e);
                    }
                }
            }
        }
        info!(
            "Restored durable state: {} exchanges, {} queues, {} bindings, {} messages",
            state.exchanges.len(),
            state.queues.len(),
            bindings,
            messages
        );
    }

    /// Creates an exchange, or verifies an existing declaration.
    /// Re-declaring with the same kind and options is a no-op.
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        opts: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        if name.is_empty() {
            return Err(BrokerError::ReservedExchange);
        }
        Self::validate_name(name)?;
        let mut registry = self.write();
        if let Some(existing) = registry.exchanges.get(name) {
            if existing.kind != kind {
                return Err(BrokerError::ExchangeKindMismatch {
                    name: name.to_string(),
                    existing: existing.kind,
                    requested: kind,
                });
            }
            if existing.opts != opts {
                return Err(BrokerError::ExchangeOptionsMismatch(name.to_string()));
            }
            debug!("Exchange {} already declared", name);
            return Ok(());
        }
        registry
            .exchanges
            .insert(name.to_string(), Exchange::new(name, kind, opts));
        if opts.durable {
            self.store.save_exchange(&StoredExchange {
                name: name.to_string(),
                kind,
                opts,
            });
        }
        info!("Declared {} exchange {}", kind, name);
        Ok(())
    }

    /// Creates a queue, or verifies an existing declaration. Queues without
    /// an explicit `max_length` inherit the configured broker default.
    pub fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<(), BrokerError> {
        Self::validate_name(name)?;
        let mut effective = opts;
        if effective.max_length.is_none() {
            effective.max_length = self.settings.default_max_queue_length;
        }
        let mut registry = self.write();
        if let Some(existing) = registry.queues.get(name) {
            if existing.opts() != effective {
                return Err(BrokerError::QueueOptionsMismatch(name.to_string()));
            }
            debug!("Queue {} already declared", name);
            return Ok(());
        }
        registry
            .queues
            .insert(name.to_string(), Queue::new(name, effective));
        if effective.durable {
            self.store.save_queue(&StoredQueue {
                name: name.to_string(),
                opts: effective,
            });
        }
        info!("Declared queue {}", name);
        Ok(())
    }

    /// Associates a queue with an exchange under a routing pattern.
    /// Binding the same triple twice is a no-op.
    pub fn bind(&self, exchange: &str, queue: &str, pattern: &str) -> Result<(), BrokerError> {
        if exchange.is_empty() {
            return Err(BrokerError::ReservedExchange);
        }
        let mut registry = self.write();
        let registry = &mut *registry;
        let Some(ex) = registry.exchanges.get_mut(exchange) else {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        };
        let Some(q) = registry.queues.get(queue) else {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        };
        if ex.bind(queue, pattern) {
            if ex.opts.durable && q.is_durable() {
                self.store.save_binding(&StoredBinding {
                    exchange: exchange.to_string(),
                    queue: queue.to_string(),
                    pattern: pattern.to_string(),
                });
            }
            info!(
                "Bound queue {} to exchange {} with pattern {}",
                queue, exchange, pattern
            );
        }
        Ok(())
    }

    /// Removes a binding. Removing one that does not exist is a no-op.
    pub fn unbind(&self, exchange: &str, queue: &str, pattern: &str) -> Result<(), BrokerError> {
        if exchange.is_empty() {
            return Err(BrokerError::ReservedExchange);
        }
        let mut registry = self.write();
        let registry = &mut *registry;
        let Some(ex) = registry.exchanges.get_mut(exchange) else {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        };
        let Some(q) = registry.queues.get(queue) else {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        };
        if ex.unbind(queue, pattern) {
            if ex.opts.durable && q.is_durable() {
                self.store.remove_binding(&StoredBinding {
                    exchange: exchange.to_string(),
                    queue: queue.to_string(),
                    pattern: pattern.to_string(),
                });
            }
            info!(
                "Unbound queue {} from exchange {} (pattern {})",
                queue, exchange, pattern
            );
        }
        Ok(())
    }

    /// Removes an exchange and every binding it holds.
    pub fn delete_exchange(&self, name: &str) -> Result<(), BrokerError> {
        if name.is_empty() {
            return Err(BrokerError::ReservedExchange);
        }
        let mut registry = self.write();
        let Some(exchange) = registry.exchanges.remove(name) else {
            return Err(BrokerError::ExchangeNotFound(name.to_string()));
        };
        if exchange.opts.durable {
            self.store.remove_exchange(name);
        }
        info!(
            "Deleted exchange {} and its {} bindings",
            name,
            exchange.bindings().len()
        );
        Ok(())
    }

    /// Removes a queue, every binding referencing it, its backlog and its
    /// in-flight deliveries. Blocked consumers are released empty-handed.
    pub fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut registry = self.write();
        let Some(queue) = registry.queues.remove(name) else {
            return Err(BrokerError::QueueNotFound(name.to_string()));
        };
        for exchange in registry.exchanges.values_mut() {
            exchange.unbind_queue(name);
        }
        let purged = queue.close();
        if queue.is_durable() {
            self.store.remove_queue(name);
        }
        self.counters
            .dropped
            .fetch_add(purged.len() as u64, Ordering::Relaxed);
        info!("Deleted queue {} and discarded {} messages", name, purged.len());
        Ok(())
    }

    /// Pending backlog length of a queue.
    pub fn queue_depth(&self, name: &str) -> Result<usize, BrokerError> {
        Ok(self.queue_handle(name)?.depth())
    }

    /// Deliveries of a queue awaiting acknowledgment.
    pub fn unacked(&self, name: &str) -> Result<usize, BrokerError> {
        Ok(self.queue_handle(name)?.unacked())
    }

    /// Routes `payload` through an exchange and appends it to every matched
    /// queue. The empty exchange name addresses the queue named by the
    /// routing key directly. Returns the number of queues that received the
    /// message; zero matches drops it without error.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<usize, BrokerError> {
        let targets = self.route(exchange, routing_key)?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        if targets.is_empty() {
            self.counters.unroutable.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Unroutable message on exchange '{}' with key '{}'",
                exchange, routing_key
            );
            return Ok(0);
        }
        let message = Arc::new(Message::new(routing_key, payload));
        let mut delivered = 0usize;
        let mut full: Option<String> = None;
        for queue in &targets {
            // Recorded before the append so a consumer can never settle the
            // message ahead of the record.
            if queue.is_durable() {
                self.store.save_message(queue.name(), &message);
            }
            match queue.enqueue(Arc::clone(&message)) {
                Ok(_) => {
                    delivered += 1;
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(BrokerError::CapacityExceeded(name)) => {
                    if queue.is_durable() {
                        self.store.remove_message(queue.name(), &message);
                    }
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Queue {} is full, rejecting message {}", name, message.message_id);
                    full.get_or_insert(name);
                }
                Err(_) => {
                    // Deleted between snapshot and append; dropped with it.
                    if queue.is_durable() {
                        self.store.remove_message(queue.name(), &message);
                    }
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("Queue {} vanished before append", queue.name());
                }
            }
        }
        match full {
            Some(name) => Err(BrokerError::CapacityExceeded(name)),
            None => Ok(delivered),
        }
    }

    /// Non-blocking consume. `Empty` when nothing is pending.
    pub fn try_consume(&self, queue: &str, mode: AckMode) -> Result<Delivery, BrokerError> {
        let queue = self.queue_handle(queue)?;
        let delivery = queue.try_pop(mode)?;
        self.finish_delivery(&queue, &delivery);
        Ok(delivery)
    }

    /// Blocks until a message arrives. Consumers blocked on the same queue
    /// are served in arrival order. Dropping the returned future never
    /// loses a message: one already handed over goes back to its place in
    /// the queue.
    pub async fn consume(&self, queue: &str, mode: AckMode) -> Result<Delivery, BrokerError> {
        let queue = self.queue_handle(queue)?;
        let delivery = match queue.pop_or_wait(mode)? {
            PopOrWait::Ready(delivery) => delivery,
            PopOrWait::Wait(rx) => {
                let guard = RecvGuard::new(Arc::clone(&queue), rx);
                match guard.recv().await {
                    Some(envelope) => queue.finish_handoff(envelope, mode),
                    None => return Err(BrokerError::QueueNotFound(queue.name().to_string())),
                }
            }
        };
        self.finish_delivery(&queue, &delivery);
        Ok(delivery)
    }

    /// As [`Broker::consume`], but gives up with `Empty` after `timeout`.
    pub async fn consume_timeout(
        &self,
        queue: &str,
        mode: AckMode,
        timeout: Duration,
    ) -> Result<Delivery, BrokerError> {
        match tokio::time::timeout(timeout, self.consume(queue, mode)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Empty),
        }
    }

    /// Settles a manually acknowledged delivery.
    pub fn ack(&self, queue: &str, tag: u64) -> Result<(), BrokerError> {
        let queue = self.queue_handle(queue)?;
        let message = queue.ack(tag)?;
        if queue.is_durable() {
            self.store.remove_message(queue.name(), &message);
        }
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        debug!("Acked delivery {} on queue {}", tag, queue.name());
        Ok(())
    }

    /// Rejects a delivery. With `requeue` it returns to its arrival
    /// position in the queue; past the redelivery cap it is dropped
    /// instead.
    pub fn nack(&self, queue: &str, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let queue = self.queue_handle(queue)?;
        match queue.nack(tag, requeue, self.settings.max_redeliveries)? {
            NackOutcome::Requeued => {
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                debug!("Requeued delivery {} on queue {}", tag, queue.name());
            }
            NackOutcome::Dropped(message) => {
                if queue.is_durable() {
                    self.store.remove_message(queue.name(), &message);
                }
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Message {} dropped after {} redeliveries",
                    message.message_id, self.settings.max_redeliveries
                );
            }
            NackOutcome::Discarded(message) => {
                if queue.is_durable() {
                    self.store.remove_message(queue.name(), &message);
                }
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Discarded delivery {} on queue {}", tag, queue.name());
            }
        }
        Ok(())
    }

    /// Returns every unacknowledged delivery of a queue to its backlog in
    /// original arrival order, as after a consumer disconnect. Deliveries
    /// past the redelivery cap are dropped instead. Returns how many went
    /// back.
    pub fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        let queue = self.queue_handle(queue)?;
        let outcome = queue.recover(self.settings.max_redeliveries);
        for message in &outcome.dropped {
            if queue.is_durable() {
                self.store.remove_message(queue.name(), message);
            }
            warn!(
                "Message {} dropped after {} redeliveries",
                message.message_id, self.settings.max_redeliveries
            );
        }
        self.counters
            .requeued
            .fetch_add(outcome.requeued as u64, Ordering::Relaxed);
        self.counters
            .dropped
            .fetch_add(outcome.dropped.len() as u64, Ordering::Relaxed);
        if outcome.requeued > 0 {
            info!(
                "Recovered {} deliveries onto queue {}",
                outcome.requeued,
                queue.name()
            );
        }
        Ok(outcome.requeued)
    }

    /// Declares the exchanges, queues and bindings of a configured
    /// topology. Idempotent when re-applied unchanged.
    pub fn install_topology(&self, topology: &TopologySettings) -> Result<(), BrokerError> {
        for spec in &topology.exchanges {
            let opts = ExchangeOptions {
                durable: spec.durable,
            };
            self.declare_exchange(&spec.name, spec.kind, opts)?;
        }
        for spec in &topology.queues {
            let opts = QueueOptions {
                durable: spec.durable,
                max_length: spec.max_length,
            };
            self.declare_queue(&spec.name, opts)?;
        }
        for spec in &topology.bindings {
            self.bind(&spec.exchange, &spec.queue, &spec.pattern)?;
        }
        info!(
            "Installed topology: {} exchanges, {} queues, {} bindings",
            topology.exchanges.len(),
            topology.queues.len(),
            topology.bindings.len()
        );
        Ok(())
    }

    /// A point-in-time snapshot of the broker counters.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            unroutable: self.counters.unroutable.load(Ordering::Relaxed),
            consumed: self.counters.consumed.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<Queue>>, BrokerError> {
        let registry = self.read();
        if exchange.is_empty() {
            // Default exchange: the routing key addresses a queue directly.
            return Ok(registry
                .queues
                .get(routing_key)
                .cloned()
                .into_iter()
                .collect());
        }
        let Some(ex) = registry.exchanges.get(exchange) else {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        };
        Ok(select_queues(ex.kind, ex.bindings(), routing_key)
            .into_iter()
            .filter_map(|name| registry.queues.get(name).cloned())
            .collect())
    }

    /// Counts the delivery and, for auto acknowledgment, discharges the
    /// stored copy: the pop itself settles the message.
    fn finish_delivery(&self, queue: &Queue, delivery: &Delivery) {
        self.counters.consumed.fetch_add(1, Ordering::Relaxed);
        if delivery.delivery_tag.is_none() && queue.is_durable() {
            self.store.remove_message(queue.name(), &delivery.message);
        }
    }

    pub(crate) fn queue_handle(&self, name: &str) -> Result<Arc<Queue>, BrokerError> {
        self.read()
            .queues
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    fn validate_name(name: &str) -> Result<(), BrokerError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('\u{0}') {
            return Err(BrokerError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        match self.registry.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        match self.registry.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("settings", &self.settings)
            .field("store", &"dyn Store")
            .finish()
    }
}
