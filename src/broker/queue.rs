//! FIFO queue with direct handoff to waiting consumers.
//!
//! A queue keeps three collections behind one mutex: the backlog of
//! undelivered envelopes, the waiters parked in [`consume`] calls, and the
//! unacknowledged deliveries keyed by delivery tag. The lock is held only
//! for pointer-sized bookkeeping, never across an await.
//!
//! Invariant: a non-empty backlog implies no live waiters. Every enqueue
//! offers the envelope to waiters before touching the backlog, and every
//! requeue path does the same.
//!
//! [`consume`]: crate::broker::Broker::consume

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::broker::message::{AckMode, Delivery, Message};
use crate::utils::BrokerError;

/// Settings fixed at declaration time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Survive restarts when the broker runs with a persistent store.
    #[serde(default)]
    pub durable: bool,
    /// Upper bound on backlogged messages. `None` means unbounded.
    #[serde(default)]
    pub max_length: Option<usize>,
}

impl QueueOptions {
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }
}

/// A message resident in a queue, together with its delivery history.
/// `seq` is assigned once at first enqueue and orders the backlog; every
/// requeue path puts the envelope back at its arrival position.
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub(crate) message: Arc<Message>,
    pub(crate) redeliveries: u32,
    seq: u64,
}

impl Envelope {
    fn new(message: Arc<Message>, seq: u64) -> Self {
        Self {
            message,
            redeliveries: 0,
            seq,
        }
    }
}

/// Where an enqueued envelope ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueOutcome {
    /// Handed straight to a parked consumer.
    Delivered,
    /// Appended to the backlog.
    Backlogged,
}

/// What a negative acknowledgement did with the envelope.
#[derive(Debug)]
pub(crate) enum NackOutcome {
    /// Returned to the queue for redelivery.
    Requeued,
    /// Redelivery cap reached; the message was dropped.
    Dropped(Arc<Message>),
    /// Requeue not requested; the message was discarded.
    Discarded(Arc<Message>),
}

/// Result of [`Queue::recover`].
#[derive(Debug, Default)]
pub(crate) struct RecoverOutcome {
    pub(crate) requeued: usize,
    /// Messages over the redelivery cap, dropped instead of requeued.
    pub(crate) dropped: Vec<Arc<Message>>,
}

/// Either an immediately available delivery or a parked waiter.
pub(crate) enum PopOrWait {
    Ready(Delivery),
    Wait(oneshot::Receiver<Envelope>),
}

#[derive(Debug, Default)]
struct QueueInner {
    backlog: VecDeque<Envelope>,
    waiters: VecDeque<oneshot::Sender<Envelope>>,
    unacked: BTreeMap<u64, Envelope>,
    next_tag: u64,
    next_seq: u64,
    closed: bool,
}

impl QueueInner {
    /// Offers an envelope to the oldest live waiter. Dead waiters left
    /// behind by cancelled futures are dropped along the way. Returns the
    /// envelope back when nobody is parked.
    fn offer(&mut self, envelope: Envelope) -> Option<Envelope> {
        let mut envelope = envelope;
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(envelope) {
                Ok(()) => return None,
                Err(back) => envelope = back,
            }
        }
        Some(envelope)
    }

    /// Puts an envelope back, preferring a live waiter; otherwise it is
    /// inserted into the backlog at its arrival position, so a requeue can
    /// never leapfrog an older message. The backlog stays sorted by `seq`.
    fn requeue(&mut self, envelope: Envelope) {
        if let Some(envelope) = self.offer(envelope) {
            let at = self
                .backlog
                .iter()
                .position(|queued| queued.seq > envelope.seq)
                .unwrap_or(self.backlog.len());
            self.backlog.insert(at, envelope);
        }
    }
}

/// A named FIFO queue.
#[derive(Debug)]
pub(crate) struct Queue {
    name: String,
    opts: QueueOptions,
    inner: Mutex<QueueInner>,
}

impl Queue {
    pub(crate) fn new(name: impl Into<String>, opts: QueueOptions) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            opts,
            inner: Mutex::new(QueueInner::default()),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn opts(&self) -> QueueOptions {
        self.opts
    }

    pub(crate) fn is_durable(&self) -> bool {
        self.opts.durable
    }

    /// Number of backlogged (undelivered) messages.
    pub(crate) fn depth(&self) -> usize {
        self.lock().backlog.len()
    }

    /// Number of deliveries awaiting acknowledgement.
    pub(crate) fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Number of parked waiters, dead or alive.
    pub(crate) fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Appends a message, or hands it straight to a parked consumer.
    pub(crate) fn enqueue(&self, message: Arc<Message>) -> Result<EnqueueOutcome, BrokerError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(BrokerError::QueueNotFound(self.name.clone()));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let envelope = match inner.offer(Envelope::new(message, seq)) {
            None => return Ok(EnqueueOutcome::Delivered),
            Some(envelope) => envelope,
        };
        if let Some(max) = self.opts.max_length {
            if inner.backlog.len() >= max {
                return Err(BrokerError::CapacityExceeded(self.name.clone()));
            }
        }
        inner.backlog.push_back(envelope);
        Ok(EnqueueOutcome::Backlogged)
    }

    /// Pops the head of the backlog without waiting.
    pub(crate) fn try_pop(&self, mode: AckMode) -> Result<Delivery, BrokerError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(BrokerError::QueueNotFound(self.name.clone()));
        }
        match inner.backlog.pop_front() {
            Some(envelope) => Ok(self.make_delivery(&mut inner, envelope, mode)),
            None => Err(BrokerError::Empty),
        }
    }

    /// Pops the head of the backlog, or parks a waiter for the next
    /// message. Popping and parking happen under one lock acquisition, so
    /// no message can slip past a consumer that found the backlog empty.
    /// Waiters left behind by timed-out or cancelled calls are pruned
    /// before parking, so an idle queue holds at most one dead waiter.
    pub(crate) fn pop_or_wait(&self, mode: AckMode) -> Result<PopOrWait, BrokerError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(BrokerError::QueueNotFound(self.name.clone()));
        }
        if let Some(envelope) = inner.backlog.pop_front() {
            let delivery = self.make_delivery(&mut inner, envelope, mode);
            return Ok(PopOrWait::Ready(delivery));
        }
        inner.waiters.retain(|waiter| !waiter.is_closed());
        let (tx, rx) = oneshot::channel();
        inner.waiters.push_back(tx);
        Ok(PopOrWait::Wait(rx))
    }

    /// Records the delivery bookkeeping for an envelope taken off the
    /// waiter channel rather than the backlog.
    pub(crate) fn finish_handoff(&self, envelope: Envelope, mode: AckMode) -> Delivery {
        let mut inner = self.lock();
        self.make_delivery(&mut inner, envelope, mode)
    }

    /// Puts an envelope back at its arrival position, preferring a live
    /// waiter. Used when a waiting consume future is dropped after the
    /// handoff already happened. Dropped silently if the queue is gone.
    pub(crate) fn requeue(&self, envelope: Envelope) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.requeue(envelope);
    }

    /// Settles a delivery. Returns the message so the caller can release
    /// any durable copy.
    pub(crate) fn ack(&self, tag: u64) -> Result<Arc<Message>, BrokerError> {
        let mut inner = self.lock();
        match inner.unacked.remove(&tag) {
            Some(envelope) => Ok(envelope.message),
            None => Err(BrokerError::UnknownDelivery {
                queue: self.name.clone(),
                tag,
            }),
        }
    }

    /// Rejects a delivery. With `requeue`, the envelope returns to its
    /// arrival position in the queue and its redelivery count goes up;
    /// past `max_redeliveries` it is dropped instead.
    pub(crate) fn nack(
        &self,
        tag: u64,
        requeue: bool,
        max_redeliveries: u32,
    ) -> Result<NackOutcome, BrokerError> {
        let mut inner = self.lock();
        let mut envelope = match inner.unacked.remove(&tag) {
            Some(envelope) => envelope,
            None => {
                return Err(BrokerError::UnknownDelivery {
                    queue: self.name.clone(),
                    tag,
                });
            }
        };
        if !requeue {
            return Ok(NackOutcome::Discarded(envelope.message));
        }
        envelope.redeliveries += 1;
        if envelope.redeliveries > max_redeliveries {
            return Ok(NackOutcome::Dropped(envelope.message));
        }
        inner.requeue(envelope);
        Ok(NackOutcome::Requeued)
    }

    /// Returns every unacknowledged delivery to the queue at its arrival
    /// position, ahead of anything published after it. Envelopes past the
    /// redelivery cap are dropped and reported back.
    pub(crate) fn recover(&self, max_redeliveries: u32) -> RecoverOutcome {
        let mut inner = self.lock();
        let pending = std::mem::take(&mut inner.unacked);
        let mut outcome = RecoverOutcome::default();
        let mut keep: Vec<Envelope> = Vec::with_capacity(pending.len());
        for (_, mut envelope) in pending {
            envelope.redeliveries += 1;
            if envelope.redeliveries > max_redeliveries {
                outcome.dropped.push(envelope.message);
            } else {
                keep.push(envelope);
            }
        }
        outcome.requeued = keep.len();
        // Tag order is delivery order, so waiters see oldest first.
        for envelope in keep {
            inner.requeue(envelope);
        }
        outcome
    }

    /// Marks the queue closed, wakes every waiter empty-handed, and
    /// returns all resident messages for cleanup.
    pub(crate) fn close(&self) -> Vec<Arc<Message>> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.waiters.clear();
        let mut resident: Vec<Arc<Message>> = inner
            .backlog
            .drain(..)
            .map(|envelope| envelope.message)
            .collect();
        let pending = std::mem::take(&mut inner.unacked);
        resident.extend(pending.into_values().map(|envelope| envelope.message));
        resident
    }

    fn make_delivery(
        &self,
        inner: &mut QueueInner,
        envelope: Envelope,
        mode: AckMode,
    ) -> Delivery {
        let delivery_tag = match mode {
            AckMode::Auto => None,
            AckMode::Manual => {
                inner.next_tag += 1;
                let tag = inner.next_tag;
                inner.unacked.insert(tag, envelope.clone());
                Some(tag)
            }
        };
        Delivery {
            message: envelope.message,
            queue: self.name.clone(),
            delivery_tag,
            redeliveries: envelope.redeliveries,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Holds a parked waiter's receiving end. If the future waiting on it is
/// dropped after a message was already handed off, the message goes back
/// to its place in the queue instead of vanishing with the channel.
pub(crate) struct RecvGuard {
    queue: Arc<Queue>,
    rx: Option<oneshot::Receiver<Envelope>>,
}

impl RecvGuard {
    pub(crate) fn new(queue: Arc<Queue>, rx: oneshot::Receiver<Envelope>) -> Self {
        Self {
            queue,
            rx: Some(rx),
        }
    }

    /// Waits for the handoff. `None` means the queue was deleted out from
    /// under the waiter.
    pub(crate) async fn recv(mut self) -> Option<Envelope> {
        let rx = self.rx.as_mut()?;
        let received = rx.await.ok();
        if received.is_some() {
            // Handoff observed; nothing for Drop to give back.
            self.rx = None;
        }
        received
    }
}

impl Drop for RecvGuard {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            if let Ok(envelope) = rx.try_recv() {
                self.queue.requeue(envelope);
            }
        }
    }
}
