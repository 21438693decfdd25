//! Work-queue broker
//!
//! Point-to-point queues with at-least-once delivery. Every received
//! message stays unacknowledged until the consumer calls
//! [`MessageBroker::ack`]. A delay exchange redelivers a message to its
//! queue after a pause, and a dead-letter queue parks messages that ran out
//! of attempts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::types::{Delivery, QueuedMessage};

/// Broker error types.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Broker was closed
    #[error("Broker closed")]
    Closed,

    /// Ack for a delivery that is not outstanding
    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(u64),

    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Broker statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Messages published, including delayed and dead-lettered ones
    pub published: u64,
    /// Messages handed to consumers
    pub delivered: u64,
    /// Deliveries acknowledged
    pub acked: u64,
    /// Messages routed through the delay exchange
    pub delayed: u64,
    /// Messages parked on a dead-letter queue
    pub dead_lettered: u64,
    /// Deliveries awaiting acknowledgement
    pub unacked: usize,
}

/// Work-queue broker trait.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Append a message to a queue.
    async fn publish(&self, queue: &str, message: QueuedMessage) -> BrokerResult<()>;

    /// Append a message to a queue once `delay` has passed.
    async fn publish_delayed(
        &self,
        queue: &str,
        message: QueuedMessage,
        delay: Duration,
    ) -> BrokerResult<()>;

    /// Wait for the next message on a queue.
    ///
    /// Several consumers may wait on the same queue; each message goes to
    /// exactly one of them. Returns `None` once the broker is closed.
    async fn receive(&self, queue: &str) -> BrokerResult<Option<Delivery>>;

    /// Acknowledge a delivery, removing the message for good.
    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()>;

    /// Give a delivery back, returning its message unchanged to the queue.
    async fn nack(&self, delivery: &Delivery) -> BrokerResult<()>;

    /// Park a message on a dead-letter queue with the reason it failed.
    async fn dead_letter(
        &self,
        queue: &str,
        message: QueuedMessage,
        reason: &str,
    ) -> BrokerResult<()>;

    /// Number of messages waiting on a queue.
    async fn depth(&self, queue: &str) -> BrokerResult<usize>;

    /// Stop handing out messages and wake all waiting consumers.
    async fn close(&self);

    /// Get broker stats.
    async fn stats(&self) -> BrokerStats;
}

struct QueueChannel {
    sender: mpsc::UnboundedSender<QueuedMessage>,
    receiver: Mutex<mpsc::UnboundedReceiver<QueuedMessage>>,
    depth: AtomicUsize,
}

impl QueueChannel {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            depth: AtomicUsize::new(0),
        }
    }

    fn push(&self, message: QueuedMessage) -> BrokerResult<()> {
        // Counted before sending so a fast receiver never sees depth 0
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.sender.send(message).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            BrokerError::Closed
        })
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    delayed: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Resolves once the close flag is raised.
async fn wait_closed(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// In-memory broker implementation.
///
/// Suitable for a single process and for tests. Delayed messages are held
/// by timer tasks, so a process restart loses them.
pub struct MemoryBroker {
    /// Queues by name, created on first use
    queues: RwLock<HashMap<String, Arc<QueueChannel>>>,
    /// Deliveries awaiting ack
    unacked: StdMutex<HashMap<u64, Delivery>>,
    /// Next delivery tag
    next_tag: AtomicU64,
    /// Close flag
    closed: watch::Sender<bool>,
    /// Statistics
    counters: Arc<Counters>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            queues: RwLock::new(HashMap::new()),
            unacked: StdMutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            closed,
            counters: Arc::new(Counters::default()),
        }
    }

    fn unacked(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Delivery>> {
        self.unacked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn queue(&self, name: &str) -> Arc<QueueChannel> {
        if let Some(queue) = self.queues.read().await.get(name) {
            return queue.clone();
        }
        self.queues
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueChannel::new()))
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, queue: &str, message: QueuedMessage) -> BrokerResult<()> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        self.queue(queue).await.push(message)?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        message: QueuedMessage,
        delay: Duration,
    ) -> BrokerResult<()> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let channel = self.queue(queue).await;
        let counters = self.counters.clone();
        let queue = queue.to_string();
        self.counters.delayed.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let message_id = message.id;
            match channel.push(message) {
                Ok(()) => {
                    counters.published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(%queue, %message_id, error = %e, "Delayed message lost");
                }
            }
        });

        Ok(())
    }

    async fn receive(&self, queue: &str) -> BrokerResult<Option<Delivery>> {
        if self.is_closed() {
            return Ok(None);
        }
        let channel = self.queue(queue).await;

        let message = tokio::select! {
            _ = wait_closed(self.closed.subscribe()) => None,
            message = async { channel.receiver.lock().await.recv().await } => message,
        };
        let Some(message) = message else {
            return Ok(None);
        };
        channel.depth.fetch_sub(1, Ordering::SeqCst);

        let delivery = Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::SeqCst),
            queue: queue.to_string(),
            message,
        };
        self.unacked().insert(delivery.tag, delivery.clone());
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);

        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        self.unacked()
            .remove(&delivery.tag)
            .ok_or(BrokerError::UnknownDelivery(delivery.tag))?;
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> BrokerResult<()> {
        let delivery = self
            .unacked()
            .remove(&delivery.tag)
            .ok_or(BrokerError::UnknownDelivery(delivery.tag))?;
        self.queue(&delivery.queue).await.push(delivery.message)?;
        tracing::debug!(queue = %delivery.queue, tag = delivery.tag, "Delivery returned to queue");
        Ok(())
    }

    async fn dead_letter(
        &self,
        queue: &str,
        message: QueuedMessage,
        reason: &str,
    ) -> BrokerResult<()> {
        self.publish(queue, message.failed(reason)).await?;
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn depth(&self, queue: &str) -> BrokerResult<usize> {
        Ok(self
            .queues
            .read()
            .await
            .get(queue)
            .map_or(0, |channel| channel.depth.load(Ordering::SeqCst)))
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        tracing::debug!("Memory broker closed");
    }

    async fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
            delayed: self.counters.delayed.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            unacked: self.unacked().len(),
        }
    }
}
