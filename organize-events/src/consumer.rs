//! Ingestion queue consumer
//!
//! Applies node creation messages from the ingestion queue. Each delivery
//! moves through `Received -> Applying -> Committed | Requeued |
//! DeadLettered`, and is acknowledged only after its follow-up message (if
//! any) has been published. A crash between the two can therefore repeat a
//! message but never lose one; the idempotent insert absorbs repeats. When
//! the follow-up cannot be published the delivery is handed back with
//! [`MessageBroker::nack`] instead.

use organize_core::{HierarchyService, InsertOutcome, NodePayload};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::broker::{BrokerError, MessageBroker};
use crate::types::Delivery;

/// Default ingestion queue.
pub const ORGANIZE_QUEUE: &str = "insight.organize";

/// Default name of the delay exchange feeding back into the ingestion queue.
pub const DELAY_QUEUE: &str = "insight.organize.delay";

/// Default dead-letter queue.
pub const DEAD_LETTER_QUEUE: &str = "insight.organize.dead";

/// Why a delivery could not be applied.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Body is not a valid creation payload
    #[error("Invalid message body: {0}")]
    Decode(#[from] serde_json::Error),

    /// Insert was rejected or the store failed
    #[error("Insert failed: {0}")]
    Apply(#[from] organize_core::HierarchyError),

    /// Broker failure while acking or republishing
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queue to consume
    pub queue: String,

    /// Pause before a failed message comes back
    pub retry_delay: Duration,

    /// Redeliveries allowed before a message is dead-lettered
    pub max_redeliveries: u32,

    /// Where exhausted messages go
    pub dead_letter_queue: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: ORGANIZE_QUEUE.to_string(),
            retry_delay: Duration::from_secs(5),
            max_redeliveries: 5,
            dead_letter_queue: DEAD_LETTER_QUEUE.to_string(),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A new node was written
    Committed,
    /// The node already existed; nothing changed
    Duplicate,
    /// Scheduled for another attempt through the delay exchange
    Requeued {
        /// Redelivery number of the scheduled copy
        attempt: u32,
    },
    /// Parked on the dead-letter queue
    DeadLettered,
}

/// Consumer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries received
    pub received: u64,
    /// Nodes written
    pub committed: u64,
    /// Deliveries for nodes that already existed
    pub duplicates: u64,
    /// Deliveries sent back through the delay exchange
    pub requeued: u64,
    /// Deliveries parked on the dead-letter queue
    pub dead_lettered: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    committed: AtomicU64,
    duplicates: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Consumes node creation messages one at a time.
///
/// Several consumers may share a queue; the broker hands each message to
/// exactly one of them.
#[derive(Clone)]
pub struct QueueConsumer {
    service: HierarchyService,
    broker: Arc<dyn MessageBroker>,
    config: ConsumerConfig,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("config", &self.config)
            .finish()
    }
}

impl QueueConsumer {
    /// Creates a consumer.
    pub fn new(
        service: HierarchyService,
        broker: Arc<dyn MessageBroker>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            service,
            broker,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    /// The consumer's configuration.
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Get consumer stats.
    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.counters.received.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
        }
    }

    async fn apply(&self, delivery: &Delivery) -> Result<InsertOutcome, ConsumerError> {
        let payload: NodePayload = serde_json::from_str(&delivery.message.body)?;
        Ok(self.service.insert_raw(payload).await?)
    }

    /// Give a delivery back after its follow-up publish failed.
    async fn release(&self, delivery: &Delivery, cause: BrokerError) -> ConsumerError {
        if let Err(e) = self.broker.nack(delivery).await {
            tracing::error!(
                message_id = %delivery.message.id,
                error = %e,
                "Delivery could not be returned to its queue"
            );
        }
        cause.into()
    }

    /// Apply one delivery and acknowledge it.
    ///
    /// Only broker failures are returned; a message that cannot be applied
    /// is requeued or dead-lettered and reported through the outcome. If
    /// the requeue or dead-letter publish fails the delivery is returned
    /// to its queue unacknowledged.
    pub async fn handle(&self, delivery: Delivery) -> Result<MessageOutcome, ConsumerError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let message_id = delivery.message.id;

        let outcome = match self.apply(&delivery).await {
            Ok(InsertOutcome::Inserted) => {
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%message_id, "Node committed from queue");
                MessageOutcome::Committed
            }
            Ok(InsertOutcome::AlreadyExists) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%message_id, "Node already present, message ignored");
                MessageOutcome::Duplicate
            }
            Err(e) if delivery.message.attempts < self.config.max_redeliveries => {
                let retry = delivery.message.redelivery(e.to_string());
                let attempt = retry.attempts;
                if let Err(failure) = self
                    .broker
                    .publish_delayed(&self.config.queue, retry, self.config.retry_delay)
                    .await
                {
                    return Err(self.release(&delivery, failure).await);
                }
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    %message_id,
                    attempt,
                    error = %e,
                    "Message failed, scheduled for redelivery"
                );
                MessageOutcome::Requeued { attempt }
            }
            Err(e) => {
                if let Err(failure) = self
                    .broker
                    .dead_letter(
                        &self.config.dead_letter_queue,
                        delivery.message.clone(),
                        &e.to_string(),
                    )
                    .await
                {
                    return Err(self.release(&delivery, failure).await);
                }
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    %message_id,
                    attempts = delivery.message.attempts,
                    error = %e,
                    "Message dead-lettered"
                );
                MessageOutcome::DeadLettered
            }
        };

        self.broker.ack(&delivery).await?;
        Ok(outcome)
    }

    /// Receive and handle one message; `None` once the broker is closed.
    pub async fn process_next(&self) -> Result<Option<MessageOutcome>, ConsumerError> {
        match self.broker.receive(&self.config.queue).await? {
            Some(delivery) => self.handle(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Consume until the broker closes or `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(queue = %self.config.queue, "Queue consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Only the wait is raced against shutdown; a received delivery
            // is always carried through to its ack.
            let received = tokio::select! {
                received = self.broker.receive(&self.config.queue) => received,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let result = match received {
                Ok(Some(delivery)) => self.handle(delivery).await.map(|_| ()),
                Ok(None) => break,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                tracing::error!(queue = %self.config.queue, error = %e, "Queue consumer error");
                tokio::time::sleep(self.config.retry_delay.min(Duration::from_secs(1))).await;
            }
        }

        tracing::info!(queue = %self.config.queue, stats = ?self.stats(), "Queue consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::broker::{BrokerResult, BrokerStats};
    use crate::types::QueuedMessage;
    use async_trait::async_trait;
    use organize_core::{MemoryStore, NodeType, NoopAuditSink, UuidV7Generator};
    use uuid::Uuid;

    /// Memory broker whose delay exchange and dead-letter queue are down.
    struct NoFollowUp(MemoryBroker);

    #[async_trait]
    impl MessageBroker for NoFollowUp {
        async fn publish(&self, queue: &str, message: QueuedMessage) -> BrokerResult<()> {
            self.0.publish(queue, message).await
        }

        async fn publish_delayed(
            &self,
            _queue: &str,
            _message: QueuedMessage,
            _delay: Duration,
        ) -> BrokerResult<()> {
            Err(BrokerError::ConnectionError("delay exchange down".to_string()))
        }

        async fn receive(&self, queue: &str) -> BrokerResult<Option<Delivery>> {
            self.0.receive(queue).await
        }

        async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
            self.0.ack(delivery).await
        }

        async fn nack(&self, delivery: &Delivery) -> BrokerResult<()> {
            self.0.nack(delivery).await
        }

        async fn dead_letter(
            &self,
            _queue: &str,
            _message: QueuedMessage,
            _reason: &str,
        ) -> BrokerResult<()> {
            Err(BrokerError::ConnectionError("dead-letter queue down".to_string()))
        }

        async fn depth(&self, queue: &str) -> BrokerResult<usize> {
            self.0.depth(queue).await
        }

        async fn close(&self) {
            self.0.close().await
        }

        async fn stats(&self) -> BrokerStats {
            self.0.stats().await
        }
    }

    struct Fixture {
        store: MemoryStore,
        broker: Arc<MemoryBroker>,
        consumer: QueueConsumer,
    }

    fn fixture(max_redeliveries: u32) -> Fixture {
        let store = MemoryStore::new();
        let broker = Arc::new(MemoryBroker::new());
        let service = HierarchyService::new(
            Arc::new(store.clone()),
            Arc::new(UuidV7Generator),
            Arc::new(NoopAuditSink),
        );
        let config = ConsumerConfig {
            retry_delay: Duration::from_millis(5),
            max_redeliveries,
            ..ConsumerConfig::default()
        };
        let consumer = QueueConsumer::new(service, broker.clone(), config);

        Fixture {
            store,
            broker,
            consumer,
        }
    }

    fn creation(id: Uuid) -> QueuedMessage {
        let payload = NodePayload::new("Imported")
            .with_id(id)
            .with_tenant(Uuid::now_v7())
            .with_type(NodeType::Organization);
        QueuedMessage::from_json(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_redelivered_message_is_idempotent() {
        let fx = fixture(5);
        let message = creation(Uuid::now_v7());

        fx.broker.publish(ORGANIZE_QUEUE, message.clone()).await.unwrap();
        fx.broker.publish(ORGANIZE_QUEUE, message).await.unwrap();

        assert_eq!(
            fx.consumer.process_next().await.unwrap(),
            Some(MessageOutcome::Committed)
        );
        assert_eq!(
            fx.consumer.process_next().await.unwrap(),
            Some(MessageOutcome::Duplicate)
        );
        assert_eq!(fx.store.node_count().await, 1);
        assert_eq!(fx.broker.stats().await.unacked, 0);
    }

    #[tokio::test]
    async fn test_store_failure_requeues_then_commits() {
        let fx = fixture(5);
        fx.store.fail_next_writes(1);
        fx.broker
            .publish(ORGANIZE_QUEUE, creation(Uuid::now_v7()))
            .await
            .unwrap();

        assert_eq!(
            fx.consumer.process_next().await.unwrap(),
            Some(MessageOutcome::Requeued { attempt: 1 })
        );
        assert_eq!(fx.store.node_count().await, 0);

        let next = tokio::time::timeout(Duration::from_secs(1), fx.consumer.process_next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, Some(MessageOutcome::Committed));
        assert_eq!(fx.store.node_count().await, 1);

        let stats = fx.consumer.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.committed, 1);
    }

    #[tokio::test]
    async fn test_exhausted_message_is_dead_lettered() {
        let fx = fixture(1);
        fx.broker
            .publish(ORGANIZE_QUEUE, QueuedMessage::new("not json"))
            .await
            .unwrap();

        assert_eq!(
            fx.consumer.process_next().await.unwrap(),
            Some(MessageOutcome::Requeued { attempt: 1 })
        );
        let second = tokio::time::timeout(Duration::from_secs(1), fx.consumer.process_next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, Some(MessageOutcome::DeadLettered));

        let parked = fx.broker.receive(DEAD_LETTER_QUEUE).await.unwrap().unwrap();
        assert_eq!(parked.message.attempts, 1);
        assert!(parked
            .message
            .last_error
            .as_deref()
            .unwrap()
            .starts_with("Invalid message body"));
    }

    #[tokio::test]
    async fn test_missing_identity_goes_through_retry_path() {
        let fx = fixture(0);
        let body = serde_json::to_string(&NodePayload::new("No id")).unwrap();
        fx.broker
            .publish(ORGANIZE_QUEUE, QueuedMessage::new(body))
            .await
            .unwrap();

        assert_eq!(
            fx.consumer.process_next().await.unwrap(),
            Some(MessageOutcome::DeadLettered)
        );
        assert_eq!(fx.broker.depth(DEAD_LETTER_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_follow_up_returns_delivery_to_queue() {
        for max_redeliveries in [5, 0] {
            let broker = Arc::new(NoFollowUp(MemoryBroker::new()));
            let service = HierarchyService::new(
                Arc::new(MemoryStore::new()),
                Arc::new(UuidV7Generator),
                Arc::new(NoopAuditSink),
            );
            let consumer = QueueConsumer::new(
                service,
                broker.clone(),
                ConsumerConfig {
                    max_redeliveries,
                    ..ConsumerConfig::default()
                },
            );

            let message = QueuedMessage::new("not json");
            broker.publish(ORGANIZE_QUEUE, message.clone()).await.unwrap();

            let err = consumer.process_next().await.unwrap_err();
            assert!(matches!(err, ConsumerError::Broker(BrokerError::ConnectionError(_))));

            let stats = broker.stats().await;
            assert_eq!(stats.unacked, 0);
            assert_eq!(stats.acked, 0);
            assert_eq!(broker.depth(ORGANIZE_QUEUE).await.unwrap(), 1);

            // Handed back untouched, so the attempt is not counted
            let again = broker.receive(ORGANIZE_QUEUE).await.unwrap().unwrap();
            assert_eq!(again.message, message);
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let fx = fixture(5);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = fx.consumer.clone();
        let task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

        fx.broker
            .publish(ORGANIZE_QUEUE, creation(Uuid::now_v7()))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while fx.consumer.stats().committed == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_when_broker_closes() {
        let fx = fixture(5);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = fx.consumer.clone();
        let task = tokio::spawn(async move { consumer.run(shutdown_rx).await });
        tokio::task::yield_now().await;

        fx.broker.close().await;
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
