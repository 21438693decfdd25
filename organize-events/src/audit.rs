//! Audit event publishing
//!
//! [`AuditEventPublisher`] is the production [`AuditSink`]. `emit` only
//! pushes the record onto a bounded queue; a background worker persists it
//! and publishes it to the topic exchange. A full or closed queue drops the
//! record with a warning, so a slow log pipeline never fails a mutation.

use organize_core::{AuditRecord, AuditSink, AuditStore, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::retry::{retry_if, RetryPolicy};
use crate::types::{AuditLogEvent, AUDIT_ROUTING_KEY, SOURCE};

/// Audit publisher configuration.
#[derive(Debug, Clone)]
pub struct AuditPublisherConfig {
    /// Records that may wait for the worker before new ones are dropped
    pub capacity: usize,

    /// Routing key of published audit events
    pub routing_key: String,

    /// Source stamped on published events
    pub source: String,

    /// Retries for persisting a record
    pub store_retry: RetryPolicy,
}

impl Default for AuditPublisherConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            routing_key: AUDIT_ROUTING_KEY.to_string(),
            source: SOURCE.to_string(),
            store_retry: RetryPolicy::default(),
        }
    }
}

/// Audit publisher statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditPublisherStats {
    /// Records accepted onto the queue
    pub emitted: u64,
    /// Records dropped because the queue was full or closed
    pub dropped: u64,
    /// Records published to the event bus
    pub delivered: u64,
    /// Records whose persistence or publication failed
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    emitted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Fire-and-forget audit sink backed by a worker task.
///
/// # Example
///
/// ```rust,no_run
/// use organize_events::{AuditEventPublisher, AuditPublisherConfig, MemoryEventBus};
/// use std::sync::Arc;
///
/// # async fn run() {
/// let bus = Arc::new(MemoryEventBus::new());
/// let (publisher, worker) = AuditEventPublisher::spawn(AuditPublisherConfig::default(), bus, None);
///
/// // hand `Arc::new(publisher.clone())` to the services as their AuditSink
///
/// publisher.close();
/// worker.await.ok();
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AuditEventPublisher {
    sender: mpsc::Sender<AuditRecord>,
    shutdown: Arc<watch::Sender<bool>>,
    counters: Arc<Counters>,
}

impl AuditEventPublisher {
    /// Start the worker and return the sink handle with the worker's task.
    pub fn spawn(
        config: AuditPublisherConfig,
        bus: Arc<dyn EventBus>,
        store: Option<Arc<dyn AuditStore>>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            config,
            bus,
            store,
            counters: counters.clone(),
        };
        let handle = tokio::spawn(worker.run(receiver, shutdown_rx));

        let publisher = Self {
            sender,
            shutdown: Arc::new(shutdown),
            counters,
        };
        (publisher, handle)
    }

    /// Stop accepting records; the worker drains what is queued and exits.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Get publisher stats.
    pub fn stats(&self) -> AuditPublisherStats {
        AuditPublisherStats {
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl AuditSink for AuditEventPublisher {
    fn emit(&self, record: AuditRecord) {
        let record_id = record.id;
        match self.sender.try_send(record) {
            Ok(()) => {
                self.counters.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%record_id, "Audit queue full, record dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%record_id, "Audit publisher closed, record dropped");
            }
        }
    }
}

struct Worker {
    config: AuditPublisherConfig,
    bus: Arc<dyn EventBus>,
    store: Option<Arc<dyn AuditStore>>,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::Receiver<AuditRecord>, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(capacity = self.config.capacity, "Audit worker started");

        loop {
            tokio::select! {
                record = receiver.recv() => match record {
                    Some(record) => self.deliver(record).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        receiver.close();
                        while let Some(record) = receiver.recv().await {
                            self.deliver(record).await;
                        }
                        break;
                    }
                }
            }
        }

        tracing::debug!("Audit worker stopped");
    }

    async fn deliver(&self, record: AuditRecord) {
        let mut failed = false;

        if let Some(store) = &self.store {
            let persisted = retry_if(
                &self.config.store_retry,
                || store.insert_record(record.clone()),
                |err| matches!(err, StoreError::Unavailable(_)),
            )
            .await;
            if let Err(e) = persisted {
                failed = true;
                tracing::warn!(record_id = %record.id, error = %e, "Audit record not persisted");
            }
        }

        let event = AuditLogEvent::from(&record).to_event(&self.config.routing_key, &self.config.source);
        match self.bus.publish(event).await {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(record_id = %record.id, "Audit event published");
            }
            Err(e) => {
                failed = true;
                tracing::warn!(record_id = %record.id, error = %e, "Audit event not published");
            }
        }

        if failed {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryEventBus;
    use organize_core::{MemoryStore, OperationKind, Operator};
    use std::time::Duration;
    use uuid::Uuid;

    fn record(operator: &Operator) -> AuditRecord {
        AuditRecord::new(
            Uuid::now_v7(),
            operator,
            OperationKind::Insert,
            Uuid::now_v7(),
            serde_json::json!({ "name": "HQ" }),
        )
    }

    fn quick_config(capacity: usize) -> AuditPublisherConfig {
        AuditPublisherConfig {
            capacity,
            store_retry: RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                multiplier: 1.0,
            },
            ..AuditPublisherConfig::default()
        }
    }

    #[tokio::test]
    async fn test_records_are_persisted_and_published() {
        let bus = Arc::new(MemoryEventBus::new());
        let store = MemoryStore::new();
        let mut sub = bus.subscribe("insight.log").await.unwrap();

        let (publisher, worker) =
            AuditEventPublisher::spawn(quick_config(8), bus.clone(), Some(Arc::new(store.clone())));
        let operator = Operator::new(Uuid::now_v7(), Uuid::now_v7(), "alice");
        let sent = record(&operator);
        publisher.emit(sent.clone());

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.topic(), "insight.log");
        assert_eq!(event.payload["businessId"], serde_json::json!(sent.business_id));

        publisher.close();
        worker.await.unwrap();

        let stored = store
            .list_records(operator.tenant_id, Some(sent.business_id))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(
            publisher.stats(),
            AuditPublisherStats {
                emitted: 1,
                dropped: 0,
                delivered: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let bus = Arc::new(MemoryEventBus::new());
        let store = MemoryStore::new();
        // Offline store keeps the worker busy retrying the first record
        store.set_available(false);
        let mut config = quick_config(1);
        config.store_retry.initial_delay = Duration::from_millis(200);
        config.store_retry.max_delay = Duration::from_millis(200);

        let (publisher, worker) =
            AuditEventPublisher::spawn(config, bus, Some(Arc::new(store.clone())));
        let operator = Operator::new(Uuid::now_v7(), Uuid::now_v7(), "bob");

        for _ in 0..10 {
            publisher.emit(record(&operator));
        }

        let stats = publisher.stats();
        assert_eq!(stats.emitted + stats.dropped, 10);
        assert!(stats.dropped >= 8);

        publisher.close();
        worker.await.unwrap();
        assert!(publisher.stats().failed >= 1);
    }

    #[tokio::test]
    async fn test_emit_after_close_is_dropped() {
        let bus = Arc::new(MemoryEventBus::new());
        let (publisher, worker) = AuditEventPublisher::spawn(quick_config(8), bus, None);

        publisher.close();
        worker.await.unwrap();

        let operator = Operator::new(Uuid::now_v7(), Uuid::now_v7(), "carol");
        publisher.emit(record(&operator));
        assert_eq!(publisher.stats().dropped, 1);
    }
}
