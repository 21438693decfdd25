//! Composition root.
//!
//! [`Organize::build`] wires stores, the id generator, the audit publisher,
//! the services and the queue consumers from explicit [`Dependencies`].
//! Nothing is global; tests build as many independent instances as they
//! like.

use organize_core::{
    AuditStore, HierarchyService, IdGenerator, MembershipManager, MembershipStore, MemoryStore,
    MemoryUserDirectory, NodeStore, UserDirectory, UuidV7Generator,
};
use organize_events::{
    AuditEventPublisher, BrokerError, EventBus, EventBusError, MemoryBroker, MemoryEventBus,
    MessageBroker, QueueConsumer,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{Backend, ConfigError, OrganizeConfig};

/// Errors raised while assembling or stopping the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Event bus could not be set up
    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    /// Broker could not be set up
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Collaborators the service is assembled from.
#[derive(Clone)]
pub struct Dependencies {
    /// Node table
    pub store: Arc<dyn NodeStore>,
    /// Membership table
    pub edges: Arc<dyn MembershipStore>,
    /// Audit table; without one, audit records are published but not kept
    pub audit_store: Option<Arc<dyn AuditStore>>,
    /// Read-only user lookup
    pub directory: Arc<dyn UserDirectory>,
    /// Node id source
    pub ids: Arc<dyn IdGenerator>,
    /// Audit topic exchange
    pub bus: Arc<dyn EventBus>,
    /// Ingestion work queues
    pub broker: Arc<dyn MessageBroker>,
}

impl Dependencies {
    /// Everything in process, over one shared [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::with_store(MemoryStore::new(), MemoryUserDirectory::new())
    }

    /// In-process messaging over the given store and directory.
    pub fn with_store(store: MemoryStore, directory: MemoryUserDirectory) -> Self {
        let store = Arc::new(store);
        Self {
            store: store.clone(),
            edges: store.clone(),
            audit_store: Some(store as Arc<dyn AuditStore>),
            directory: Arc::new(directory),
            ids: Arc::new(UuidV7Generator),
            bus: Arc::new(MemoryEventBus::new()),
            broker: Arc::new(MemoryBroker::new()),
        }
    }

    /// Dependencies for the configured backend.
    pub async fn from_config(config: &OrganizeConfig) -> Result<Self, ServiceError> {
        match config.backend {
            Backend::Memory => Ok(Self::in_memory()),
            #[cfg(feature = "redis")]
            Backend::Redis => Self::redis(config).await,
            #[cfg(not(feature = "redis"))]
            Backend::Redis => Err(ConfigError::InvalidValue {
                key: "ORGANIZE_BACKEND".to_string(),
                message: "redis backend requires the `redis` feature".to_string(),
            }
            .into()),
        }
    }

    /// Redis messaging; tables stay in process.
    #[cfg(feature = "redis")]
    pub async fn redis(config: &OrganizeConfig) -> Result<Self, ServiceError> {
        use organize_events::{RedisBroker, RedisBrokerConfig, RedisEventBus};

        let bus = RedisEventBus::new(&config.redis_url, &config.key_prefix).await?;
        let defaults = RedisBrokerConfig::default();
        let broker = RedisBroker::new(RedisBrokerConfig {
            url: config.redis_url.clone(),
            key_prefix: config.key_prefix.clone(),
            consumer_name: config
                .consumer_name
                .clone()
                .unwrap_or_else(|| defaults.consumer_name.clone()),
            delay_queue: config.delay_queue.clone(),
            ..defaults
        })
        .await?;

        let recovered = broker.recover(&config.queue).await?;
        if recovered > 0 {
            tracing::info!(recovered, queue = %config.queue, "Requeued unacknowledged messages");
        }

        Ok(Self {
            bus: Arc::new(bus),
            broker: Arc::new(broker),
            ..Self::in_memory()
        })
    }
}

/// A fully wired organize service.
pub struct Organize {
    hierarchy: HierarchyService,
    members: MembershipManager,
    audit: AuditEventPublisher,
    audit_worker: JoinHandle<()>,
    bus: Arc<dyn EventBus>,
    broker: Arc<dyn MessageBroker>,
    consumers: Vec<QueueConsumer>,
    consumer_tasks: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Organize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Organize")
            .field("consumers", &self.consumers.len())
            .field("running", &self.consumer_tasks.len())
            .finish()
    }
}

impl Organize {
    /// Wire the service. Must be called inside a tokio runtime, since the
    /// audit worker starts immediately.
    pub fn build(config: &OrganizeConfig, deps: Dependencies) -> Result<Self, ServiceError> {
        config.validate()?;

        let (audit, audit_worker) = AuditEventPublisher::spawn(
            config.audit_config(),
            deps.bus.clone(),
            deps.audit_store.clone(),
        );
        let sink = Arc::new(audit.clone());

        let hierarchy = HierarchyService::new(deps.store.clone(), deps.ids.clone(), sink.clone())
            .with_max_depth(config.max_depth);
        let members = MembershipManager::new(
            deps.store.clone(),
            deps.edges.clone(),
            deps.directory.clone(),
            deps.ids.clone(),
            sink,
        );

        let consumers = (0..config.consumers)
            .map(|_| {
                QueueConsumer::new(
                    hierarchy.clone(),
                    deps.broker.clone(),
                    config.consumer_config(),
                )
            })
            .collect();

        let (shutdown, _) = watch::channel(false);

        tracing::info!(
            backend = ?config.backend,
            consumers = config.consumers,
            queue = %config.queue,
            "Organize service assembled"
        );

        Ok(Self {
            hierarchy,
            members,
            audit,
            audit_worker,
            bus: deps.bus,
            broker: deps.broker,
            consumers,
            consumer_tasks: Vec::new(),
            shutdown,
        })
    }

    /// Hierarchy operations.
    pub fn hierarchy(&self) -> &HierarchyService {
        &self.hierarchy
    }

    /// Position membership operations.
    pub fn members(&self) -> &MembershipManager {
        &self.members
    }

    /// The audit publisher.
    pub fn audit(&self) -> &AuditEventPublisher {
        &self.audit
    }

    /// The audit topic exchange.
    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// The ingestion broker.
    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    /// The queue consumers.
    pub fn consumers(&self) -> &[QueueConsumer] {
        &self.consumers
    }

    /// Start every consumer on its own task. Calling twice is a no-op.
    pub fn spawn_consumers(&mut self) {
        if !self.consumer_tasks.is_empty() {
            return;
        }
        for consumer in &self.consumers {
            let consumer = consumer.clone();
            let shutdown = self.shutdown.subscribe();
            self.consumer_tasks
                .push(tokio::spawn(async move { consumer.run(shutdown).await }));
        }
    }

    /// Stop consumers, close the broker and drain the audit queue.
    pub async fn shutdown(self) {
        tracing::info!("Organize service shutting down");

        self.shutdown.send_replace(true);
        self.broker.close().await;
        for task in self.consumer_tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Queue consumer task failed");
            }
        }

        self.audit.close();
        if let Err(e) = self.audit_worker.await {
            tracing::warn!(error = %e, "Audit worker task failed");
        }

        tracing::info!(audit = ?self.audit.stats(), "Organize service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use organize_core::{NodePayload, Operator, PageRequest};
    use organize_events::QueuedMessage;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_build_wires_services() {
        let config = OrganizeConfig::default();
        let app = Organize::build(&config, Dependencies::in_memory()).unwrap();
        let operator = Operator::new(Uuid::now_v7(), Uuid::now_v7(), "alice");

        let id = app
            .hierarchy()
            .create_node(&operator, NodePayload::new("HQ"))
            .await
            .unwrap();
        let page = app
            .hierarchy()
            .list_nodes(operator.tenant_id, None, PageRequest::default())
            .await
            .unwrap();

        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, id);
        assert_eq!(app.consumers().len(), 1);

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let config = OrganizeConfig {
            consumers: 0,
            ..OrganizeConfig::default()
        };
        let err = Organize::build(&config, Dependencies::in_memory()).unwrap_err();
        assert!(matches!(err, ServiceError::Config(_)));
    }

    #[tokio::test]
    async fn test_consumers_apply_queued_nodes() {
        let store = MemoryStore::new();
        let deps = Dependencies::with_store(store.clone(), MemoryUserDirectory::new());
        let config = OrganizeConfig {
            consumers: 2,
            ..OrganizeConfig::default()
        };
        let mut app = Organize::build(&config, deps).unwrap();
        app.spawn_consumers();

        let payload = NodePayload::new("Imported")
            .with_id(Uuid::now_v7())
            .with_tenant(Uuid::now_v7());
        app.broker()
            .publish(&config.queue, QueuedMessage::from_json(&payload).unwrap())
            .await
            .unwrap();

        for _ in 0..100 {
            if store.node_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.node_count().await, 1);

        app.shutdown().await;
    }
}
