//! # Organize Events
//!
//! This crate provides the messaging side of the organize service: the
//! topic exchange that carries audit events, the work queues that feed node
//! creation events into the hierarchy, and the workers on both ends.
//!
//! ## Overview
//!
//! The organize-events crate handles:
//! - **Event Bus**: Topic publish/subscribe for audit events (`insight.log`)
//! - **Broker**: Work queues with acknowledgement, a delay exchange and a dead-letter queue
//! - **Audit Publisher**: Fire-and-forget `AuditSink` backed by a worker task
//! - **Queue Consumer**: Idempotent application of creation events with bounded redelivery
//!
//! ## Features
//!
//! - `memory` (default): In-process bus and broker
//! - `redis`: Redis pub/sub bus and Redis-list broker for several instances
//!
//! ## Message Flow
//!
//! ```text
//! insight.organize ──> QueueConsumer ──> HierarchyService::insert_raw
//!        ^                  │ failure (attempts < max)
//!        └── delay queue <──┤
//!                           └ failure (budget spent) ──> insight.organize.dead
//!
//! HierarchyService / MembershipManager ──> AuditEventPublisher ──> AuditStore
//!                                                             └──> EventBus "insight.log"
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use organize_events::{EventBus, MemoryEventBus};
//!
//! async fn subscribe_example() {
//!     let bus = MemoryEventBus::new();
//!
//!     // Subscribe to audit events
//!     let mut sub = bus.subscribe("insight.log").await.unwrap();
//!
//!     while let Ok(event) = sub.recv().await {
//!         println!("Audit: {}", event.payload);
//!     }
//! }
//! ```
//!
//! ## Topic Patterns
//!
//! Wildcards:
//! - `*` matches exactly one segment
//! - `#` matches zero or more segments

pub mod audit;
pub mod broker;
pub mod bus;
pub mod consumer;
pub mod retry;
pub mod types;

#[cfg(feature = "redis")]
pub mod redis;

// Re-export main types
pub use audit::{AuditEventPublisher, AuditPublisherConfig, AuditPublisherStats};
pub use broker::{BrokerError, BrokerResult, BrokerStats, MemoryBroker, MessageBroker};
pub use bus::{
    topic_matches, EventBus, EventBusError, EventBusResult, EventBusStats, MemoryEventBus,
    Subscription,
};
pub use consumer::{
    ConsumerConfig, ConsumerError, ConsumerStats, MessageOutcome, QueueConsumer,
    DEAD_LETTER_QUEUE, DELAY_QUEUE, ORGANIZE_QUEUE,
};
pub use retry::RetryPolicy;
pub use types::{AuditLogEvent, Delivery, Event, QueuedMessage, AUDIT_ROUTING_KEY, SOURCE};

#[cfg(feature = "redis")]
pub use redis::{RedisBroker, RedisBrokerConfig, RedisEventBus};
