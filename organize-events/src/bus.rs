//! Event bus implementation
//!
//! This module provides the topic-exchange abstraction used to fan audit
//! events out to any interested listener, and its in-process backend.

use crate::types::Event;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

/// Event bus error types.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// Failed to publish event
    #[error("Failed to publish event: {0}")]
    PublishError(String),

    /// Failed to subscribe
    #[error("Failed to subscribe: {0}")]
    SubscribeError(String),

    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type for event bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Subscription handle for receiving events.
///
/// Dropping the handle ends the subscription.
pub struct Subscription {
    /// Subscription ID
    pub id: String,
    /// Topic pattern
    pub topic: String,
    /// Event receiver
    pub receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Receive the next event.
    ///
    /// A subscriber that fell behind skips the events it missed.
    pub async fn recv(&mut self) -> EventBusResult<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(subscription = %self.id, skipped, "Subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed)
                }
            }
        }
    }
}

/// Event bus trait for publish/subscribe operations.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> EventBusResult<()>;

    /// Subscribe to a topic pattern.
    ///
    /// Topic patterns support wildcards:
    /// - `*` matches any single segment
    /// - `#` matches zero or more segments
    ///
    /// Examples:
    /// - `insight.*` matches `insight.log`
    /// - `#` matches everything
    async fn subscribe(&self, topic: &str) -> EventBusResult<Subscription>;

    /// Get event bus stats.
    async fn stats(&self) -> EventBusStats;
}

/// Event bus statistics.
#[derive(Debug, Clone, Default)]
pub struct EventBusStats {
    /// Total events published
    pub events_published: u64,
    /// Total deliveries to subscriptions
    pub events_delivered: u64,
    /// Live subscription handles
    pub active_subscriptions: usize,
}

/// Check if a topic matches an AMQP-style pattern.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let topic: Vec<&str> = topic.split('.').collect();
    segments_match(&pattern, &topic)
}

fn segments_match(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((&"#", rest)) => (0..=topic.len()).any(|skip| segments_match(rest, &topic[skip..])),
        Some((&"*", rest)) => !topic.is_empty() && segments_match(rest, &topic[1..]),
        Some((segment, rest)) => {
            topic.first() == Some(segment) && segments_match(rest, &topic[1..])
        }
    }
}

/// Send an event to every pattern that matches its topic.
///
/// Returns the number of receivers reached.
pub(crate) fn fan_out(
    subscribers: &HashMap<String, broadcast::Sender<Event>>,
    event: &Event,
) -> u64 {
    let mut delivered = 0;
    for (pattern, sender) in subscribers {
        if topic_matches(pattern, event.topic()) {
            // Err only means nobody is listening right now
            if let Ok(receivers) = sender.send(event.clone()) {
                delivered += receivers as u64;
            }
        }
    }
    delivered
}

/// Add a receiver for `pattern`, dropping senders nobody listens to.
pub(crate) fn attach(
    subscribers: &mut HashMap<String, broadcast::Sender<Event>>,
    pattern: &str,
    capacity: usize,
) -> broadcast::Receiver<Event> {
    subscribers.retain(|_, sender| sender.receiver_count() > 0);
    match subscribers.get(pattern) {
        Some(sender) => sender.subscribe(),
        None => {
            let (sender, receiver) = broadcast::channel(capacity);
            subscribers.insert(pattern.to_string(), sender);
            receiver
        }
    }
}

/// Live receivers across all patterns.
pub(crate) fn receiver_total(subscribers: &HashMap<String, broadcast::Sender<Event>>) -> usize {
    subscribers.values().map(|sender| sender.receiver_count()).sum()
}

/// In-memory event bus implementation.
///
/// This is suitable for single-process deployments and testing.
/// For several service instances, use the Redis backend.
pub struct MemoryEventBus {
    /// Topic subscribers
    subscribers: Arc<RwLock<HashMap<String, broadcast::Sender<Event>>>>,
    /// Statistics
    stats: Arc<RwLock<EventBusStats>>,
    /// Default channel capacity
    channel_capacity: usize,
}

impl std::fmt::Debug for MemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEventBus")
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl MemoryEventBus {
    /// Create a new in-memory event bus.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create with custom channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EventBusStats::default())),
            channel_capacity: capacity.max(1),
        }
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: Event) -> EventBusResult<()> {
        let delivered = fan_out(&*self.subscribers.read().await, &event);

        let mut stats = self.stats.write().await;
        stats.events_published += 1;
        stats.events_delivered += delivered;

        tracing::trace!(topic = %event.topic(), event_id = %event.id, delivered, "Event published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> EventBusResult<Subscription> {
        let receiver = attach(
            &mut *self.subscribers.write().await,
            topic,
            self.channel_capacity,
        );

        Ok(Subscription {
            id: uuid::Uuid::now_v7().to_string(),
            topic: topic.to_string(),
            receiver,
        })
    }

    async fn stats(&self) -> EventBusStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_subscriptions = receiver_total(&*self.subscribers.read().await);
        stats
    }
}
