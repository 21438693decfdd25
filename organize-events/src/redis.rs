//! Redis backends for several service instances.
//!
//! [`RedisEventBus`] carries audit events over Redis pub/sub and fans them
//! out to local subscriptions. [`RedisBroker`] implements the work queues on
//! Redis lists:
//!
//! ```text
//! LPUSH {prefix}:queue:{name}                             publish
//! BLMOVE queue -> {prefix}:processing:{consumer}:{name}   receive
//! LREM processing                                         ack
//! LREM processing + RPUSH queue                           nack
//! ZADD {prefix}:{delay_queue} (score = due time)          delay exchange
//! SET {prefix}:consumer:{consumer} PX ttl                 heartbeat
//! ```
//!
//! A background task keeps the heartbeat alive and promotes due entries of
//! the delayed set back onto their queues in one script call, so an entry
//! is never removed without being pushed.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::broker::{BrokerError, BrokerResult, BrokerStats, MessageBroker};
use crate::bus::{
    attach, fan_out, receiver_total, EventBus, EventBusError, EventBusResult, EventBusStats,
    Subscription,
};
use crate::consumer::DELAY_QUEUE;
use crate::types::{Delivery, Event, QueuedMessage};

fn default_consumer_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string())
}

// ============================================================================
// Event bus
// ============================================================================

/// Redis-backed event bus.
///
/// Events are published to `{prefix}:events:{topic}`. One listener task per
/// bus pattern-subscribes to every event channel and routes messages to
/// local subscriptions using the usual topic wildcards.
///
/// # Example
///
/// ```rust,no_run
/// use organize_events::{EventBus, RedisEventBus};
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let bus = RedisEventBus::new("redis://localhost:6379", "organize").await?;
///     let mut sub = bus.subscribe("insight.*").await?;
///     let event = sub.recv().await?;
///     Ok(())
/// }
/// ```
pub struct RedisEventBus {
    /// Redis client
    client: Client,
    /// Shared command connection
    conn: ConnectionManager,
    /// Key prefix for all Redis operations
    prefix: String,
    /// Local subscriptions by pattern
    subscribers: Arc<RwLock<HashMap<String, broadcast::Sender<Event>>>>,
    /// Background listener task
    listener: RwLock<Option<JoinHandle<()>>>,
    /// Statistics
    events_published: AtomicU64,
    events_delivered: Arc<AtomicU64>,
}

impl std::fmt::Debug for RedisEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEventBus")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisEventBus {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., `redis://localhost:6379`)
    /// * `prefix` - Key prefix for Redis operations (e.g., `organize`)
    pub async fn new(redis_url: &str, prefix: &str) -> EventBusResult<Self> {
        let client =
            Client::open(redis_url).map_err(|e| EventBusError::ConnectionError(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            conn,
            prefix: prefix.to_string(),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            listener: RwLock::new(None),
            events_published: AtomicU64::new(0),
            events_delivered: Arc::new(AtomicU64::new(0)),
        })
    }

    fn channel(&self, topic: &str) -> String {
        format!("{}:events:{}", self.prefix, topic)
    }

    /// Start the pub/sub listener unless it is already running.
    async fn ensure_listener(&self) -> EventBusResult<()> {
        let mut listener = self.listener.write().await;
        if listener.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return Ok(());
        }

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))?;
        let pattern = self.channel("*");
        pubsub
            .psubscribe(&pattern)
            .await
            .map_err(|e| EventBusError::SubscribeError(e.to_string()))?;
        tracing::info!(%pattern, "Redis event listener started");

        let subscribers = self.subscribers.clone();
        let delivered = self.events_delivered.clone();

        *listener = Some(tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let event = match msg
                    .get_payload::<String>()
                    .map_err(|e| e.to_string())
                    .and_then(|raw| serde_json::from_str::<Event>(&raw).map_err(|e| e.to_string()))
                {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping undecodable event");
                        continue;
                    }
                };

                let count = fan_out(&*subscribers.read().await, &event);
                delivered.fetch_add(count, Ordering::Relaxed);
            }
            tracing::warn!("Redis pub/sub stream ended");
        }));

        Ok(())
    }

    /// Stop the listener task.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.listener.write().await.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event: Event) -> EventBusResult<()> {
        let payload = serde_json::to_string(&event)
            .map_err(|e| EventBusError::SerializationError(e.to_string()))?;

        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(self.channel(event.topic()), payload)
            .await
            .map_err(|e| EventBusError::PublishError(e.to_string()))?;

        self.events_published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(topic = %event.topic(), event_id = %event.id, "Event published to Redis");

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> EventBusResult<Subscription> {
        let receiver = attach(&mut *self.subscribers.write().await, topic, 1024);
        self.ensure_listener().await?;

        Ok(Subscription {
            id: uuid::Uuid::now_v7().to_string(),
            topic: topic.to_string(),
            receiver,
        })
    }

    async fn stats(&self) -> EventBusStats {
        EventBusStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            active_subscriptions: receiver_total(&*self.subscribers.read().await),
        }
    }
}

// ============================================================================
// Work-queue broker
// ============================================================================

/// Redis broker configuration.
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Redis connection URL
    pub url: String,

    /// Prefix for all Redis keys
    pub key_prefix: String,

    /// Name of this consumer; keys its processing lists and heartbeat
    pub consumer_name: String,

    /// Name of the delayed set, under the key prefix
    pub delay_queue: String,

    /// Lifetime of the heartbeat; a consumer silent this long is gone
    pub heartbeat_ttl: Duration,

    /// How long one blocking receive waits before re-checking for close
    pub poll_timeout: Duration,

    /// How often due delayed messages are promoted
    pub promote_interval: Duration,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "organize".to_string(),
            consumer_name: default_consumer_name(),
            delay_queue: DELAY_QUEUE.to_string(),
            heartbeat_ttl: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(1),
            promote_interval: Duration::from_millis(250),
        }
    }
}

/// Moves due members of the delayed set onto their queues.
///
/// KEYS[1] delayed set, ARGV[1] now in ms, ARGV[2] batch size,
/// ARGV[3] queue key prefix. Members are `{queue}\n{message json}`.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
    local split = string.find(member, '\n', 1, true)
    if split then
        redis.call('LPUSH', ARGV[3] .. string.sub(member, 1, split - 1), string.sub(member, split + 1))
    end
    redis.call('ZREM', KEYS[1], member)
end
return #due
"#;

/// Member of the delayed set for `message` bound for `queue`.
fn delayed_member(queue: &str, message: &QueuedMessage) -> BrokerResult<String> {
    Ok(format!("{}\n{}", queue, encode(message)?))
}

/// Decode a queue entry.
///
/// Entries that are not message envelopes, such as a bare payload pushed by
/// another producer, become the body of a fresh message so they take the
/// normal retry and dead-letter path instead of vanishing.
fn decode_entry(raw: &str) -> QueuedMessage {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "Queue entry is not an envelope, wrapping it");
        QueuedMessage::new(raw)
    })
}

/// Owner of a processing list key for `queue`, if the key is one.
fn processing_owner<'a>(prefix: &str, queue: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)?
        .strip_prefix(":processing:")?
        .strip_suffix(queue)?
        .strip_suffix(':')
        .filter(|owner| !owner.is_empty())
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    delayed: AtomicU64,
    dead_lettered: AtomicU64,
}

fn redis_error(e: redis::RedisError) -> BrokerError {
    BrokerError::ConnectionError(e.to_string())
}

fn encode(message: &QueuedMessage) -> BrokerResult<String> {
    serde_json::to_string(message).map_err(|e| BrokerError::SerializationError(e.to_string()))
}

/// Redis-list work-queue broker.
///
/// Received messages sit in this consumer's processing list until acked. A
/// consumer that starts calls [`RedisBroker::recover`] to push back anything
/// it left unacknowledged, along with the lists of consumers whose heartbeat
/// has expired.
pub struct RedisBroker {
    /// Shared command connection
    conn: ConnectionManager,
    /// Connection reserved for blocking receives
    blocking: ConnectionManager,
    /// Configuration
    config: RedisBrokerConfig,
    /// Raw payloads of outstanding deliveries by tag
    in_flight: StdMutex<HashMap<u64, String>>,
    /// Next delivery tag
    next_tag: AtomicU64,
    /// Cleared on close
    running: Arc<AtomicBool>,
    /// Delayed-set promoter
    promoter: StdMutex<Option<JoinHandle<()>>>,
    /// Statistics
    counters: Arc<Counters>,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisBroker {
    /// Connect and start the delayed-set promoter.
    pub async fn new(config: RedisBrokerConfig) -> BrokerResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(redis_error)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(redis_error)?;
        let blocking = ConnectionManager::new(client).await.map_err(redis_error)?;

        let broker = Self {
            conn,
            blocking,
            config,
            in_flight: StdMutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(true)),
            promoter: StdMutex::new(None),
            counters: Arc::new(Counters::default()),
        };
        broker.start_promoter();

        Ok(broker)
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.config.key_prefix, queue)
    }

    fn processing_key(&self, queue: &str) -> String {
        format!(
            "{}:processing:{}:{}",
            self.config.key_prefix, self.config.consumer_name, queue
        )
    }

    fn delayed_key(&self) -> String {
        format!("{}:{}", self.config.key_prefix, self.config.delay_queue)
    }

    fn heartbeat_key(&self, consumer: &str) -> String {
        format!("{}:consumer:{}", self.config.key_prefix, consumer)
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<u64, String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refresh this consumer's heartbeat.
    async fn beat(&self, conn: &mut ConnectionManager) -> BrokerResult<()> {
        redis::cmd("SET")
            .arg(self.heartbeat_key(&self.config.consumer_name))
            .arg(1)
            .arg("PX")
            .arg(self.config.heartbeat_ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(redis_error)
    }

    fn start_promoter(&self) {
        let mut conn = self.conn.clone();
        let running = self.running.clone();
        let counters = self.counters.clone();
        let script = Script::new(PROMOTE_SCRIPT);
        let delayed_key = self.delayed_key();
        let queue_prefix = format!("{}:queue:", self.config.key_prefix);
        let heartbeat_key = self.heartbeat_key(&self.config.consumer_name);
        let heartbeat_ms = self.config.heartbeat_ttl.as_millis() as u64;
        let interval = self.config.promote_interval;

        let handle = tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                let beat: Result<(), _> = redis::cmd("SET")
                    .arg(&heartbeat_key)
                    .arg(1)
                    .arg("PX")
                    .arg(heartbeat_ms)
                    .query_async(&mut conn)
                    .await;
                if let Err(e) = beat {
                    tracing::warn!(error = %e, "Heartbeat refresh failed");
                }

                let promoted: Result<i64, _> = script
                    .key(&delayed_key)
                    .arg(Utc::now().timestamp_millis())
                    .arg(100)
                    .arg(&queue_prefix)
                    .invoke_async(&mut conn)
                    .await;
                match promoted {
                    Ok(0) => {}
                    Ok(count) => {
                        counters.published.fetch_add(count as u64, Ordering::Relaxed);
                        tracing::debug!(count, "Promoted delayed messages");
                    }
                    Err(e) => tracing::warn!(error = %e, "Delayed set promotion failed"),
                }

                tokio::time::sleep(interval).await;
            }
        });

        *self
            .promoter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    /// Move every entry of a processing list back onto `queue`.
    async fn drain(
        &self,
        conn: &mut ConnectionManager,
        processing: &str,
        queue: &str,
    ) -> BrokerResult<usize> {
        let target = self.queue_key(queue);
        let mut moved = 0;

        loop {
            let item: Option<String> = redis::cmd("LMOVE")
                .arg(processing)
                .arg(&target)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut *conn)
                .await
                .map_err(redis_error)?;
            if item.is_none() {
                return Ok(moved);
            }
            moved += 1;
        }
    }

    /// Move unacknowledged messages of `queue` back onto it.
    ///
    /// Takes this consumer's own processing list, then the list of every
    /// other consumer whose heartbeat has expired, so a renamed or retired
    /// host does not strand its messages. Returns the number moved.
    pub async fn recover(&self, queue: &str) -> BrokerResult<usize> {
        let mut conn = self.conn.clone();
        self.beat(&mut conn).await?;

        let mut moved = self
            .drain(&mut conn, &self.processing_key(queue), queue)
            .await?;

        let pattern = format!("{}:processing:*:{}", self.config.key_prefix, queue);
        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(&pattern)
                .await
                .map_err(redis_error)?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        for key in keys {
            let Some(owner) = processing_owner(&self.config.key_prefix, queue, &key) else {
                continue;
            };
            if owner == self.config.consumer_name {
                continue;
            }
            let alive: bool = conn
                .exists(self.heartbeat_key(owner))
                .await
                .map_err(redis_error)?;
            if alive {
                continue;
            }

            let taken = self.drain(&mut conn, &key, queue).await?;
            if taken > 0 {
                tracing::warn!(%queue, consumer = %owner, taken, "Requeued messages of a departed consumer");
            }
            moved += taken;
        }

        if moved > 0 {
            tracing::info!(%queue, moved, "Recovered unacknowledged messages");
        }
        Ok(moved)
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn publish(&self, queue: &str, message: QueuedMessage) -> BrokerResult<()> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(BrokerError::Closed);
        }
        let body = encode(&message)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, i64>(self.queue_key(queue), body)
            .await
            .map_err(redis_error)?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        message: QueuedMessage,
        delay: Duration,
    ) -> BrokerResult<()> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(BrokerError::Closed);
        }
        let member = delayed_member(queue, &message)?;
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, i64>(self.delayed_key(), member, due)
            .await
            .map_err(redis_error)?;
        self.counters.delayed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn receive(&self, queue: &str) -> BrokerResult<Option<Delivery>> {
        let source = self.queue_key(queue);
        let processing = self.processing_key(queue);
        let timeout = self.config.poll_timeout.as_secs_f64().max(0.01);
        let mut conn = self.blocking.clone();

        while self.running.load(Ordering::Relaxed) {
            let raw: Option<String> = redis::cmd("BLMOVE")
                .arg(&source)
                .arg(&processing)
                .arg("RIGHT")
                .arg("LEFT")
                .arg(timeout)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            let Some(raw) = raw else {
                continue;
            };

            let message = decode_entry(&raw);
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            self.in_flight().insert(tag, raw);
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);

            return Ok(Some(Delivery {
                tag,
                queue: queue.to_string(),
                message,
            }));
        }

        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        let raw = self
            .in_flight()
            .remove(&delivery.tag)
            .ok_or(BrokerError::UnknownDelivery(delivery.tag))?;

        let mut conn = self.conn.clone();
        conn.lrem::<_, _, i64>(self.processing_key(&delivery.queue), 1, raw)
            .await
            .map_err(redis_error)?;
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> BrokerResult<()> {
        let raw = self
            .in_flight()
            .remove(&delivery.tag)
            .ok_or(BrokerError::UnknownDelivery(delivery.tag))?;

        // Right end is where receive takes from, so it comes back first
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(self.processing_key(&delivery.queue), 1, &raw)
            .ignore()
            .rpush(self.queue_key(&delivery.queue), &raw)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_error)?;
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
        let mut conn = self.conn.clone();
        conn.llen(self.queue_key(queue)).await.map_err(redis_error)
    }

    async fn close(&self) {
        self.running.store(false, Ordering::Relaxed);
        let promoter = self
            .promoter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = promoter {
            handle.abort();
        }
        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .del::<_, ()>(self.heartbeat_key(&self.config.consumer_name))
            .await
        {
            tracing::debug!(error = %e, "Heartbeat removal failed");
        }
        tracing::debug!("Redis broker closed");
    }

    async fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
            delayed: self.counters.delayed.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            unacked: self.in_flight().len(),
        }
    }
}
