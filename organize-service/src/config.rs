//! Service configuration.
//!
//! Configuration is loaded from environment variables with defaults that
//! run the whole service in one process against in-memory backends.

use organize_events::{
    AuditPublisherConfig, ConsumerConfig, RetryPolicy, AUDIT_ROUTING_KEY, DEAD_LETTER_QUEUE,
    DELAY_QUEUE, ORGANIZE_QUEUE, SOURCE,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Messaging backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process bus and broker
    Memory,
    /// Redis bus and broker (requires the `redis` feature)
    Redis,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "redis" => Ok(Backend::Redis),
            other => Err(ConfigError::invalid(
                "ORGANIZE_BACKEND",
                format!("unknown backend '{other}', expected 'memory' or 'redis'"),
            )),
        }
    }
}

/// Organize service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizeConfig {
    /// Messaging backend.
    pub backend: Backend,

    /// Redis connection URL.
    pub redis_url: String,

    /// Prefix for Redis keys and channels.
    pub key_prefix: String,

    /// Name this instance consumes under on Redis; the hostname when unset.
    pub consumer_name: Option<String>,

    /// Ingestion queue.
    pub queue: String,

    /// Delay exchange for failed messages; names the Redis delayed set.
    pub delay_queue: String,

    /// Dead-letter queue.
    pub dead_letter_queue: String,

    /// Delay before a failed message is redelivered, in milliseconds.
    pub retry_delay_ms: u64,

    /// Redeliveries before a message is dead-lettered.
    pub max_redeliveries: u32,

    /// Number of competing consumers on the ingestion queue.
    pub consumers: usize,

    /// Capacity of the audit queue.
    pub audit_capacity: usize,

    /// Routing key of audit events.
    pub audit_routing_key: String,

    /// Maximum depth of hierarchy walks.
    pub max_depth: usize,
}

impl Default for OrganizeConfig {
    /// Returns default configuration suitable for local development.
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "organize".to_string(),
            consumer_name: None,
            queue: ORGANIZE_QUEUE.to_string(),
            delay_queue: DELAY_QUEUE.to_string(),
            dead_letter_queue: DEAD_LETTER_QUEUE.to_string(),
            retry_delay_ms: 5_000,
            max_redeliveries: 5,
            consumers: 1,
            audit_capacity: 1024,
            audit_routing_key: AUDIT_ROUTING_KEY.to_string(),
            max_depth: organize_core::DEFAULT_MAX_DEPTH,
        }
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string())),
        None => Ok(default),
    }
}

impl OrganizeConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ORGANIZE_BACKEND`: `memory` or `redis` (default: memory)
    /// - `REDIS_URL`: Redis connection URL (default: redis://127.0.0.1:6379)
    /// - `ORGANIZE_KEY_PREFIX`: Redis key prefix (default: organize)
    /// - `ORGANIZE_CONSUMER_NAME`: Redis consumer name (default: hostname)
    /// - `ORGANIZE_QUEUE`: Ingestion queue (default: insight.organize)
    /// - `ORGANIZE_DELAY_QUEUE`: Delay exchange (default: insight.organize.delay)
    /// - `ORGANIZE_DEAD_LETTER_QUEUE`: Dead-letter queue (default: insight.organize.dead)
    /// - `ORGANIZE_RETRY_DELAY_MS`: Redelivery delay (default: 5000)
    /// - `ORGANIZE_MAX_REDELIVERIES`: Redelivery budget (default: 5)
    /// - `ORGANIZE_CONSUMERS`: Competing consumers (default: 1)
    /// - `ORGANIZE_AUDIT_CAPACITY`: Audit queue capacity (default: 1024)
    /// - `ORGANIZE_AUDIT_ROUTING_KEY`: Audit routing key (default: insight.log)
    /// - `ORGANIZE_MAX_DEPTH`: Hierarchy walk bound (default: 64)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let default = Self::default();

        let config = Self {
            backend: parsed(&lookup, "ORGANIZE_BACKEND", default.backend)?,
            redis_url: lookup("REDIS_URL").unwrap_or(default.redis_url),
            key_prefix: lookup("ORGANIZE_KEY_PREFIX").unwrap_or(default.key_prefix),
            consumer_name: lookup("ORGANIZE_CONSUMER_NAME").filter(|name| !name.trim().is_empty()),
            queue: lookup("ORGANIZE_QUEUE").unwrap_or(default.queue),
            delay_queue: lookup("ORGANIZE_DELAY_QUEUE").unwrap_or(default.delay_queue),
            dead_letter_queue: lookup("ORGANIZE_DEAD_LETTER_QUEUE")
                .unwrap_or(default.dead_letter_queue),
            retry_delay_ms: parsed(&lookup, "ORGANIZE_RETRY_DELAY_MS", default.retry_delay_ms)?,
            max_redeliveries: parsed(
                &lookup,
                "ORGANIZE_MAX_REDELIVERIES",
                default.max_redeliveries,
            )?,
            consumers: parsed(&lookup, "ORGANIZE_CONSUMERS", default.consumers)?,
            audit_capacity: parsed(&lookup, "ORGANIZE_AUDIT_CAPACITY", default.audit_capacity)?,
            audit_routing_key: lookup("ORGANIZE_AUDIT_ROUTING_KEY")
                .unwrap_or(default.audit_routing_key),
            max_depth: parsed(&lookup, "ORGANIZE_MAX_DEPTH", default.max_depth)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consumers == 0 {
            return Err(ConfigError::invalid("ORGANIZE_CONSUMERS", "must be at least 1"));
        }
        if self.audit_capacity == 0 {
            return Err(ConfigError::invalid(
                "ORGANIZE_AUDIT_CAPACITY",
                "must be at least 1",
            ));
        }
        if self.max_depth == 0 {
            return Err(ConfigError::invalid("ORGANIZE_MAX_DEPTH", "must be at least 1"));
        }

        let queues = [
            ("ORGANIZE_QUEUE", &self.queue),
            ("ORGANIZE_DELAY_QUEUE", &self.delay_queue),
            ("ORGANIZE_DEAD_LETTER_QUEUE", &self.dead_letter_queue),
        ];
        for (key, name) in queues {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid(key, "queue name must not be empty"));
            }
            if name.contains('\n') {
                return Err(ConfigError::invalid(key, "queue name must be a single line"));
            }
        }
        if self.queue == self.dead_letter_queue || self.queue == self.delay_queue {
            return Err(ConfigError::invalid(
                "ORGANIZE_QUEUE",
                "must differ from the delay and dead-letter queues",
            ));
        }

        if self.backend == Backend::Redis && !cfg!(feature = "redis") {
            return Err(ConfigError::invalid(
                "ORGANIZE_BACKEND",
                "redis backend requires the `redis` feature",
            ));
        }

        Ok(())
    }

    /// Redelivery delay as a Duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Settings for each queue consumer.
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            queue: self.queue.clone(),
            retry_delay: self.retry_delay(),
            max_redeliveries: self.max_redeliveries,
            dead_letter_queue: self.dead_letter_queue.clone(),
        }
    }

    /// Settings for the audit publisher.
    pub fn audit_config(&self) -> AuditPublisherConfig {
        AuditPublisherConfig {
            capacity: self.audit_capacity,
            routing_key: self.audit_routing_key.clone(),
            source: SOURCE.to_string(),
            store_retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = OrganizeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.queue, "insight.organize");
        assert_eq!(config.delay_queue, "insight.organize.delay");
        assert_eq!(config.dead_letter_queue, "insight.organize.dead");
        assert_eq!(config.audit_routing_key, "insight.log");
        assert_eq!(config.max_redeliveries, 5);
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
        assert!(config.consumer_name.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = OrganizeConfig::from_lookup(lookup(&[
            ("ORGANIZE_CONSUMERS", "4"),
            ("ORGANIZE_RETRY_DELAY_MS", "250"),
            ("ORGANIZE_QUEUE", "tenant.organize"),
            ("ORGANIZE_DELAY_QUEUE", "tenant.organize.later"),
            ("ORGANIZE_CONSUMER_NAME", "worker-3"),
        ]))
        .unwrap();

        assert_eq!(config.consumers, 4);
        assert_eq!(config.delay_queue, "tenant.organize.later");
        assert_eq!(config.consumer_name.as_deref(), Some("worker-3"));
        let consumer = config.consumer_config();
        assert_eq!(consumer.queue, "tenant.organize");
        assert_eq!(consumer.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_unparsable_value_is_rejected() {
        let err = OrganizeConfig::from_lookup(lookup(&[("ORGANIZE_MAX_DEPTH", "deep")]))
            .unwrap_err();
        assert!(err.to_string().contains("ORGANIZE_MAX_DEPTH"));
    }

    #[test]
    fn test_validation() {
        assert!(OrganizeConfig::from_lookup(lookup(&[("ORGANIZE_CONSUMERS", "0")])).is_err());
        assert!(OrganizeConfig::from_lookup(lookup(&[("ORGANIZE_BACKEND", "kafka")])).is_err());
        assert!(OrganizeConfig::from_lookup(lookup(&[(
            "ORGANIZE_DEAD_LETTER_QUEUE",
            "insight.organize"
        )]))
        .is_err());
        assert!(OrganizeConfig::from_lookup(lookup(&[(
            "ORGANIZE_DELAY_QUEUE",
            "insight.organize"
        )]))
        .is_err());
    }
}
