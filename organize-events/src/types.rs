//! Message types
//!
//! This module defines the event envelope carried by the topic exchange,
//! the audit log payload published for every hierarchy mutation, and the
//! work-queue message shape used by the ingestion pipeline.

use chrono::{DateTime, Utc};
use organize_core::{AuditRecord, OperationKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Routing key of audit log events.
pub const AUDIT_ROUTING_KEY: &str = "insight.log";

/// Source name stamped on events produced by this service.
pub const SOURCE: &str = "organize";

/// Topic exchange event envelope.
///
/// All events are wrapped in this envelope which provides metadata
/// for routing, tracing, and processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID
    pub id: Uuid,

    /// Routing key (e.g., "insight.log")
    pub event_type: String,

    /// Producing service
    pub source: String,

    /// Timestamp when event was created
    pub timestamp: DateTime<Utc>,

    /// Tenant context
    pub tenant_id: Option<Uuid>,

    /// User who triggered the event
    pub user_id: Option<Uuid>,

    /// Correlation ID for tracing
    pub correlation_id: Option<String>,

    /// Event version for schema evolution
    pub version: u32,

    /// Event payload
    pub payload: serde_json::Value,

    /// Additional metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Event {
    /// Create a new event.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The routing key
    /// * `source` - The producing service
    /// * `payload` - The event payload
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            tenant_id: None,
            user_id: None,
            correlation_id: None,
            version: 1,
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Set tenant context.
    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Set user context.
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Set correlation ID.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Topic used for exchange routing.
    pub fn topic(&self) -> &str {
        &self.event_type
    }
}

/// Audit log payload consumed by the log service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEvent {
    /// Calling application
    pub app_id: Option<Uuid>,

    /// Tenant
    pub tenant_id: Uuid,

    /// Kind of change
    pub operation_kind: OperationKind,

    /// Business tag
    pub business: String,

    /// Changed node
    pub business_id: Uuid,

    /// Snapshot
    pub content: serde_json::Value,

    /// Operator name
    pub creator: String,

    /// Operator id
    pub creator_id: Uuid,
}

impl From<&AuditRecord> for AuditLogEvent {
    fn from(record: &AuditRecord) -> Self {
        Self {
            app_id: record.app_id,
            tenant_id: record.tenant_id,
            operation_kind: record.operation,
            business: record.business.clone(),
            business_id: record.business_id,
            content: record.content.clone(),
            creator: record.creator.clone(),
            creator_id: record.creator_id,
        }
    }
}

impl AuditLogEvent {
    /// Wrap the payload in an event envelope.
    pub fn to_event(&self, routing_key: &str, source: &str) -> Event {
        let payload = serde_json::to_value(self).unwrap_or_default();
        Event::new(routing_key, source, payload)
            .with_tenant(self.tenant_id)
            .with_user(self.creator_id)
            .with_correlation_id(self.business_id.to_string())
    }
}

/// Message on a work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    /// Message id, stable across redeliveries
    pub id: Uuid,

    /// JSON body
    pub body: String,

    /// Number of failed deliveries so far
    #[serde(default)]
    pub attempts: u32,

    /// When the message was first enqueued
    pub enqueued_at: DateTime<Utc>,

    /// Error from the most recent failed delivery
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedMessage {
    /// Creates a fresh message.
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            body: body.into(),
            attempts: 0,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    /// Creates a message with a JSON-encoded body.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_string(value)?))
    }

    /// Copy of this message for another delivery attempt.
    pub fn redelivery(&self, error: impl Into<String>) -> Self {
        Self {
            attempts: self.attempts + 1,
            last_error: Some(error.into()),
            ..self.clone()
        }
    }

    /// Copy of this message for the dead-letter queue.
    pub fn failed(&self, error: impl Into<String>) -> Self {
        Self {
            last_error: Some(error.into()),
            ..self.clone()
        }
    }
}

/// A message handed to one consumer, awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned delivery tag
    pub tag: u64,

    /// Queue the message came from
    pub queue: String,

    /// The message
    pub message: QueuedMessage,
}
