//! Audit records
//!
//! Every mutating hierarchy or membership operation produces exactly one
//! audit record. Records leave the engine through the [`AuditSink`] seam,
//! which must never block or fail the operation that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

/// Business tag carried by every record this engine emits.
pub const BUSINESS: &str = "Organize";

/// Kind of state change recorded by an audit record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// Something was created
    Insert,
    /// Something was changed
    Update,
    /// Something was removed
    Delete,
}

impl OperationKind {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "INSERT",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        }
    }
}

/// The authenticated caller of a mutating operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    /// Tenant the caller acts for
    pub tenant_id: Uuid,

    /// Caller user id
    pub user_id: Uuid,

    /// Caller display name
    pub user_name: String,

    /// Application the call came from
    pub app_id: Option<Uuid>,
}

impl Operator {
    /// Creates an operator for a tenant.
    pub fn new(tenant_id: Uuid, user_id: Uuid, user_name: impl Into<String>) -> Self {
        Self {
            tenant_id,
            user_id,
            user_name: user_name.into(),
            app_id: None,
        }
    }

    /// Set the calling application.
    pub fn with_app(mut self, app_id: Uuid) -> Self {
        self.app_id = Some(app_id);
        self
    }
}

/// Immutable log entry of one state-changing operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Record id
    pub id: Uuid,

    /// Tenant of the operator
    pub tenant_id: Uuid,

    /// Calling application
    pub app_id: Option<Uuid>,

    /// Kind of change
    pub operation: OperationKind,

    /// Business tag
    pub business: String,

    /// Id of the changed node
    pub business_id: Uuid,

    /// Opaque snapshot of what changed
    pub content: serde_json::Value,

    /// Operator name
    pub creator: String,

    /// Operator id
    pub creator_id: Uuid,

    /// When the change happened
    pub created_time: DateTime<Utc>,
}

impl AuditRecord {
    /// Creates a record for an operation performed by `operator`.
    pub fn new(
        id: Uuid,
        operator: &Operator,
        operation: OperationKind,
        business_id: Uuid,
        content: serde_json::Value,
    ) -> Self {
        Self {
            id,
            tenant_id: operator.tenant_id,
            app_id: operator.app_id,
            operation,
            business: BUSINESS.to_string(),
            business_id,
            content,
            creator: operator.user_name.clone(),
            creator_id: operator.user_id,
            created_time: Utc::now(),
        }
    }
}

/// Destination for audit records.
///
/// `emit` is fire-and-forget: implementations hand the record off without
/// waiting for it to be stored and must swallow their own failures.
pub trait AuditSink: Send + Sync {
    /// Hand a record off for delivery.
    fn emit(&self, record: AuditRecord);
}

/// Sink that discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, record: AuditRecord) {
        tracing::trace!(record_id = %record.id, "Audit record discarded");
    }
}

/// Sink that keeps records in memory.
///
/// Useful for tests and for embedding the engine without a message bus.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records emitted so far, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of records emitted so far.
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Check if nothing was emitted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, record: AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }
}
