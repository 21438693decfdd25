//! Storage collaborator traits
//!
//! The hierarchy engine does not own persistence. It talks to three tables
//! through these traits: the node table (self-referencing parent foreign
//! key), the membership join table, and the audit table.
//!
//! Implementations must be transactional per call. In particular
//! [`NodeStore::insert_node`] checks the parent foreign key and
//! [`NodeStore::delete_node`] checks for children inside the same critical
//! section as the write, so concurrent requests cannot race past the
//! service-level checks.

use async_trait::async_trait;
use uuid::Uuid;

use crate::audit::AuditRecord;
use crate::error::StoreResult;
use crate::node::{Node, NodeSummary};
use crate::page::{Page, PageRequest};

/// Result of an insert-or-ignore write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written
    Inserted,
    /// A row with the same primary key already existed; nothing changed
    AlreadyExists,
}

/// Access to the node table.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Fetch one node.
    async fn get_node(&self, id: Uuid) -> StoreResult<Option<Node>>;

    /// List a tenant's nodes ordered by `(type, index)`.
    ///
    /// A keyword matches `code` exactly or `name` by substring.
    async fn list_nodes(
        &self,
        tenant_id: Uuid,
        keyword: Option<&str>,
        page: PageRequest,
    ) -> StoreResult<Page<NodeSummary>>;

    /// Direct children of a node ordered by `(type, index)`.
    async fn children(&self, id: Uuid) -> StoreResult<Vec<Node>>;

    /// Number of direct children of a node.
    async fn count_children(&self, id: Uuid) -> StoreResult<u64>;

    /// Insert a node unless its id already exists.
    ///
    /// Fails with `ForeignKey` when `parent_id` does not exist.
    async fn insert_node(&self, node: Node) -> StoreResult<InsertOutcome>;

    /// Overwrite an existing node.
    ///
    /// Fails with `Missing` for an unknown id and `ForeignKey` when
    /// `parent_id` does not exist.
    async fn update_node(&self, node: Node) -> StoreResult<()>;

    /// Remove a childless node together with its membership edges.
    ///
    /// Returns the removed row, or `None` if it did not exist. Fails with
    /// `HasDependents` when children still reference it.
    async fn delete_node(&self, id: Uuid) -> StoreResult<Option<Node>>;
}

/// Access to the position/user join table.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Insert-or-ignore one edge per user; returns the number of new edges.
    async fn add_edges(&self, position_id: Uuid, user_ids: &[Uuid]) -> StoreResult<usize>;

    /// Delete matching edges; returns the number removed.
    async fn remove_edges(&self, position_id: Uuid, user_ids: &[Uuid]) -> StoreResult<usize>;

    /// User ids attached to a position.
    async fn member_ids(&self, position_id: Uuid) -> StoreResult<Vec<Uuid>>;
}

/// Access to the audit table.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist a record.
    async fn insert_record(&self, record: AuditRecord) -> StoreResult<()>;

    /// Fetch one record.
    async fn get_record(&self, id: Uuid) -> StoreResult<Option<AuditRecord>>;

    /// A tenant's records, optionally for one business id, oldest first.
    async fn list_records(
        &self,
        tenant_id: Uuid,
        business_id: Option<Uuid>,
    ) -> StoreResult<Vec<AuditRecord>>;
}
