//! Hierarchy service
//!
//! Synchronous entry point for creating, editing, deleting and reading
//! nodes. Validation happens here; the store closes the remaining races
//! (parent removed after validation, child added before delete).

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditSink, OperationKind, Operator};
use crate::error::{HierarchyError, HierarchyResult, StoreError};
use crate::node::{ChainEntry, IdGenerator, Node, NodePatch, NodePayload, NodeSummary, NodeType};
use crate::page::{Page, PageRequest};
use crate::store::{InsertOutcome, NodeStore};
use crate::tree::TreeResolver;
use crate::validator::NodeValidator;

/// Node management with nesting validation and auditing.
///
/// # Example
///
/// ```rust,ignore
/// let service = HierarchyService::new(store, Arc::new(UuidV7Generator), audit);
///
/// let hq = service.create_node(&operator, NodePayload::new("HQ")).await?;
/// let eng = service
///     .create_node(
///         &operator,
///         NodePayload::new("Engineering")
///             .with_parent(hq)
///             .with_type(NodeType::Department),
///     )
///     .await?;
///
/// let chain = service.ancestor_chain(eng).await?;
/// assert_eq!(chain.len(), 2);
/// ```
#[derive(Clone)]
pub struct HierarchyService {
    store: Arc<dyn NodeStore>,
    ids: Arc<dyn IdGenerator>,
    audit: Arc<dyn AuditSink>,
    tree: TreeResolver,
}

impl HierarchyService {
    /// Creates a service over the given collaborators.
    pub fn new(
        store: Arc<dyn NodeStore>,
        ids: Arc<dyn IdGenerator>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let tree = TreeResolver::new(store.clone());
        Self {
            store,
            ids,
            audit,
            tree,
        }
    }

    /// Override the depth bound of tree walks.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.tree = self.tree.with_max_depth(max_depth);
        self
    }

    /// The tree resolver used for reads.
    pub fn tree(&self) -> &TreeResolver {
        &self.tree
    }

    /// Fetch one node.
    pub async fn get_node(&self, id: Uuid) -> HierarchyResult<Node> {
        self.store
            .get_node(id)
            .await?
            .ok_or(HierarchyError::NotFound(id))
    }

    /// Flat listing of a tenant's nodes.
    pub async fn list_nodes(
        &self,
        tenant_id: Uuid,
        keyword: Option<&str>,
        page: PageRequest,
    ) -> HierarchyResult<Page<NodeSummary>> {
        self.tree.list_nodes(tenant_id, keyword, page).await
    }

    /// Path from a node up to its root.
    pub async fn ancestor_chain(&self, id: Uuid) -> HierarchyResult<Vec<ChainEntry>> {
        self.tree.ancestor_chain(id).await
    }

    /// A node and everything under it.
    pub async fn descendants(&self, id: Uuid) -> HierarchyResult<Vec<ChainEntry>> {
        self.tree.descendants(id).await
    }

    /// Create a node for the operator's tenant.
    ///
    /// The payload's id, tenant and creator fields are ignored; they come
    /// from the id generator and the operator.
    ///
    /// # Errors
    ///
    /// - `InvalidType` / `EmptyName` for a malformed payload
    /// - `UnknownParent` if the parent does not exist in the tenant
    /// - `TerminalNode`, `SkipLevel`, `TypeRegression` for illegal nesting
    pub async fn create_node(
        &self,
        operator: &Operator,
        payload: NodePayload,
    ) -> HierarchyResult<Uuid> {
        let requested = NodeValidator::resolve_type(payload.node_type)?;
        NodeValidator::check_name(&payload.name)?;

        let parent = match payload.parent_id {
            Some(parent_id) => {
                let parent = self
                    .store
                    .get_node(parent_id)
                    .await?
                    .filter(|parent| parent.tenant_id == operator.tenant_id)
                    .ok_or(HierarchyError::UnknownParent(parent_id))?;
                Some(parent)
            }
            None => None,
        };
        let node_type = NodeValidator::check_placement(parent.as_ref(), requested)?;

        let node = Node {
            id: self.ids.next_id(),
            tenant_id: operator.tenant_id,
            parent_id: payload.parent_id,
            node_type,
            index: payload.index,
            code: payload.code,
            name: payload.name,
            alias: payload.alias,
            full_name: payload.full_name,
            remark: payload.remark,
            invalid: false,
            creator: Some(operator.user_name.clone()),
            creator_id: Some(operator.user_id),
            created_time: Utc::now(),
        };
        let id = node.id;

        if self.store.insert_node(node.clone()).await? == InsertOutcome::AlreadyExists {
            return Err(StoreError::Duplicate(id).into());
        }

        tracing::info!(
            node_id = %id,
            tenant_id = %operator.tenant_id,
            node_type = %node_type,
            "Node created"
        );
        self.record(operator, OperationKind::Insert, id, &node);

        Ok(id)
    }

    /// Apply a partial edit.
    ///
    /// A new parent must exist in the node's own tenant. Nesting rules are
    /// not re-checked; a placement that would have been rejected at creation
    /// time is logged.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the node does not exist
    /// - `UnknownParent` if the new parent is missing or in another tenant
    pub async fn edit_node(
        &self,
        operator: &Operator,
        id: Uuid,
        patch: NodePatch,
    ) -> HierarchyResult<()> {
        let existing = self.get_node(id).await?;
        let merged = existing.merged(&patch)?;

        if merged.parent_id != existing.parent_id || merged.node_type != existing.node_type {
            let parent = match merged.parent_id {
                Some(parent_id) => Some(
                    self.store
                        .get_node(parent_id)
                        .await?
                        .filter(|parent| parent.tenant_id == existing.tenant_id)
                        .ok_or(HierarchyError::UnknownParent(parent_id))?,
                ),
                None => None,
            };
            if let Some(reason) = NodeValidator::violation(parent.as_ref(), merged.node_type) {
                tracing::warn!(node_id = %id, %reason, "Edit leaves node in a disallowed placement");
            }
        }

        self.store.update_node(merged.clone()).await?;

        tracing::info!(node_id = %id, "Node updated");
        self.record(operator, OperationKind::Update, id, &merged);

        Ok(())
    }

    /// Delete a childless node and its membership edges.
    pub async fn delete_node(&self, operator: &Operator, id: Uuid) -> HierarchyResult<()> {
        if self.store.get_node(id).await?.is_none() {
            return Err(HierarchyError::NotFound(id));
        }

        let count = self.store.count_children(id).await?;
        if count > 0 {
            return Err(HierarchyError::HasChildren { id, count });
        }

        let removed = self
            .store
            .delete_node(id)
            .await?
            .ok_or(HierarchyError::NotFound(id))?;

        tracing::info!(node_id = %id, "Node deleted");
        self.record(operator, OperationKind::Delete, id, &removed);

        Ok(())
    }

    /// Insert a node exactly as sent, without nesting validation or audit.
    ///
    /// Used by the ingestion queue. Inserting an id that already exists is
    /// a successful no-op so redelivered messages converge.
    pub async fn insert_raw(&self, payload: NodePayload) -> HierarchyResult<InsertOutcome> {
        let id = payload.id.ok_or(HierarchyError::MissingField("id"))?;
        let tenant_id = payload
            .tenant_id
            .ok_or(HierarchyError::MissingField("tenantId"))?;
        let node_type = NodeType::try_from(payload.node_type.unwrap_or(0))?;

        let node = Node {
            id,
            tenant_id,
            parent_id: payload.parent_id,
            node_type,
            index: payload.index,
            code: payload.code,
            name: payload.name,
            alias: payload.alias,
            full_name: payload.full_name,
            remark: payload.remark,
            invalid: false,
            creator: payload.creator,
            creator_id: payload.creator_id,
            created_time: Utc::now(),
        };

        let outcome = self.store.insert_node(node).await?;
        tracing::debug!(node_id = %id, ?outcome, "Raw node insert");

        Ok(outcome)
    }

    fn record(&self, operator: &Operator, operation: OperationKind, id: Uuid, node: &Node) {
        let content = serde_json::to_value(node).unwrap_or_default();
        self.audit.emit(AuditRecord::new(
            self.ids.next_id(),
            operator,
            operation,
            id,
            content,
        ));
    }
}
