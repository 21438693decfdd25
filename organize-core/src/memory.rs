//! In-memory store
//!
//! A single-process implementation of the node, membership and audit
//! tables. All three live behind one lock, so every call behaves like one
//! serializable transaction: foreign-key and child checks happen in the
//! same write section as the change they guard.
//!
//! The store can be switched offline or told to fail upcoming writes,
//! which lets tests exercise the retry paths.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::audit::AuditRecord;
use crate::error::{StoreError, StoreResult};
use crate::membership::MembershipEdge;
use crate::node::{Node, NodeSummary};
use crate::page::{Page, PageRequest};
use crate::store::{AuditStore, InsertOutcome, MembershipStore, NodeStore};

#[derive(Debug, Default)]
struct Tables {
    nodes: HashMap<Uuid, Node>,
    edges: HashSet<MembershipEdge>,
    audit: Vec<AuditRecord>,
}

impl Tables {
    fn child_count(&self, id: Uuid) -> u64 {
        self.nodes
            .values()
            .filter(|node| node.parent_id == Some(id))
            .count() as u64
    }

    fn check_parent(&self, parent_id: Option<Uuid>) -> StoreResult<()> {
        match parent_id {
            Some(parent_id) if !self.nodes.contains_key(&parent_id) => {
                Err(StoreError::ForeignKey { parent_id })
            }
            _ => Ok(()),
        }
    }
}

fn sort_nodes(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| {
        (a.node_type, a.index, a.created_time).cmp(&(b.node_type, b.index, b.created_time))
    });
}

/// In-memory implementation of every store trait.
///
/// Cloning shares the underlying tables.
///
/// # Examples
///
/// ```
/// use organize_core::MemoryStore;
///
/// let store = MemoryStore::new();
/// let shared = store.clone();
/// store.set_available(false);
/// assert!(!shared.is_available());
/// ```
#[derive(Debug, Clone)]
pub struct MemoryStore {
    /// Tables
    tables: Arc<RwLock<Tables>>,
    /// Whether calls succeed at all
    available: Arc<AtomicBool>,
    /// Upcoming node writes that should fail
    failing_writes: Arc<AtomicU32>,
}

impl MemoryStore {
    /// Create an empty, available store.
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            available: Arc::new(AtomicBool::new(true)),
            failing_writes: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Switch the store on- or offline.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Check if the store accepts calls.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Make the next `count` node inserts fail as unavailable.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Total number of nodes across all tenants.
    pub async fn node_count(&self) -> usize {
        self.tables.read().await.nodes.len()
    }

    /// Total number of membership edges.
    pub async fn edge_count(&self) -> usize {
        self.tables.read().await.edges.len()
    }

    /// Insert a node without any foreign-key check.
    ///
    /// Intended for seeding malformed fixtures.
    pub async fn force_insert(&self, node: Node) {
        self.tables.write().await.nodes.insert(node.id, node);
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn take_injected_failure(&self) -> StoreResult<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn get_node(&self, id: Uuid) -> StoreResult<Option<Node>> {
        self.ensure_available()?;
        Ok(self.tables.read().await.nodes.get(&id).cloned())
    }

    async fn list_nodes(
        &self,
        tenant_id: Uuid,
        keyword: Option<&str>,
        page: PageRequest,
    ) -> StoreResult<Page<NodeSummary>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;

        let mut nodes: Vec<Node> = tables
            .nodes
            .values()
            .filter(|node| node.tenant_id == tenant_id)
            .filter(|node| match keyword {
                Some(keyword) => {
                    node.code.as_deref() == Some(keyword) || node.name.contains(keyword)
                }
                None => true,
            })
            .cloned()
            .collect();
        sort_nodes(&mut nodes);

        Ok(page.slice(nodes.iter().map(Node::summary).collect()))
    }

    async fn children(&self, id: Uuid) -> StoreResult<Vec<Node>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;

        let mut children: Vec<Node> = tables
            .nodes
            .values()
            .filter(|node| node.parent_id == Some(id))
            .cloned()
            .collect();
        sort_nodes(&mut children);

        Ok(children)
    }

    async fn count_children(&self, id: Uuid) -> StoreResult<u64> {
        self.ensure_available()?;
        Ok(self.tables.read().await.child_count(id))
    }

    async fn insert_node(&self, node: Node) -> StoreResult<InsertOutcome> {
        self.ensure_available()?;
        self.take_injected_failure()?;
        let mut tables = self.tables.write().await;

        if tables.nodes.contains_key(&node.id) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        tables.check_parent(node.parent_id)?;
        tables.nodes.insert(node.id, node);

        Ok(InsertOutcome::Inserted)
    }

    async fn update_node(&self, node: Node) -> StoreResult<()> {
        self.ensure_available()?;
        let mut tables = self.tables.write().await;

        if !tables.nodes.contains_key(&node.id) {
            return Err(StoreError::Missing(node.id));
        }
        tables.check_parent(node.parent_id)?;
        tables.nodes.insert(node.id, node);

        Ok(())
    }

    async fn delete_node(&self, id: Uuid) -> StoreResult<Option<Node>> {
        self.ensure_available()?;
        let mut tables = self.tables.write().await;

        let children = tables.child_count(id);
        if children > 0 {
            return Err(StoreError::HasDependents { id, children });
        }

        let removed = tables.nodes.remove(&id);
        if removed.is_some() {
            tables.edges.retain(|edge| edge.position_id != id);
        }

        Ok(removed)
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn add_edges(&self, position_id: Uuid, user_ids: &[Uuid]) -> StoreResult<usize> {
        self.ensure_available()?;
        let mut tables = self.tables.write().await;

        let added = user_ids
            .iter()
            .filter(|user_id| tables.edges.insert(MembershipEdge::new(position_id, **user_id)))
            .count();

        Ok(added)
    }

    async fn remove_edges(&self, position_id: Uuid, user_ids: &[Uuid]) -> StoreResult<usize> {
        self.ensure_available()?;
        let mut tables = self.tables.write().await;

        let removed = user_ids
            .iter()
            .filter(|user_id| tables.edges.remove(&MembershipEdge::new(position_id, **user_id)))
            .count();

        Ok(removed)
    }

    async fn member_ids(&self, position_id: Uuid) -> StoreResult<Vec<Uuid>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;

        Ok(tables
            .edges
            .iter()
            .filter(|edge| edge.position_id == position_id)
            .map(|edge| edge.user_id)
            .collect())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_record(&self, record: AuditRecord) -> StoreResult<()> {
        self.ensure_available()?;
        self.tables.write().await.audit.push(record);
        Ok(())
    }

    async fn get_record(&self, id: Uuid) -> StoreResult<Option<AuditRecord>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        Ok(tables.audit.iter().find(|record| record.id == id).cloned())
    }

    async fn list_records(
        &self,
        tenant_id: Uuid,
        business_id: Option<Uuid>,
    ) -> StoreResult<Vec<AuditRecord>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;

        let mut records: Vec<AuditRecord> = tables
            .audit
            .iter()
            .filter(|record| record.tenant_id == tenant_id)
            .filter(|record| business_id.map_or(true, |id| record.business_id == id))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.created_time);

        Ok(records)
    }
}
