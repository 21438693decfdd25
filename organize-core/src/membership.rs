//! Position membership
//!
//! Users are attached to position nodes through `(position, user)` edges.
//! The user records themselves live in an external directory reached
//! through [`UserDirectory`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditSink, OperationKind, Operator};
use crate::error::{HierarchyError, HierarchyResult, StoreResult};
use crate::node::{IdGenerator, NodeType};
use crate::page::{Page, PageRequest};
use crate::store::{MembershipStore, NodeStore};

/// One row of the membership join table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipEdge {
    /// Position node
    pub position_id: Uuid,

    /// Member user
    pub user_id: Uuid,
}

impl MembershipEdge {
    /// Creates an edge.
    pub fn new(position_id: Uuid, user_id: Uuid) -> Self {
        Self {
            position_id,
            user_id,
        }
    }
}

/// User as returned by member listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    /// User ID
    pub id: Uuid,

    /// Employee code
    pub code: String,

    /// Display name
    pub name: String,

    /// Login account
    pub account: String,

    /// Mobile phone
    pub mobile: Option<String>,

    /// Disabled flag
    pub invalid: bool,

    /// When the user was created
    pub created_time: DateTime<Utc>,
}

impl UserSummary {
    /// Creates an active user.
    pub fn new(code: impl Into<String>, name: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            code: code.into(),
            name: name.into(),
            account: account.into(),
            mobile: None,
            invalid: false,
            created_time: Utc::now(),
        }
    }

    /// Set the creation time.
    pub fn with_created_time(mut self, created_time: DateTime<Utc>) -> Self {
        self.created_time = created_time;
        self
    }

    /// Set the mobile phone.
    pub fn with_mobile(mut self, mobile: impl Into<String>) -> Self {
        self.mobile = Some(mobile.into());
        self
    }

    /// Keyword match: exact code, exact account, or name substring.
    pub fn matches(&self, keyword: &str) -> bool {
        self.code == keyword || self.account == keyword || self.name.contains(keyword)
    }
}

/// External user directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve users by id; unknown ids are skipped.
    async fn users_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<UserSummary>>;
}

/// In-memory user directory for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryUserDirectory {
    users: Arc<RwLock<HashMap<Uuid, UserSummary>>>,
}

impl MemoryUserDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user; returns its id.
    pub async fn insert(&self, user: UserSummary) -> Uuid {
        let id = user.id;
        self.users.write().await.insert(id, user);
        id
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn users_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<UserSummary>> {
        let users = self.users.read().await;
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }
}

/// Attaches users to positions and lists them back.
///
/// # Example
///
/// ```rust,ignore
/// let members = MembershipManager::new(store.clone(), store, directory, ids, audit);
/// members.add_members(&operator, lead_id, &[alice, bob]).await?;
/// let page = members.list_members(lead_id, Some("ali"), PageRequest::default()).await?;
/// ```
#[derive(Clone)]
pub struct MembershipManager {
    store: Arc<dyn NodeStore>,
    edges: Arc<dyn MembershipStore>,
    directory: Arc<dyn UserDirectory>,
    ids: Arc<dyn IdGenerator>,
    audit: Arc<dyn AuditSink>,
}

impl MembershipManager {
    /// Creates a manager over the given collaborators.
    pub fn new(
        store: Arc<dyn NodeStore>,
        edges: Arc<dyn MembershipStore>,
        directory: Arc<dyn UserDirectory>,
        ids: Arc<dyn IdGenerator>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            edges,
            directory,
            ids,
            audit,
        }
    }

    /// Attach users to a position.
    ///
    /// Repeated ids in the request collapse and existing edges are left
    /// alone, so the call can be repeated safely.
    pub async fn add_members(
        &self,
        operator: &Operator,
        position_id: Uuid,
        user_ids: &[Uuid],
    ) -> HierarchyResult<()> {
        if user_ids.is_empty() {
            return Err(HierarchyError::EmptySelection);
        }

        let node = self
            .store
            .get_node(position_id)
            .await?
            .ok_or(HierarchyError::NotFound(position_id))?;
        if node.node_type != NodeType::Position {
            return Err(HierarchyError::NotAPosition(position_id));
        }

        let mut seen = HashSet::new();
        let unique: Vec<Uuid> = user_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        let added = self.edges.add_edges(position_id, &unique).await?;
        tracing::info!(
            position_id = %position_id,
            requested = unique.len(),
            added,
            "Members added"
        );

        self.record(operator, OperationKind::Insert, position_id, &unique);
        Ok(())
    }

    /// Detach users from a position; unknown edges are ignored.
    pub async fn remove_members(
        &self,
        operator: &Operator,
        position_id: Uuid,
        user_ids: &[Uuid],
    ) -> HierarchyResult<()> {
        if user_ids.is_empty() {
            return Err(HierarchyError::EmptySelection);
        }
        if self.store.get_node(position_id).await?.is_none() {
            return Err(HierarchyError::NotFound(position_id));
        }

        let removed = self.edges.remove_edges(position_id, user_ids).await?;
        tracing::info!(position_id = %position_id, removed, "Members removed");

        self.record(operator, OperationKind::Delete, position_id, user_ids);
        Ok(())
    }

    /// Members of a position, oldest user first.
    pub async fn list_members(
        &self,
        position_id: Uuid,
        keyword: Option<&str>,
        page: PageRequest,
    ) -> HierarchyResult<Page<UserSummary>> {
        if self.store.get_node(position_id).await?.is_none() {
            return Err(HierarchyError::NotFound(position_id));
        }

        let ids = self.edges.member_ids(position_id).await?;
        let mut users = self.directory.users_by_ids(&ids).await?;

        if let Some(keyword) = keyword.map(str::trim).filter(|k| !k.is_empty()) {
            users.retain(|user| user.matches(keyword));
        }
        users.sort_by_key(|user| user.created_time);

        Ok(page.slice(users))
    }

    fn record(&self, operator: &Operator, operation: OperationKind, position_id: Uuid, user_ids: &[Uuid]) {
        let content = serde_json::json!({
            "positionId": position_id,
            "userIds": user_ids,
        });
        self.audit.emit(AuditRecord::new(
            self.ids.next_id(),
            operator,
            operation,
            position_id,
            content,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::memory::MemoryStore;
    use crate::node::{Node, UuidV7Generator};
    use chrono::Duration;

    struct Fixture {
        store: MemoryStore,
        directory: MemoryUserDirectory,
        audit: Arc<MemoryAuditSink>,
        members: MembershipManager,
        operator: Operator,
        department: Uuid,
        position: Uuid,
    }

    fn node(tenant_id: Uuid, parent_id: Option<Uuid>, node_type: NodeType, name: &str) -> Node {
        Node {
            id: Uuid::now_v7(),
            tenant_id,
            parent_id,
            node_type,
            index: None,
            code: None,
            name: name.to_string(),
            alias: None,
            full_name: None,
            remark: None,
            invalid: false,
            creator: None,
            creator_id: None,
            created_time: Utc::now(),
        }
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let directory = MemoryUserDirectory::new();
        let audit = Arc::new(MemoryAuditSink::new());
        let operator = Operator::new(Uuid::now_v7(), Uuid::now_v7(), "admin");

        let org = node(operator.tenant_id, None, NodeType::Organization, "HQ");
        let dept = node(operator.tenant_id, Some(org.id), NodeType::Department, "Engineering");
        let post = node(operator.tenant_id, Some(dept.id), NodeType::Position, "Lead");
        let (department, position) = (dept.id, post.id);
        for n in [org, dept, post] {
            store.insert_node(n).await.unwrap();
        }

        let members = MembershipManager::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(directory.clone()),
            Arc::new(UuidV7Generator),
            audit.clone(),
        );

        Fixture {
            store,
            directory,
            audit,
            members,
            operator,
            department,
            position,
        }
    }

    #[tokio::test]
    async fn test_add_members_dedupes_and_is_repeatable() {
        let fx = fixture().await;
        let alice = Uuid::now_v7();
        let bob = Uuid::now_v7();

        fx.members
            .add_members(&fx.operator, fx.position, &[alice, bob, alice])
            .await
            .unwrap();
        fx.members
            .add_members(&fx.operator, fx.position, &[bob])
            .await
            .unwrap();

        assert_eq!(fx.store.edge_count().await, 2);

        let records = fx.audit.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].operation, OperationKind::Insert);
        assert_eq!(records[0].business_id, fx.position);
        assert_eq!(records[0].content["userIds"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_members_rejections() {
        let fx = fixture().await;
        let user = Uuid::now_v7();

        assert!(matches!(
            fx.members.add_members(&fx.operator, fx.position, &[]).await,
            Err(HierarchyError::EmptySelection)
        ));

        let missing = Uuid::now_v7();
        assert!(matches!(
            fx.members.add_members(&fx.operator, missing, &[user]).await,
            Err(HierarchyError::NotFound(id)) if id == missing
        ));

        assert!(matches!(
            fx.members.add_members(&fx.operator, fx.department, &[user]).await,
            Err(HierarchyError::NotAPosition(id)) if id == fx.department
        ));

        assert!(fx.audit.is_empty());
    }

    #[tokio::test]
    async fn test_remove_members_ignores_absent_edges() {
        let fx = fixture().await;
        let alice = Uuid::now_v7();
        let stranger = Uuid::now_v7();

        fx.members
            .add_members(&fx.operator, fx.position, &[alice])
            .await
            .unwrap();
        fx.members
            .remove_members(&fx.operator, fx.position, &[alice, stranger])
            .await
            .unwrap();

        assert_eq!(fx.store.edge_count().await, 0);
        assert_eq!(fx.audit.records()[1].operation, OperationKind::Delete);

        assert!(matches!(
            fx.members.remove_members(&fx.operator, fx.position, &[]).await,
            Err(HierarchyError::EmptySelection)
        ));
    }

    #[tokio::test]
    async fn test_list_members_filters_and_orders() {
        let fx = fixture().await;
        let now = Utc::now();

        let carol = fx
            .directory
            .insert(UserSummary::new("E003", "Carol King", "carol").with_created_time(now))
            .await;
        let alice = fx
            .directory
            .insert(
                UserSummary::new("E001", "Alice Smith", "alice")
                    .with_created_time(now - Duration::days(2)),
            )
            .await;
        let bob = fx
            .directory
            .insert(
                UserSummary::new("E002", "Bob Smith", "bob")
                    .with_created_time(now - Duration::days(1)),
            )
            .await;

        fx.members
            .add_members(&fx.operator, fx.position, &[carol, alice, bob])
            .await
            .unwrap();

        let all = fx
            .members
            .list_members(fx.position, None, PageRequest::default())
            .await
            .unwrap();
        let names: Vec<&str> = all.items.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["Alice Smith", "Bob Smith", "Carol King"]);

        let smiths = fx
            .members
            .list_members(fx.position, Some("Smith"), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(smiths.total, 2);

        let by_account = fx
            .members
            .list_members(fx.position, Some("carol"), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(by_account.total, 1);
        assert_eq!(by_account.items[0].id, carol);

        let paged = fx
            .members
            .list_members(fx.position, None, PageRequest::new(2, 2))
            .await
            .unwrap();
        assert_eq!(paged.total, 3);
        assert_eq!(paged.items.len(), 1);
    }

    #[tokio::test]
    async fn test_list_members_of_unknown_position() {
        let fx = fixture().await;
        let missing = Uuid::now_v7();

        assert!(matches!(
            fx.members
                .list_members(missing, None, PageRequest::default())
                .await,
            Err(HierarchyError::NotFound(id)) if id == missing
        ));
    }
}
