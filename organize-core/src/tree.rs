//! Tree resolution
//!
//! Walks parent links to produce ancestor chains and flat listings. Trees
//! are never materialized here; callers rebuild them from `parent_id`.
//!
//! Parent links are supposed to form a forest, but edits are not
//! re-validated, so every walk carries a visited set and a depth bound and
//! fails fast on malformed data instead of looping.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{HierarchyError, HierarchyResult};
use crate::node::{ChainEntry, NodeSummary};
use crate::page::{Page, PageRequest};
use crate::store::NodeStore;

/// Default bound on the length of any walk.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Resolves ancestor chains and listings from the node store.
#[derive(Clone)]
pub struct TreeResolver {
    /// Node table
    store: Arc<dyn NodeStore>,
    /// Maximum number of levels a walk may visit
    max_depth: usize,
}

impl std::fmt::Debug for TreeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeResolver")
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

impl TreeResolver {
    /// Create a resolver with the default depth bound.
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self {
            store,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Override the depth bound.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// The configured depth bound.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Ordered path from a node up to its root, starting with the node.
    ///
    /// # Errors
    ///
    /// - `NotFound` if `id` does not exist
    /// - `UnknownParent` if a parent link points at a missing node
    /// - `CycleDetected` if a node is reached twice
    /// - `DepthExceeded` if the chain is longer than the depth bound
    pub async fn ancestor_chain(&self, id: Uuid) -> HierarchyResult<Vec<ChainEntry>> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = id;

        loop {
            if !visited.insert(current) {
                tracing::warn!(node_id = %id, repeated = %current, "Cycle in parent links");
                return Err(HierarchyError::CycleDetected(current));
            }
            if chain.len() >= self.max_depth {
                return Err(HierarchyError::DepthExceeded(self.max_depth));
            }

            let node = match self.store.get_node(current).await? {
                Some(node) => node,
                None if chain.is_empty() => return Err(HierarchyError::NotFound(id)),
                None => return Err(HierarchyError::UnknownParent(current)),
            };

            let parent = node.parent_id;
            chain.push(node.chain_entry());

            match parent {
                Some(parent_id) => current = parent_id,
                None => break,
            }
        }

        Ok(chain)
    }

    /// A node followed by everything below it, breadth first.
    pub async fn descendants(&self, id: Uuid) -> HierarchyResult<Vec<ChainEntry>> {
        let root = self
            .store
            .get_node(id)
            .await?
            .ok_or(HierarchyError::NotFound(id))?;

        let mut listing = vec![root.chain_entry()];
        let mut visited = HashSet::from([root.id]);
        let mut frontier = VecDeque::from([(root.id, 1usize)]);

        while let Some((parent_id, depth)) = frontier.pop_front() {
            for child in self.store.children(parent_id).await? {
                if !visited.insert(child.id) {
                    tracing::warn!(node_id = %id, repeated = %child.id, "Cycle in parent links");
                    return Err(HierarchyError::CycleDetected(child.id));
                }
                if depth >= self.max_depth {
                    return Err(HierarchyError::DepthExceeded(self.max_depth));
                }
                listing.push(child.chain_entry());
                frontier.push_back((child.id, depth + 1));
            }
        }

        Ok(listing)
    }

    /// Flat, ordered listing of a tenant's nodes.
    pub async fn list_nodes(
        &self,
        tenant_id: Uuid,
        keyword: Option<&str>,
        page: PageRequest,
    ) -> HierarchyResult<Page<NodeSummary>> {
        let keyword = keyword.map(str::trim).filter(|k| !k.is_empty());
        Ok(self.store.list_nodes(tenant_id, keyword, page).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::node::{Node, NodeType};
    use chrono::Utc;

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

    /// Builds org -> dept -> sub-dept -> position and returns the nodes.
    async fn seed(store: &MemoryStore) -> Vec<Node> {
        let tenant = Uuid::now_v7();
        let org = node(tenant, None, NodeType::Organization, "HQ");
        let dept = node(tenant, Some(org.id), NodeType::Department, "Engineering");
        let team = node(tenant, Some(dept.id), NodeType::Department, "Platform");
        let lead = node(tenant, Some(team.id), NodeType::Position, "Lead");
        for n in [&org, &dept, &team, &lead] {
            store.insert_node(n.clone()).await.unwrap();
        }
        vec![org, dept, team, lead]
    }

    #[tokio::test]
    async fn test_chain_of_root_is_root() {
        let store = MemoryStore::new();
        let nodes = seed(&store).await;
        let resolver = TreeResolver::new(Arc::new(store));

        let chain = resolver.ancestor_chain(nodes[0].id).await.unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].id, nodes[0].id);
    }

    #[tokio::test]
    async fn test_chain_of_leaf_runs_leaf_to_root() {
        let store = MemoryStore::new();
        let nodes = seed(&store).await;
        let resolver = TreeResolver::new(Arc::new(store));

        let chain = resolver.ancestor_chain(nodes[3].id).await.unwrap();
        let ids: Vec<Uuid> = chain.iter().map(|entry| entry.id).collect();
        let expected: Vec<Uuid> = nodes.iter().rev().map(|n| n.id).collect();
        assert_eq!(ids, expected);

        let unique: HashSet<Uuid> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(chain.last().unwrap().parent_id.is_none());
    }

    #[tokio::test]
    async fn test_chain_of_unknown_node() {
        let resolver = TreeResolver::new(Arc::new(MemoryStore::new()));
        let missing = Uuid::now_v7();

        let result = resolver.ancestor_chain(missing).await;
        assert!(matches!(result, Err(HierarchyError::NotFound(id)) if id == missing));
    }

    #[tokio::test]
    async fn test_chain_detects_cycle() {
        let store = MemoryStore::new();
        let tenant = Uuid::now_v7();
        let mut a = node(tenant, None, NodeType::Department, "A");
        let b = node(tenant, Some(a.id), NodeType::Department, "B");
        a.parent_id = Some(b.id);
        store.force_insert(a.clone()).await;
        store.force_insert(b).await;

        let resolver = TreeResolver::new(Arc::new(store));
        let result = resolver.ancestor_chain(a.id).await;
        assert!(matches!(result, Err(HierarchyError::CycleDetected(id)) if id == a.id));
    }

    #[tokio::test]
    async fn test_chain_respects_depth_bound() {
        let store = MemoryStore::new();
        let nodes = seed(&store).await;
        let resolver = TreeResolver::new(Arc::new(store)).with_max_depth(2);

        let result = resolver.ancestor_chain(nodes[3].id).await;
        assert!(matches!(result, Err(HierarchyError::DepthExceeded(2))));
    }

    #[tokio::test]
    async fn test_chain_with_dangling_parent() {
        let store = MemoryStore::new();
        let ghost = Uuid::now_v7();
        let orphan = node(Uuid::now_v7(), Some(ghost), NodeType::Department, "Orphan");
        store.force_insert(orphan.clone()).await;

        let resolver = TreeResolver::new(Arc::new(store));
        let result = resolver.ancestor_chain(orphan.id).await;
        assert!(matches!(result, Err(HierarchyError::UnknownParent(id)) if id == ghost));
    }

    #[tokio::test]
    async fn test_descendants_breadth_first() {
        let store = MemoryStore::new();
        let nodes = seed(&store).await;
        let resolver = TreeResolver::new(Arc::new(store));

        let listing = resolver.descendants(nodes[1].id).await.unwrap();
        let names: Vec<&str> = listing.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["Engineering", "Platform", "Lead"]);
    }

    #[tokio::test]
    async fn test_descendants_detects_cycle() {
        let store = MemoryStore::new();
        let tenant = Uuid::now_v7();
        let mut a = node(tenant, None, NodeType::Department, "A");
        let b = node(tenant, Some(a.id), NodeType::Department, "B");
        a.parent_id = Some(b.id);
        store.force_insert(a.clone()).await;
        store.force_insert(b).await;

        let resolver = TreeResolver::new(Arc::new(store));
        let result = resolver.descendants(a.id).await;
        assert!(matches!(result, Err(HierarchyError::CycleDetected(id)) if id == a.id));
    }

    #[tokio::test]
    async fn test_descendants_respects_depth_bound() {
        let store = MemoryStore::new();
        let nodes = seed(&store).await;
        let store = Arc::new(store);

        let shallow = TreeResolver::new(store.clone()).with_max_depth(2);
        let result = shallow.descendants(nodes[0].id).await;
        assert!(matches!(result, Err(HierarchyError::DepthExceeded(2))));

        // Engineering has exactly three levels including itself
        let exact = TreeResolver::new(store).with_max_depth(3);
        assert_eq!(exact.descendants(nodes[1].id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_ignores_blank_keyword() {
        let store = MemoryStore::new();
        let nodes = seed(&store).await;
        let resolver = TreeResolver::new(Arc::new(store));

        let page = resolver
            .list_nodes(nodes[0].tenant_id, Some("  "), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.items[0].node_type, NodeType::Organization);
        assert_eq!(page.items[3].node_type, NodeType::Position);
    }
}
