//! Hierarchy node domain models
//!
//! This module provides the node entity shared by organizations, departments
//! and positions, plus the payloads used to create and edit nodes and the
//! lightweight projections returned by listings and ancestor walks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{HierarchyError, HierarchyResult};

/// Level of a node in the hierarchy.
///
/// Levels are ordered: a node may only sit under a node of the same or a
/// lower level, and positions never have children.
///
/// # Examples
///
/// ```
/// use organize_core::NodeType;
///
/// assert!(NodeType::Organization < NodeType::Department);
/// assert!(NodeType::Position.is_terminal());
/// assert_eq!(NodeType::try_from(1).unwrap(), NodeType::Department);
/// assert!(NodeType::try_from(3).is_err());
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(into = "i32", try_from = "i32")]
pub enum NodeType {
    /// Organization (company, branch, legal entity)
    Organization = 0,

    /// Department inside an organization
    Department = 1,

    /// Position inside a department; always a leaf
    Position = 2,
}

impl NodeType {
    /// Numeric level as stored in the node table.
    pub fn level(self) -> i32 {
        self as i32
    }

    /// Check if nodes of this type can never have children.
    pub fn is_terminal(self) -> bool {
        self == NodeType::Position
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Organization => "organization",
            NodeType::Department => "department",
            NodeType::Position => "position",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<NodeType> for i32 {
    fn from(node_type: NodeType) -> Self {
        node_type.level()
    }
}

impl TryFrom<i32> for NodeType {
    type Error = HierarchyError;

    fn try_from(level: i32) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(NodeType::Organization),
            1 => Ok(NodeType::Department),
            2 => Ok(NodeType::Position),
            other => Err(HierarchyError::InvalidType(other)),
        }
    }
}

/// A node of the organization chart.
///
/// # Architecture
///
/// ```text
/// Organization (parent_id = None)
///   ├─ Organization
///   └─ Department
///        ├─ Department
///        └─ Position
///             └─ Members (via MembershipEdge)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier, generated outside the hierarchy engine
    pub id: Uuid,

    /// Owning tenant
    pub tenant_id: Uuid,

    /// Parent node, `None` for tenant roots
    pub parent_id: Option<Uuid>,

    /// Hierarchy level
    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Sibling order (not unique)
    pub index: Option<i32>,

    /// Business code
    pub code: Option<String>,

    /// Display name
    pub name: String,

    /// Short name
    pub alias: Option<String>,

    /// Full legal or descriptive name
    pub full_name: Option<String>,

    /// Free-form remark
    pub remark: Option<String>,

    /// Soft-delete marker
    pub invalid: bool,

    /// Name of the user who created the node
    pub creator: Option<String>,

    /// Id of the user who created the node
    pub creator_id: Option<Uuid>,

    /// When the node was created
    pub created_time: DateTime<Utc>,
}

impl Node {
    /// Check if this node is a tenant root.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Project the node into a listing row.
    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id,
            parent_id: self.parent_id,
            node_type: self.node_type,
            index: self.index,
            code: self.code.clone(),
            name: self.name.clone(),
            alias: self.alias.clone(),
            full_name: self.full_name.clone(),
        }
    }

    /// Project the node into an ancestor chain element.
    pub fn chain_entry(&self) -> ChainEntry {
        ChainEntry {
            id: self.id,
            parent_id: self.parent_id,
            node_type: self.node_type,
            code: self.code.clone(),
            name: self.name.clone(),
        }
    }

    /// Merge a partial edit over this node.
    ///
    /// Fields left unset in the patch keep their current value. Creation
    /// metadata, tenant and the soft-delete marker are never touched.
    ///
    /// # Errors
    ///
    /// `InvalidType` for a type outside the known levels and `EmptyName`
    /// for a blank replacement name.
    pub fn merged(&self, patch: &NodePatch) -> HierarchyResult<Node> {
        let node_type = match patch.node_type {
            Some(level) => NodeType::try_from(level)?,
            None => self.node_type,
        };
        let name = match &patch.name {
            Some(name) if name.trim().is_empty() => return Err(HierarchyError::EmptyName),
            Some(name) => name.clone(),
            None => self.name.clone(),
        };

        Ok(Node {
            parent_id: patch.parent_id.or(self.parent_id),
            node_type,
            index: patch.index.or(self.index),
            code: patch.code.clone().or_else(|| self.code.clone()),
            name,
            alias: patch.alias.clone().or_else(|| self.alias.clone()),
            full_name: patch.full_name.clone().or_else(|| self.full_name.clone()),
            remark: patch.remark.clone().or_else(|| self.remark.clone()),
            ..self.clone()
        })
    }
}

/// Node creation payload.
///
/// The same shape is accepted by the hierarchy service and carried by
/// creation events on the ingestion queue. The service overwrites id,
/// tenant and creator fields; the queue path inserts them as sent.
///
/// # Examples
///
/// ```
/// use organize_core::{NodePayload, NodeType};
///
/// let payload = NodePayload::new("Engineering").with_type(NodeType::Department);
/// assert_eq!(payload.node_type, Some(1));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePayload {
    /// Node id (required on the queue path)
    pub id: Option<Uuid>,

    /// Tenant id (required on the queue path)
    pub tenant_id: Option<Uuid>,

    /// Parent node
    pub parent_id: Option<Uuid>,

    /// Raw hierarchy level, validated on use
    #[serde(rename = "type")]
    pub node_type: Option<i32>,

    /// Sibling order
    pub index: Option<i32>,

    /// Business code
    pub code: Option<String>,

    /// Display name
    pub name: String,

    /// Short name
    pub alias: Option<String>,

    /// Full name
    pub full_name: Option<String>,

    /// Free-form remark
    pub remark: Option<String>,

    /// Creator name
    pub creator: Option<String>,

    /// Creator id
    pub creator_id: Option<Uuid>,
}

impl NodePayload {
    /// Creates a payload with only a name set.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the node id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the tenant.
    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Set the parent node.
    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Set the node type.
    pub fn with_type(mut self, node_type: NodeType) -> Self {
        self.node_type = Some(node_type.level());
        self
    }

    /// Set a raw, unvalidated type level.
    pub fn with_raw_type(mut self, level: i32) -> Self {
        self.node_type = Some(level);
        self
    }

    /// Set the sibling order.
    pub fn with_index(mut self, index: i32) -> Self {
        self.index = Some(index);
        self
    }

    /// Set the business code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Partial edit of a node.
///
/// Every field is optional; unset fields inherit the stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    /// New parent
    pub parent_id: Option<Uuid>,

    /// New raw type level
    #[serde(rename = "type")]
    pub node_type: Option<i32>,

    /// New sibling order
    pub index: Option<i32>,

    /// New code
    pub code: Option<String>,

    /// New name
    pub name: Option<String>,

    /// New alias
    pub alias: Option<String>,

    /// New full name
    pub full_name: Option<String>,

    /// New remark
    pub remark: Option<String>,
}

/// Flat listing row of a node.
///
/// Callers rebuild trees from these rows using `parent_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    /// Node ID
    pub id: Uuid,

    /// Parent ID
    pub parent_id: Option<Uuid>,

    /// Node type
    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Sibling order
    pub index: Option<i32>,

    /// Code
    pub code: Option<String>,

    /// Name
    pub name: String,

    /// Alias
    pub alias: Option<String>,

    /// Full name
    pub full_name: Option<String>,
}

/// One element of an ancestor chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEntry {
    /// Node ID
    pub id: Uuid,

    /// Parent ID
    pub parent_id: Option<Uuid>,

    /// Node type
    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Code
    pub code: Option<String>,

    /// Name
    pub name: String,
}

/// Source of node and audit record identifiers.
///
/// The id strategy (snowflake, UUID, database sequence) belongs to the
/// deployment; the engine only asks for the next value.
pub trait IdGenerator: Send + Sync {
    /// Produce a fresh, unique id.
    fn next_id(&self) -> Uuid;
}

/// Time-ordered UUID v7 generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn next_id(&self) -> Uuid {
        Uuid::now_v7()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_node() -> Node {
        Node {
            id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            parent_id: None,
            node_type: NodeType::Organization,
            index: Some(1),
            code: Some("HQ".to_string()),
            name: "Headquarters".to_string(),
            alias: Some("HQ".to_string()),
            full_name: None,
            remark: None,
            invalid: false,
            creator: Some("admin".to_string()),
            creator_id: Some(Uuid::now_v7()),
            created_time: Utc::now(),
        }
    }

    #[test]
    fn test_node_type_levels_are_ordered() {
        assert!(NodeType::Organization < NodeType::Department);
        assert!(NodeType::Department < NodeType::Position);
        assert_eq!(NodeType::Position.level(), 2);
        assert!(!NodeType::Department.is_terminal());
    }

    #[test]
    fn test_node_type_rejects_unknown_level() {
        assert!(matches!(
            NodeType::try_from(7),
            Err(HierarchyError::InvalidType(7))
        ));
        assert!(matches!(
            NodeType::try_from(-1),
            Err(HierarchyError::InvalidType(-1))
        ));
    }

    #[test]
    fn test_node_type_serializes_as_level() {
        assert_eq!(serde_json::to_value(NodeType::Department).unwrap(), json!(1));
        let parsed: NodeType = serde_json::from_value(json!(2)).unwrap();
        assert_eq!(parsed, NodeType::Position);
        assert!(serde_json::from_value::<NodeType>(json!(5)).is_err());
    }

    #[test]
    fn test_payload_decodes_camel_case() {
        let parent = Uuid::now_v7();
        let body = json!({
            "parentId": parent,
            "type": 1,
            "name": "Engineering",
            "fullName": "Engineering Department"
        });

        let payload: NodePayload = serde_json::from_value(body).unwrap();
        assert_eq!(payload.parent_id, Some(parent));
        assert_eq!(payload.node_type, Some(1));
        assert_eq!(payload.full_name.as_deref(), Some("Engineering Department"));
        assert!(payload.id.is_none());
    }

    #[test]
    fn test_payload_requires_name() {
        let body = json!({ "type": 1 });
        assert!(serde_json::from_value::<NodePayload>(body).is_err());
    }

    #[test]
    fn test_merge_keeps_unset_fields() {
        let node = sample_node();
        let patch = NodePatch {
            name: Some("Head Office".to_string()),
            remark: Some("renamed".to_string()),
            ..NodePatch::default()
        };

        let merged = node.merged(&patch).unwrap();
        assert_eq!(merged.name, "Head Office");
        assert_eq!(merged.remark.as_deref(), Some("renamed"));
        assert_eq!(merged.code, node.code);
        assert_eq!(merged.alias, node.alias);
        assert_eq!(merged.index, node.index);
        assert_eq!(merged.created_time, node.created_time);
        assert_eq!(merged.creator_id, node.creator_id);
    }

    #[test]
    fn test_merge_rejects_blank_name_and_bad_type() {
        let node = sample_node();

        let blank = NodePatch {
            name: Some("   ".to_string()),
            ..NodePatch::default()
        };
        assert!(matches!(node.merged(&blank), Err(HierarchyError::EmptyName)));

        let bad_type = NodePatch {
            node_type: Some(9),
            ..NodePatch::default()
        };
        assert!(matches!(
            node.merged(&bad_type),
            Err(HierarchyError::InvalidType(9))
        ));
    }

    #[test]
    fn test_projections() {
        let node = sample_node();
        let summary = node.summary();
        assert_eq!(summary.id, node.id);
        assert_eq!(summary.alias, node.alias);

        let entry = node.chain_entry();
        assert_eq!(entry.name, node.name);
        assert!(node.is_root());
    }
}
