//! Nesting rules
//!
//! The hierarchy is typed: organizations hold organizations and
//! departments, departments hold departments and positions, positions hold
//! nothing. Roots are always organizations.

use crate::error::{HierarchyError, HierarchyResult};
use crate::node::{Node, NodeType};

/// Checks candidate nodes against the nesting rules.
///
/// # Examples
///
/// ```
/// use organize_core::{NodeType, NodeValidator};
///
/// // Roots are forced to organizations whatever was asked for.
/// let resolved = NodeValidator::check_placement(None, NodeType::Department).unwrap();
/// assert_eq!(resolved, NodeType::Organization);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeValidator;

impl NodeValidator {
    /// Resolve a raw type level, defaulting to `Organization`.
    pub fn resolve_type(level: Option<i32>) -> HierarchyResult<NodeType> {
        match level {
            Some(level) => NodeType::try_from(level),
            None => Ok(NodeType::Organization),
        }
    }

    /// Require a non-blank name.
    pub fn check_name(name: &str) -> HierarchyResult<()> {
        if name.trim().is_empty() {
            Err(HierarchyError::EmptyName)
        } else {
            Ok(())
        }
    }

    /// Decide the type a new node gets under `parent`.
    ///
    /// Without a parent the node becomes an organization. Under a parent
    /// the requested type is kept when the parent is not a position, is not
    /// an organization receiving a position, and does not rank above it.
    pub fn check_placement(parent: Option<&Node>, requested: NodeType) -> HierarchyResult<NodeType> {
        let Some(parent) = parent else {
            return Ok(NodeType::Organization);
        };

        match (parent.node_type, requested) {
            (NodeType::Position, _) => Err(HierarchyError::TerminalNode(parent.id)),
            (NodeType::Organization, NodeType::Position) => {
                Err(HierarchyError::SkipLevel(parent.id))
            }
            (parent_type, child) if parent_type > child => Err(HierarchyError::TypeRegression {
                parent: parent_type,
                child,
            }),
            (_, child) => Ok(child),
        }
    }

    /// Describe why an existing node breaks the nesting rules, if it does.
    pub fn violation(parent: Option<&Node>, node_type: NodeType) -> Option<String> {
        match parent {
            None if node_type != NodeType::Organization => {
                Some(format!("root node has type {node_type}"))
            }
            None => None,
            Some(parent) => Self::check_placement(Some(parent), node_type)
                .err()
                .map(|err| err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn parent(node_type: NodeType) -> Node {
        Node {
            id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            parent_id: None,
            node_type,
            index: None,
            code: None,
            name: "parent".to_string(),
            alias: None,
            full_name: None,
            remark: None,
            invalid: false,
            creator: None,
            creator_id: None,
            created_time: Utc::now(),
        }
    }

    #[test]
    fn test_resolve_type_defaults_to_organization() {
        assert_eq!(
            NodeValidator::resolve_type(None).unwrap(),
            NodeType::Organization
        );
        assert_eq!(
            NodeValidator::resolve_type(Some(2)).unwrap(),
            NodeType::Position
        );
        assert!(matches!(
            NodeValidator::resolve_type(Some(3)),
            Err(HierarchyError::InvalidType(3))
        ));
    }

    #[test]
    fn test_check_name() {
        assert!(NodeValidator::check_name("HQ").is_ok());
        assert!(matches!(
            NodeValidator::check_name(" \t"),
            Err(HierarchyError::EmptyName)
        ));
    }

    #[test]
    fn test_allowed_placements() {
        let org = parent(NodeType::Organization);
        let dept = parent(NodeType::Department);

        let allowed = [
            (&org, NodeType::Organization),
            (&org, NodeType::Department),
            (&dept, NodeType::Department),
            (&dept, NodeType::Position),
        ];
        for (parent, child) in allowed {
            assert_eq!(
                NodeValidator::check_placement(Some(parent), child).unwrap(),
                child
            );
        }
    }

    #[test]
    fn test_rejected_placements() {
        let org = parent(NodeType::Organization);
        let dept = parent(NodeType::Department);
        let post = parent(NodeType::Position);

        assert!(matches!(
            NodeValidator::check_placement(Some(&post), NodeType::Position),
            Err(HierarchyError::TerminalNode(id)) if id == post.id
        ));
        assert!(matches!(
            NodeValidator::check_placement(Some(&org), NodeType::Position),
            Err(HierarchyError::SkipLevel(id)) if id == org.id
        ));
        assert!(matches!(
            NodeValidator::check_placement(Some(&dept), NodeType::Organization),
            Err(HierarchyError::TypeRegression {
                parent: NodeType::Department,
                child: NodeType::Organization
            })
        ));
    }

    #[test]
    fn test_violation_reports_misplaced_nodes() {
        let dept = parent(NodeType::Department);

        assert!(NodeValidator::violation(None, NodeType::Organization).is_none());
        assert!(NodeValidator::violation(None, NodeType::Department).is_some());
        assert!(NodeValidator::violation(Some(&dept), NodeType::Position).is_none());
        assert!(NodeValidator::violation(Some(&dept), NodeType::Organization).is_some());
    }
}
