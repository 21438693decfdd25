//! Error types for hierarchy operations
//!
//! This module defines the errors surfaced by the hierarchy engine and the
//! storage collaborators behind it. Validation errors are returned to the
//! caller immediately; store errors may be transient and are the only ones
//! worth retrying on the asynchronous ingestion path.

use thiserror::Error;
use uuid::Uuid;

use crate::node::NodeType;

/// Storage error types.
///
/// Stores are expected to be transactional: constraint violations are
/// detected inside the same critical section that performs the write.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing store cannot be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Referenced parent row does not exist
    #[error("Foreign key violation: parent {parent_id} does not exist")]
    ForeignKey {
        /// The missing parent id
        parent_id: Uuid,
    },

    /// Row is still referenced by child rows
    #[error("Node {id} is still referenced by {children} child node(s)")]
    HasDependents {
        /// Node that was to be removed
        id: Uuid,
        /// Number of children referencing it
        children: u64,
    },

    /// Row to update does not exist
    #[error("Row not found: {0}")]
    Missing(Uuid),

    /// Primary key already taken by a different write path
    #[error("Duplicate primary key: {0}")]
    Duplicate(Uuid),

    /// Row could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Hierarchy error types.
///
/// These cover nesting-rule violations, lookups of unknown nodes, membership
/// selection problems and malformed trees found while walking parent links.
#[derive(Debug, Error)]
pub enum HierarchyError {
    /// Node type outside the known levels
    #[error("Invalid node type: {0}")]
    InvalidType(i32),

    /// Node name is missing or blank
    #[error("Node name must not be empty")]
    EmptyName,

    /// Parent id does not resolve to a node of the tenant
    #[error("Parent node not found: {0}")]
    UnknownParent(Uuid),

    /// Parent is a position, which is always a leaf
    #[error("Node {0} is a position and cannot have children")]
    TerminalNode(Uuid),

    /// Position placed directly under an organization
    #[error("Positions must be placed under a department, not directly under organization {0}")]
    SkipLevel(Uuid),

    /// Child type ranks above its parent type
    #[error("Cannot place a node of type {child} under a node of type {parent}")]
    TypeRegression {
        /// Parent node type
        parent: NodeType,
        /// Requested child type
        child: NodeType,
    },

    /// Node does not exist
    #[error("Node not found: {0}")]
    NotFound(Uuid),

    /// Node still has children and cannot be removed
    #[error("Node {id} still has {count} child node(s)")]
    HasChildren {
        /// Node that was to be removed
        id: Uuid,
        /// Number of direct children
        count: u64,
    },

    /// Member operation called without any user ids
    #[error("No members selected")]
    EmptySelection,

    /// Members can only be attached to positions
    #[error("Node {0} is not a position")]
    NotAPosition(Uuid),

    /// Low-level insert payload lacks a required field
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Parent links loop back onto an already visited node
    #[error("Cycle detected at node {0}")]
    CycleDetected(Uuid),

    /// Parent walk went deeper than the configured bound
    #[error("Hierarchy walk exceeded maximum depth of {0}")]
    DepthExceeded(usize),

    /// Underlying store failure
    #[error("Store error: {0}")]
    Store(#[source] StoreError),
}

/// Result type for hierarchy operations.
pub type HierarchyResult<T> = Result<T, HierarchyError>;

impl From<StoreError> for HierarchyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ForeignKey { parent_id } => HierarchyError::UnknownParent(parent_id),
            StoreError::HasDependents { id, children } => HierarchyError::HasChildren {
                id,
                count: children,
            },
            StoreError::Missing(id) => HierarchyError::NotFound(id),
            other => HierarchyError::Store(other),
        }
    }
}

impl HierarchyError {
    /// Check if this error comes from infrastructure rather than input.
    ///
    /// Only server errors are worth retrying; everything else will fail
    /// the same way on every attempt.
    pub fn is_server_error(&self) -> bool {
        matches!(self, HierarchyError::Store(_))
    }

    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            HierarchyError::InvalidType(_) => "INVALID_TYPE",
            HierarchyError::EmptyName => "EMPTY_NAME",
            HierarchyError::UnknownParent(_) => "UNKNOWN_PARENT",
            HierarchyError::TerminalNode(_) => "TERMINAL_NODE",
            HierarchyError::SkipLevel(_) => "SKIP_LEVEL",
            HierarchyError::TypeRegression { .. } => "TYPE_REGRESSION",
            HierarchyError::NotFound(_) => "NOT_FOUND",
            HierarchyError::HasChildren { .. } => "HAS_CHILDREN",
            HierarchyError::EmptySelection => "EMPTY_SELECTION",
            HierarchyError::NotAPosition(_) => "NOT_A_POSITION",
            HierarchyError::MissingField(_) => "MISSING_FIELD",
            HierarchyError::CycleDetected(_) => "CYCLE_DETECTED",
            HierarchyError::DepthExceeded(_) => "DEPTH_EXCEEDED",
            HierarchyError::Store(_) => "STORE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_domain_errors() {
        let parent_id = Uuid::now_v7();
        let err: HierarchyError = StoreError::ForeignKey { parent_id }.into();
        assert!(matches!(err, HierarchyError::UnknownParent(id) if id == parent_id));

        let id = Uuid::now_v7();
        let err: HierarchyError = StoreError::HasDependents { id, children: 2 }.into();
        assert!(matches!(err, HierarchyError::HasChildren { count: 2, .. }));

        let err: HierarchyError = StoreError::Missing(id).into();
        assert_eq!(err.error_code(), "NOT_FOUND");

        let err: HierarchyError = StoreError::Unavailable("down".to_string()).into();
        assert!(err.is_server_error());
    }

    #[test]
    fn test_validation_errors_are_not_server_errors() {
        assert!(!HierarchyError::EmptySelection.is_server_error());
        assert!(!HierarchyError::SkipLevel(Uuid::now_v7()).is_server_error());
        assert_eq!(
            HierarchyError::CycleDetected(Uuid::now_v7()).error_code(),
            "CYCLE_DETECTED"
        );
    }

    #[test]
    fn test_type_regression_message() {
        let err = HierarchyError::TypeRegression {
            parent: NodeType::Department,
            child: NodeType::Organization,
        };
        assert_eq!(
            err.to_string(),
            "Cannot place a node of type organization under a node of type department"
        );
    }
}
