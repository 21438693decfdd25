//! # Organize Core
//!
//! This crate provides the tenant-scoped organization hierarchy engine:
//! typed nodes, the nesting rules between them, ancestor chains, and the
//! members attached to positions.
//!
//! ## Overview
//!
//! The organize-core crate handles:
//! - **Nodes**: Organizations, departments and positions in one table
//! - **Validation**: Nesting rules checked before any write
//! - **Trees**: Ancestor chains and flat listings, bounded against bad data
//! - **Membership**: Users attached to positions through an external directory
//! - **Audit**: One record per mutation, handed to a fire-and-forget sink
//!
//! ## Architecture
//!
//! ```text
//! HierarchyService ──┬─ NodeValidator
//!                    ├─ TreeResolver ──┐
//!                    └────────────────┴─ NodeStore
//! MembershipManager ─┬─ NodeStore
//!                    ├─ MembershipStore
//!                    └─ UserDirectory
//! (both) ───────────── AuditSink
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use organize_core::{
//!     HierarchyService, MemoryAuditSink, MemoryStore, NodePayload, NodeType, Operator,
//!     UuidV7Generator,
//! };
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! # async fn run() -> organize_core::HierarchyResult<()> {
//! let store = Arc::new(MemoryStore::new());
//! let service = HierarchyService::new(
//!     store,
//!     Arc::new(UuidV7Generator),
//!     Arc::new(MemoryAuditSink::new()),
//! );
//! let operator = Operator::new(Uuid::now_v7(), Uuid::now_v7(), "admin");
//!
//! let hq = service.create_node(&operator, NodePayload::new("HQ")).await?;
//! let eng = service
//!     .create_node(
//!         &operator,
//!         NodePayload::new("Engineering")
//!             .with_parent(hq)
//!             .with_type(NodeType::Department),
//!     )
//!     .await?;
//!
//! let chain = service.ancestor_chain(eng).await?;
//! assert_eq!(chain.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod error;
pub mod hierarchy;
pub mod membership;
pub mod memory;
pub mod node;
pub mod page;
pub mod store;
pub mod tree;
pub mod validator;

// Re-export main types for convenience
pub use audit::{AuditRecord, AuditSink, MemoryAuditSink, NoopAuditSink, OperationKind, Operator, BUSINESS};
pub use error::{HierarchyError, HierarchyResult, StoreError, StoreResult};
pub use hierarchy::HierarchyService;
pub use membership::{MembershipEdge, MembershipManager, MemoryUserDirectory, UserDirectory, UserSummary};
pub use memory::MemoryStore;
pub use node::{
    ChainEntry, IdGenerator, Node, NodePatch, NodePayload, NodeSummary, NodeType, UuidV7Generator,
};
pub use page::{Page, PageRequest};
pub use store::{AuditStore, InsertOutcome, MembershipStore, NodeStore};
pub use tree::{TreeResolver, DEFAULT_MAX_DEPTH};
pub use validator::NodeValidator;
