//! Domain types of the change-detection engine
//!
//! This module contains the plain data exchanged between the observers,
//! the snapshots and the operation-computation worker:
//! - Identifiers and replica sides
//! - Snapshot items and persisted sync-database rows
//! - Inferred filesystem operations and their per-side sets
//! - Exit codes/causes and user-facing sync issues

pub mod errors;
pub mod issue;
pub mod node;
pub mod operation;
pub mod sync_node;

// Re-export commonly used types
pub use errors::{ExitCause, ExitCode, WorkerError};
pub use issue::{CancelType, InconsistencyType, IssueLevel, SyncIssue};
pub use node::{DbNode, DbNodeId, NodeId, NodeType, ReplicaSide, SnapshotItem, SyncTime};
pub use operation::{FsOperation, FsOperationSet, OperationType};
pub use sync_node::SyncNodeType;
