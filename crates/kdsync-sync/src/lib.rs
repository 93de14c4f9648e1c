//! kdsync Sync - Change detection and reconciliation engine
//!
//! Provides:
//! - In-memory replica snapshots with copy-on-write views
//! - Name-pattern exclusion and persisted node-list caches
//! - Remote snapshot maintenance over a cursor/long-poll protocol
//! - Local snapshot maintenance from filesystem events
//! - The reconciliation pass computing Create/Edit/Move/Delete operations
//!
//! ## Modules
//!
//! - [`snapshot`] - `Snapshot` tree and its shared `LiveSnapshot` owner
//! - [`exclusion`] - Exclusion template matching
//! - [`sync_nodes`] - Per-profile cache of blacklist/whitelist/undecided node sets
//! - [`compute`] - The reconciliation pass
//! - [`remote_observer`] - Remote snapshot maintenance
//! - [`local_observer`] - Local snapshot maintenance
//! - [`io_helper`] - Filesystem probes (existence, rights, hidden flag)
//! - [`error_collector`] - De-duplicating issue sink
//! - [`control`] - Stop and pause signals shared by workers

pub mod compute;
pub mod control;
pub mod error_collector;
pub mod exclusion;
pub mod io_helper;
pub mod local_observer;
pub mod remote_observer;
pub mod snapshot;
pub mod sync_nodes;

pub use compute::{ComputeFsOperationWorker, ComputeOutput};
pub use control::WorkerControl;
pub use error_collector::ErrorCollector;
pub use exclusion::{ExclusionTemplate, ExclusionTemplateCache};
pub use local_observer::LocalFileSystemObserver;
pub use remote_observer::RemoteFileSystemObserver;
pub use snapshot::{LiveSnapshot, Snapshot, SnapshotError};
pub use sync_nodes::SyncNodeCache;
