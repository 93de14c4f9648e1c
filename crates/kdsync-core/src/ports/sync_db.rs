//! Sync database port (driven/secondary port)
//!
//! The sync database is the authoritative record of the last state both
//! replicas agreed on. It is written by the propagation stage; the engine
//! only reads nodes, plus the per-profile node-id lists and the remote
//! listing cursor which it owns.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific;
//!   callers map any failure to a database-access exit cause.
//! - "Not found" is never an error: lookups return `Option`.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::domain::{DbNode, DbNodeId, NodeId, ReplicaSide, SyncNodeType, SyncTime};

/// Persisted position in the remote change stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingCursor {
    pub cursor: String,
    /// When the cursor was obtained
    pub timestamp: SyncTime,
}

/// Port trait for the sync database of one sync profile
#[async_trait::async_trait]
pub trait ISyncDb: Send + Sync {
    // --- Nodes ---

    /// The row representing the sync root
    async fn root_node(&self) -> anyhow::Result<DbNode>;

    /// Every row id, root included
    async fn db_ids(&self) -> anyhow::Result<Vec<DbNodeId>>;

    async fn node(&self, db_id: DbNodeId) -> anyhow::Result<Option<DbNode>>;

    /// Path relative to the sync root, built from the names recorded for `side`
    async fn path(&self, db_id: DbNodeId, side: ReplicaSide) -> anyhow::Result<Option<PathBuf>>;

    /// Row id of the node known as `node_id` on `side`
    async fn db_id(&self, side: ReplicaSide, node_id: &NodeId)
        -> anyhow::Result<Option<DbNodeId>>;

    /// Id on `side` of the parent of the node known as `node_id` on `side`;
    /// `None` for the root or an unknown node
    async fn parent(&self, side: ReplicaSide, node_id: &NodeId) -> anyhow::Result<Option<NodeId>>;

    /// Given an id on `side`, the id of the same node on the other side
    async fn corresponding_node_id(
        &self,
        side: ReplicaSide,
        node_id: &NodeId,
    ) -> anyhow::Result<Option<NodeId>>;

    /// Inserts a row; `node.db_id` is ignored and the new id is returned
    async fn insert_node(&self, node: &DbNode) -> anyhow::Result<DbNodeId>;

    /// Overwrites the row `node.db_id`; returns `false` if it does not exist
    async fn update_node(&self, node: &DbNode) -> anyhow::Result<bool>;

    /// Deletes a row and its descendants; returns `false` if it does not exist
    async fn delete_node(&self, db_id: DbNodeId) -> anyhow::Result<bool>;

    // --- Node-id lists ---

    async fn select_all_sync_nodes(
        &self,
        node_type: SyncNodeType,
    ) -> anyhow::Result<HashSet<NodeId>>;

    /// Replaces the whole list of `node_type`
    async fn update_all_sync_nodes(
        &self,
        node_type: SyncNodeType,
        ids: &HashSet<NodeId>,
    ) -> anyhow::Result<()>;

    // --- Remote listing cursor ---

    async fn listing_cursor(&self) -> anyhow::Result<Option<ListingCursor>>;

    async fn set_listing_cursor(&self, cursor: &str, timestamp: SyncTime) -> anyhow::Result<()>;
}
