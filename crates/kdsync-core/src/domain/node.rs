//! Identifiers, replica sides and the two item representations
//!
//! A [`SnapshotItem`] describes one entry of a live replica tree, while a
//! [`DbNode`] is the persisted record of the last state both replicas agreed on.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Timestamps are whole seconds since the Unix epoch.
pub type SyncTime = i64;

/// Primary key of a row in the sync database.
pub type DbNodeId = i64;

// ============================================================================
// NodeId
// ============================================================================

/// Opaque replica-local identifier of a file or directory
///
/// On the local side this is the inode/file id rendered as a string, on the
/// remote side the server-issued file id. An empty id means "unset", e.g. the
/// parent of a snapshot root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a NodeId from any string-like value
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the "unset" id
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for NodeId {
    fn from(v: u64) -> Self {
        Self(v.to_string())
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

// ============================================================================
// ReplicaSide / NodeType
// ============================================================================

/// One of the two sides of synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaSide {
    /// The local filesystem
    Local,
    /// The remote drive
    Remote,
}

impl ReplicaSide {
    /// Both sides, local first
    pub const ALL: [ReplicaSide; 2] = [ReplicaSide::Local, ReplicaSide::Remote];

    /// The opposite side
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            ReplicaSide::Local => ReplicaSide::Remote,
            ReplicaSide::Remote => ReplicaSide::Local,
        }
    }
}

impl Display for ReplicaSide {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaSide::Local => f.write_str("local"),
            ReplicaSide::Remote => f.write_str("remote"),
        }
    }
}

/// Kind of filesystem object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Directory,
}

impl NodeType {
    /// Stable string used by the sync database
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::File => "file",
            NodeType::Directory => "dir",
        }
    }

    /// Parses the database representation; anything but `dir` is a file
    #[must_use]
    pub fn from_db(s: &str) -> Self {
        if s == "dir" {
            NodeType::Directory
        } else {
            NodeType::File
        }
    }
}

// ============================================================================
// SnapshotItem
// ============================================================================

/// One entry of a replica snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    pub created_at: SyncTime,
    pub last_modified: SyncTime,
    /// Bytes; only meaningful for files
    pub size: i64,
    pub is_link: bool,
    /// Remote only; always `true` on the local side
    pub can_write: bool,
}

impl SnapshotItem {
    /// Creates an item with zeroed timestamps and size
    pub fn new(
        id: impl Into<NodeId>,
        parent_id: impl Into<NodeId>,
        name: impl Into<String>,
        node_type: NodeType,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.into(),
            name: name.into(),
            node_type,
            created_at: 0,
            last_modified: 0,
            size: 0,
            is_link: false,
            can_write: true,
        }
    }

    /// Sets both timestamps
    #[must_use]
    pub fn with_times(mut self, created_at: SyncTime, last_modified: SyncTime) -> Self {
        self.created_at = created_at;
        self.last_modified = last_modified;
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn with_link(mut self, is_link: bool) -> Self {
        self.is_link = is_link;
        self
    }

    #[must_use]
    pub fn with_can_write(mut self, can_write: bool) -> Self {
        self.can_write = can_write;
        self
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Directory
    }
}

// ============================================================================
// DbNode
// ============================================================================

/// A row of the sync database: the last state both replicas agreed on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbNode {
    pub db_id: DbNodeId,
    /// `None` only for the sync root
    pub parent_db_id: Option<DbNodeId>,
    pub name_local: String,
    pub name_remote: String,
    pub node_id_local: Option<NodeId>,
    pub node_id_remote: Option<NodeId>,
    pub created: Option<SyncTime>,
    pub last_modified_local: Option<SyncTime>,
    pub last_modified_remote: Option<SyncTime>,
    pub node_type: NodeType,
    pub size: i64,
}

impl DbNode {
    /// Id of this node on the given side, if that side has replicated it
    #[must_use]
    pub fn node_id(&self, side: ReplicaSide) -> Option<&NodeId> {
        match side {
            ReplicaSide::Local => self.node_id_local.as_ref(),
            ReplicaSide::Remote => self.node_id_remote.as_ref(),
        }
    }

    #[must_use]
    pub fn name(&self, side: ReplicaSide) -> &str {
        match side {
            ReplicaSide::Local => &self.name_local,
            ReplicaSide::Remote => &self.name_remote,
        }
    }

    #[must_use]
    pub fn last_modified(&self, side: ReplicaSide) -> Option<SyncTime> {
        match side {
            ReplicaSide::Local => self.last_modified_local,
            ReplicaSide::Remote => self.last_modified_remote,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_side_other_is_involutive() {
        for side in ReplicaSide::ALL {
            assert_eq!(side.other().other(), side);
            assert_ne!(side.other(), side);
        }
    }

    #[test]
    fn node_type_db_representation() {
        assert_eq!(NodeType::from_db(NodeType::Directory.as_str()), NodeType::Directory);
        assert_eq!(NodeType::from_db("file"), NodeType::File);
        assert_eq!(NodeType::from_db("anything"), NodeType::File);
    }

    #[test]
    fn db_node_side_accessors() {
        let node = DbNode {
            db_id: 7,
            parent_db_id: Some(1),
            name_local: "a.txt".into(),
            name_remote: "A.txt".into(),
            node_id_local: Some(NodeId::new("L1")),
            node_id_remote: None,
            created: Some(10),
            last_modified_local: Some(20),
            last_modified_remote: Some(30),
            node_type: NodeType::File,
            size: 3,
        };
        assert_eq!(node.node_id(ReplicaSide::Local), Some(&NodeId::new("L1")));
        assert_eq!(node.node_id(ReplicaSide::Remote), None);
        assert_eq!(node.name(ReplicaSide::Remote), "A.txt");
        assert_eq!(node.last_modified(ReplicaSide::Remote), Some(30));
        assert!(!node.is_dir());
    }

    #[test]
    fn node_id_serializes_transparently() {
        let json = serde_json::to_string(&NodeId::new("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
        assert!(NodeId::default().is_empty());
        assert_eq!(NodeId::from(42u64).as_str(), "42");
    }
}
