//! Inferred filesystem operations
//!
//! An [`FsOperation`] is produced by one reconciliation pass and handed to
//! the next pipeline stage. Operations are grouped per replica side in an
//! [`FsOperationSet`]; they are never persisted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::node::{NodeId, NodeType, ReplicaSide, SyncTime};

/// Kind of change detected since the last agreed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Edit,
    Move,
    Delete,
}

/// A single inferred change on one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsOperation {
    pub op_type: OperationType,
    pub node_id: NodeId,
    pub object_type: NodeType,
    pub created_at: SyncTime,
    pub last_modified: SyncTime,
    pub size: i64,
    /// Path relative to the sync root; for a Move, the origin path
    pub path: PathBuf,
    /// Only set for [`OperationType::Move`]
    pub destination_path: Option<PathBuf>,
}

impl FsOperation {
    /// Builds a non-move operation
    pub fn new(
        op_type: OperationType,
        node_id: NodeId,
        object_type: NodeType,
        created_at: SyncTime,
        last_modified: SyncTime,
        size: i64,
        path: PathBuf,
    ) -> Self {
        Self {
            op_type,
            node_id,
            object_type,
            created_at,
            last_modified,
            size,
            path,
            destination_path: None,
        }
    }

    /// Builds a Move from `path` to `destination_path`
    pub fn moved(
        node_id: NodeId,
        object_type: NodeType,
        created_at: SyncTime,
        last_modified: SyncTime,
        size: i64,
        path: PathBuf,
        destination_path: PathBuf,
    ) -> Self {
        Self {
            op_type: OperationType::Move,
            node_id,
            object_type,
            created_at,
            last_modified,
            size,
            path,
            destination_path: Some(destination_path),
        }
    }
}

/// The operations detected for one replica during one pass
///
/// Operations keep their insertion order. A secondary index by node id
/// allows constant-time "has this node already got an op of type X" checks.
#[derive(Debug, Clone)]
pub struct FsOperationSet {
    side: ReplicaSide,
    ops: Vec<FsOperation>,
    by_node: HashMap<NodeId, Vec<usize>>,
}

impl FsOperationSet {
    pub fn new(side: ReplicaSide) -> Self {
        Self {
            side,
            ops: Vec::new(),
            by_node: HashMap::new(),
        }
    }

    #[must_use]
    pub fn side(&self) -> ReplicaSide {
        self.side
    }

    pub fn insert_op(&mut self, op: FsOperation) {
        self.by_node
            .entry(op.node_id.clone())
            .or_default()
            .push(self.ops.len());
        self.ops.push(op);
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.by_node.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FsOperation> {
        self.ops.iter()
    }

    /// All operations of the given type, in insertion order
    pub fn ops_of_type(&self, op_type: OperationType) -> impl Iterator<Item = &FsOperation> {
        self.ops.iter().filter(move |op| op.op_type == op_type)
    }

    /// Operations recorded for one node
    pub fn ops_for_node<'a>(&'a self, node_id: &NodeId) -> impl Iterator<Item = &'a FsOperation> {
        self.by_node
            .get(node_id)
            .into_iter()
            .flat_map(move |indexes| indexes.iter().map(move |&i| &self.ops[i]))
    }

    /// Returns the first operation of `op_type` recorded for `node_id`
    #[must_use]
    pub fn find_op(&self, node_id: &NodeId, op_type: OperationType) -> Option<&FsOperation> {
        self.ops_for_node(node_id).find(|op| op.op_type == op_type)
    }

    /// Returns `true` if a Delete of a directory covers `path`
    #[must_use]
    pub fn has_delete_covering(&self, path: &Path) -> bool {
        self.ops_of_type(OperationType::Delete)
            .any(|op| op.object_type == NodeType::Directory && path.starts_with(&op.path))
    }

    /// Removes every operation matching `predicate` and returns how many were dropped
    pub fn remove_ops_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&FsOperation) -> bool,
    {
        let before = self.ops.len();
        self.ops.retain(|op| !predicate(op));
        let removed = before - self.ops.len();
        if removed > 0 {
            self.reindex();
        }
        removed
    }

    fn reindex(&mut self) {
        self.by_node.clear();
        for (i, op) in self.ops.iter().enumerate() {
            self.by_node.entry(op.node_id.clone()).or_default().push(i);
        }
    }
}

impl<'a> IntoIterator for &'a FsOperationSet {
    type Item = &'a FsOperation;
    type IntoIter = std::slice::Iter<'a, FsOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(id: &str, path: &str, node_type: NodeType) -> FsOperation {
        FsOperation::new(
            OperationType::Create,
            NodeId::new(id),
            node_type,
            0,
            0,
            0,
            PathBuf::from(path),
        )
    }

    #[test]
    fn find_op_uses_node_index() {
        let mut set = FsOperationSet::new(ReplicaSide::Local);
        set.insert_op(create("1", "a", NodeType::File));
        set.insert_op(FsOperation::moved(
            NodeId::new("1"),
            NodeType::File,
            0,
            0,
            0,
            PathBuf::from("a"),
            PathBuf::from("b"),
        ));

        assert_eq!(set.len(), 2);
        assert!(set.find_op(&NodeId::new("1"), OperationType::Move).is_some());
        assert!(set.find_op(&NodeId::new("1"), OperationType::Delete).is_none());
        assert!(set.find_op(&NodeId::new("2"), OperationType::Create).is_none());
    }

    #[test]
    fn remove_ops_where_keeps_index_consistent() {
        let mut set = FsOperationSet::new(ReplicaSide::Remote);
        set.insert_op(create("1", "big", NodeType::Directory));
        set.insert_op(create("2", "big/child", NodeType::File));
        set.insert_op(create("3", "other", NodeType::File));

        let removed = set.remove_ops_where(|op| op.path.starts_with("big"));
        assert_eq!(removed, 2);
        assert_eq!(set.len(), 1);
        assert!(set.find_op(&NodeId::new("3"), OperationType::Create).is_some());
        assert!(set.find_op(&NodeId::new("2"), OperationType::Create).is_none());
    }

    #[test]
    fn delete_of_directory_covers_descendants() {
        let mut set = FsOperationSet::new(ReplicaSide::Local);
        set.insert_op(FsOperation::new(
            OperationType::Delete,
            NodeId::new("d"),
            NodeType::Directory,
            0,
            0,
            0,
            PathBuf::from("dir"),
        ));
        assert!(set.has_delete_covering(Path::new("dir/file.txt")));
        assert!(!set.has_delete_covering(Path::new("dir2/file.txt")));
    }
}
