//! Replica snapshots
//!
//! A [`Snapshot`] is an in-memory tree mirroring one replica: items keyed by
//! id plus a parent → children index. The observer owning a side mutates it
//! through a [`LiveSnapshot`]; the reconciliation pass works on an immutable
//! [`Arc<Snapshot>`] view taken when the pass starts.
//!
//! ## Architecture
//!
//! ```text
//!  RemoteFileSystemObserver ──update()──┐
//!                                       ▼
//!                          LiveSnapshot (Mutex<Arc<Snapshot>>)
//!                                       │
//!                                    view()
//!                                       ▼
//!                    ComputeFsOperationWorker (Arc<Snapshot>)
//! ```
//!
//! `update()` goes through `Arc::make_mut`, so a view handed out earlier is
//! never affected: the first mutation after a view is taken copies the tree.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use kdsync_core::domain::{NodeId, NodeType, ReplicaSide, SnapshotItem, SyncTime};
use thiserror::Error;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

/// Canonical (NFC) form used when comparing names
pub fn normalize_name(name: &str) -> String {
    name.nfc().collect()
}

/// Errors reported by snapshot mutations and path resolution
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// The item's parent id is empty or equal to its own id
    #[error("Invalid parent for item {0}")]
    InvalidParent(NodeId),

    /// An ancestor of the item is missing from the snapshot
    #[error("Broken ancestry for item {0}")]
    BrokenPath(NodeId),

    /// An ancestor name cannot be represented as a relative path segment;
    /// the subtree must be skipped rather than treated as an error
    #[error("Unrepresentable path for item {0}")]
    Unrepresentable(NodeId),
}

// ============================================================================
// Snapshot
// ============================================================================

/// In-memory tree of one replica's items
#[derive(Debug, Clone)]
pub struct Snapshot {
    side: ReplicaSide,
    root_id: NodeId,
    items: HashMap<NodeId, SnapshotItem>,
    children: HashMap<NodeId, BTreeSet<NodeId>>,
    valid: bool,
    revision: u64,
}

impl Snapshot {
    /// Creates an invalid snapshot holding only its root
    pub fn new(side: ReplicaSide, root_id: impl Into<NodeId>) -> Self {
        let mut snapshot = Self {
            side,
            root_id: root_id.into(),
            items: HashMap::new(),
            children: HashMap::new(),
            valid: false,
            revision: 0,
        };
        snapshot.insert_root();
        snapshot
    }

    fn insert_root(&mut self) {
        let root = SnapshotItem::new(
            self.root_id.clone(),
            NodeId::default(),
            String::new(),
            NodeType::Directory,
        );
        self.items.insert(self.root_id.clone(), root);
    }

    /// Drops every item but the root and marks the snapshot invalid
    pub fn init(&mut self) {
        self.items.clear();
        self.children.clear();
        self.insert_root();
        self.valid = false;
        self.revision += 1;
    }

    pub fn side(&self) -> ReplicaSide {
        self.side
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Counter bumped by every change visible from the root
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Number of items, root and placeholder parents included
    pub fn nb_items(&self) -> usize {
        self.items.len()
    }

    /// Inserts or overwrites an item, relinking it under its parent
    ///
    /// An unknown parent is created as an empty placeholder, leaving the
    /// item orphan until the parent itself is inserted. A sibling with the
    /// same normalized name but another id is removed first.
    ///
    /// Returns `Ok(true)` when the item was not present before.
    pub fn update_item(&mut self, item: SnapshotItem) -> Result<bool, SnapshotError> {
        if item.parent_id.is_empty() || item.parent_id == item.id {
            warn!(id = %item.id, parent = %item.parent_id, "Rejecting snapshot item with invalid parent");
            return Err(SnapshotError::InvalidParent(item.id));
        }

        let normalized = normalize_name(&item.name);
        let clashing = self.children.get(&item.parent_id).and_then(|siblings| {
            siblings.iter().find(|sibling| {
                **sibling != item.id
                    && self
                        .items
                        .get(*sibling)
                        .is_some_and(|s| normalize_name(&s.name) == normalized)
            })
        });
        if let Some(clashing) = clashing.cloned() {
            debug!(
                name = %item.name,
                old_id = %clashing,
                new_id = %item.id,
                "Replacing item with the same name in parent"
            );
            self.remove_item(&clashing);
        }

        let previous_parent = self.items.get(&item.id).map(|p| p.parent_id.clone());
        let inserted = previous_parent.is_none();
        let parent_changed = match &previous_parent {
            None => true,
            Some(previous) => item.id != self.root_id && *previous != item.parent_id,
        };

        if parent_changed {
            if let Some(previous) = &previous_parent {
                if let Some(siblings) = self.children.get_mut(previous) {
                    siblings.remove(&item.id);
                }
            }
            if !self.items.contains_key(&item.parent_id) {
                debug!(parent = %item.parent_id, "Parent does not exist yet, creating a placeholder");
                let placeholder = SnapshotItem::new(
                    item.parent_id.clone(),
                    NodeId::default(),
                    String::new(),
                    NodeType::Directory,
                );
                self.items.insert(item.parent_id.clone(), placeholder);
            }
            self.children
                .entry(item.parent_id.clone())
                .or_default()
                .insert(item.id.clone());
        }

        let id = item.id.clone();
        self.items.insert(id.clone(), item);
        if parent_changed || !self.is_orphan(&id) {
            self.revision += 1;
        }
        Ok(inserted)
    }

    /// Removes an item and its whole subtree
    ///
    /// Removing an unknown id succeeds; only an empty id is rejected.
    pub fn remove_item(&mut self, id: &NodeId) -> bool {
        if id.is_empty() {
            return false;
        }
        let Some(item) = self.items.get(id) else {
            return true;
        };
        let parent_id = item.parent_id.clone();

        if !self.is_orphan(id) {
            self.revision += 1;
        }

        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(children) = self.children.remove(&current) {
                stack.extend(children);
            }
            if current != self.root_id {
                self.items.remove(&current);
            }
        }

        if let Some(siblings) = self.children.get_mut(&parent_id) {
            siblings.remove(id);
        }
        true
    }

    pub fn item(&self, id: &NodeId) -> Option<&SnapshotItem> {
        self.items.get(id)
    }

    /// Present and attached to the root
    pub fn exists(&self, id: &NodeId) -> bool {
        self.items.contains_key(id) && !self.is_orphan(id)
    }

    pub fn node_type(&self, id: &NodeId) -> Option<NodeType> {
        self.items.get(id).map(|i| i.node_type)
    }

    pub fn name(&self, id: &NodeId) -> Option<&str> {
        self.items.get(id).map(|i| i.name.as_str())
    }

    pub fn parent_id(&self, id: &NodeId) -> Option<&NodeId> {
        self.items.get(id).map(|i| &i.parent_id)
    }

    pub fn created_at(&self, id: &NodeId) -> Option<SyncTime> {
        self.items.get(id).map(|i| i.created_at)
    }

    pub fn last_modified(&self, id: &NodeId) -> Option<SyncTime> {
        self.items.get(id).map(|i| i.last_modified)
    }

    pub fn is_link(&self, id: &NodeId) -> bool {
        self.items.get(id).is_some_and(|i| i.is_link)
    }

    /// Write permission; unknown items are considered writable
    pub fn can_write(&self, id: &NodeId) -> bool {
        self.items.get(id).map_or(true, |i| i.can_write)
    }

    /// File size, or the recursive sum of descendant file sizes for a directory
    pub fn size(&self, id: &NodeId) -> i64 {
        let Some(item) = self.items.get(id) else {
            return 0;
        };
        if !item.is_dir() {
            return item.size;
        }

        let mut total = 0;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for child in self.children.get(current).into_iter().flatten() {
                match self.items.get(child) {
                    Some(c) if c.is_dir() => stack.push(child),
                    Some(c) => total += c.size,
                    None => {}
                }
            }
        }
        total
    }

    /// Relative path of an item, built by walking its ancestors to the root
    pub fn path(&self, id: &NodeId) -> Result<PathBuf, SnapshotError> {
        if *id == self.root_id {
            return Ok(PathBuf::new());
        }

        let mut names = Vec::new();
        let mut current = id;
        loop {
            let Some(item) = self.items.get(current) else {
                return Err(SnapshotError::BrokenPath(id.clone()));
            };
            names.push(item.name.as_str());
            if item.parent_id == self.root_id {
                break;
            }
            // A cycle cannot reach the root
            if names.len() > self.items.len() {
                return Err(SnapshotError::BrokenPath(id.clone()));
            }
            current = &item.parent_id;
        }

        let mut path = PathBuf::new();
        for name in names.iter().rev() {
            if !is_plain_segment(name) {
                return Err(SnapshotError::Unrepresentable(id.clone()));
            }
            path.push(name);
        }
        Ok(path)
    }

    /// `true` if the parent chain does not end at the root
    pub fn is_orphan(&self, id: &NodeId) -> bool {
        if *id == self.root_id {
            return false;
        }
        let mut current = id;
        for _ in 0..=self.items.len() {
            match self.items.get(current) {
                Some(item) if item.parent_id == self.root_id => return false,
                Some(item) if !item.parent_id.is_empty() => current = &item.parent_id,
                _ => return true,
            }
        }
        true
    }

    /// `true` if `ancestor_id` appears on the parent chain of `id`
    pub fn is_ancestor(&self, id: &NodeId, ancestor_id: &NodeId) -> bool {
        if *id == self.root_id {
            return false;
        }
        let mut current = id;
        for _ in 0..=self.items.len() {
            let Some(parent) = self.parent_id(current) else {
                return false;
            };
            if parent == ancestor_id {
                return true;
            }
            if *parent == self.root_id || parent.is_empty() {
                return false;
            }
            current = parent;
        }
        false
    }

    /// Resolves a relative path to an id by matching normalized child names
    pub fn item_id(&self, path: &Path) -> Option<NodeId> {
        let mut current = self.root_id.clone();
        for component in path.components() {
            let Component::Normal(segment) = component else {
                continue;
            };
            let wanted = normalize_name(&segment.to_string_lossy());
            let next = self
                .children
                .get(&current)?
                .iter()
                .find(|child| {
                    self.items
                        .get(*child)
                        .is_some_and(|c| normalize_name(&c.name) == wanted)
                })?
                .clone();
            current = next;
        }
        Some(current)
    }

    pub fn path_exists(&self, path: &Path) -> bool {
        self.item_id(path).is_some()
    }

    pub fn ids(&self) -> HashSet<NodeId> {
        self.items.keys().cloned().collect()
    }

    /// Children of `id` in id order
    pub fn children_ids(&self, id: &NodeId) -> Vec<NodeId> {
        self.children
            .get(id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// A name that maps onto exactly one normal path component
fn is_plain_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains('/')
}

// ============================================================================
// LiveSnapshot
// ============================================================================

/// Shared owner of one side's snapshot
///
/// Writers go through [`LiveSnapshot::update`]; readers take a cheap
/// point-in-time [`LiveSnapshot::view`].
#[derive(Debug)]
pub struct LiveSnapshot {
    inner: Mutex<Arc<Snapshot>>,
}

impl LiveSnapshot {
    pub fn new(side: ReplicaSide, root_id: impl Into<NodeId>) -> Self {
        Self {
            inner: Mutex::new(Arc::new(Snapshot::new(side, root_id))),
        }
    }

    /// Immutable view of the current state
    pub fn view(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Mutates the snapshot, copying it first if views are outstanding
    pub fn update<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut guard))
    }

    /// Reads the current state without taking a view
    pub fn read<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> R {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn is_valid(&self) -> bool {
        self.read(Snapshot::is_valid)
    }

    pub fn set_valid(&self, valid: bool) {
        self.update(|s| s.set_valid(valid));
    }

    /// Resets to the root only; the snapshot stays invalid until rebuilt
    pub fn init(&self) {
        self.update(Snapshot::init);
    }
}
