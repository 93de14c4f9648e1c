//! Reconciliation pass
//!
//! [`ComputeFsOperationWorker`] diffs the sync database (the last state both
//! replicas agreed on) against point-in-time views of the two live
//! snapshots and produces one [`FsOperationSet`] per side.
//!
//! ## Phases
//!
//! 1. **Database tree**: every row is looked up in both snapshots. A missing
//!    id yields a Delete (after checking on disk that the local item is
//!    really gone), a changed timestamp an Edit, a changed name or parent a
//!    Move. Directories are handled before files.
//! 2. **Snapshot trees**: every reachable snapshot id unknown to the
//!    database yields a Create, unless excluded by the unsynced lists,
//!    templates, path length or the big-folder limit.
//!
//! A pass that fails or is stopped returns an error and no operation at all.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use kdsync_core::config::{Config, ParametersConfig};
use kdsync_core::domain::{
    DbNode, ExitCause, ExitCode, FsOperation, FsOperationSet, InconsistencyType, NodeId,
    NodeType, OperationType, ReplicaSide, SyncIssue, SyncNodeType, WorkerError,
};
use kdsync_core::ports::{IErrorSink, ISyncDb};
use tracing::{debug, info, instrument, warn};

use crate::control::WorkerControl;
use crate::exclusion::ExclusionTemplateCache;
use crate::io_helper::{io_err, IoHelper, LocalProbe};
use crate::snapshot::{normalize_name, LiveSnapshot, Snapshot, SnapshotError};
use crate::sync_nodes::SyncNodeCache;

/// Result of one successful pass
#[derive(Debug, Clone)]
pub struct ComputeOutput {
    pub local_ops: FsOperationSet,
    pub remote_ops: FsOperationSet,
    /// Local id → absolute local path of files whose size differs between
    /// replicas although every timestamp agrees; the remote version must be
    /// downloaded again
    pub size_mismatch: HashMap<NodeId, PathBuf>,
}

impl ComputeOutput {
    fn new() -> Self {
        Self {
            local_ops: FsOperationSet::new(ReplicaSide::Local),
            remote_ops: FsOperationSet::new(ReplicaSide::Remote),
            size_mismatch: HashMap::new(),
        }
    }

    pub fn ops(&self, side: ReplicaSide) -> &FsOperationSet {
        match side {
            ReplicaSide::Local => &self.local_ops,
            ReplicaSide::Remote => &self.remote_ops,
        }
    }

    fn ops_mut(&mut self, side: ReplicaSide) -> &mut FsOperationSet {
        match side {
            ReplicaSide::Local => &mut self.local_ops,
            ReplicaSide::Remote => &mut self.remote_ops,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local_ops.is_empty() && self.remote_ops.is_empty() && self.size_mismatch.is_empty()
    }
}

/// Computes the filesystem operations of one sync profile
pub struct ComputeFsOperationWorker {
    sync_db_id: i64,
    local_root: PathBuf,
    parameters: ParametersConfig,
    sync_hidden_files: bool,
    db: Arc<dyn ISyncDb>,
    sync_nodes: Arc<SyncNodeCache>,
    templates: Arc<ExclusionTemplateCache>,
    probe: Arc<dyn LocalProbe>,
    errors: Arc<dyn IErrorSink>,
    control: WorkerControl,
}

impl ComputeFsOperationWorker {
    pub fn new(
        config: &Config,
        db: Arc<dyn ISyncDb>,
        sync_nodes: Arc<SyncNodeCache>,
        templates: Arc<ExclusionTemplateCache>,
        errors: Arc<dyn IErrorSink>,
        control: WorkerControl,
    ) -> Self {
        Self {
            sync_db_id: config.sync.sync_db_id,
            local_root: config.sync.local_root.clone(),
            parameters: config.parameters.clone(),
            sync_hidden_files: config.sync.sync_hidden_files,
            db,
            sync_nodes,
            templates,
            probe: Arc::new(IoHelper),
            errors,
            control,
        }
    }

    /// Replaces the filesystem probe used for local checks
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn LocalProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn control(&self) -> &WorkerControl {
        &self.control
    }

    /// Runs a pass on views of the two live snapshots
    ///
    /// # Errors
    ///
    /// `DataError/InvalidSnapshot` if a snapshot is not valid yet, otherwise
    /// whatever [`Self::compute`] returns.
    pub async fn run(
        &self,
        local: &LiveSnapshot,
        remote: &LiveSnapshot,
    ) -> Result<ComputeOutput, WorkerError> {
        let local = local.view();
        let remote = remote.view();
        for snapshot in [&local, &remote] {
            if !snapshot.is_valid() {
                warn!(side = %snapshot.side(), "Snapshot is not valid, pass skipped");
                return Err(WorkerError::invalid_snapshot());
            }
        }
        self.compute(&local, &remote).await
    }

    /// Runs a pass on the given snapshots
    ///
    /// # Errors
    ///
    /// - `DbError` if the sync database cannot be read or a row is missing
    /// - `DataError/InvalidSnapshot` if a snapshot disagrees with the disk
    ///   or has a broken ancestry; it must be rebuilt
    /// - `SystemError` on local I/O failures
    /// - `OperationCanceled` if stopped
    #[instrument(skip_all, fields(sync_db_id = self.sync_db_id))]
    pub async fn compute(
        &self,
        local: &Snapshot,
        remote: &Snapshot,
    ) -> Result<ComputeOutput, WorkerError> {
        debug!("Reconciliation pass started");
        let start = Instant::now();

        let mut pass = Pass::new(self, local, remote);
        match pass.execute().await {
            Ok(()) => {
                info!(
                    local_ops = pass.output.local_ops.len(),
                    remote_ops = pass.output.remote_ops.len(),
                    size_mismatches = pass.output.size_mismatch.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "FS operation sets generated"
                );
                Ok(pass.output)
            }
            Err(e) => {
                // partial sets are never handed out
                info!(error = %e, "Reconciliation pass aborted, operations discarded");
                Err(e)
            }
        }
    }
}

// ============================================================================
// Per-pass state
// ============================================================================

#[derive(Debug, Default)]
struct UnsyncedLists {
    /// Blacklist ∪ undecided list ∪ remote temporary blacklist
    remote: HashSet<NodeId>,
    remote_tmp: HashSet<NodeId>,
    local_tmp: HashSet<NodeId>,
    white: HashSet<NodeId>,
}

/// Outcome of the on-disk check preceding a local Delete
enum DeleteCheck {
    Ok,
    Excluded,
    NoWritePermission,
}

fn db_err(e: anyhow::Error) -> WorkerError {
    warn!(error = %e, "Sync database access failed");
    WorkerError::db_access()
}

struct Pass<'a> {
    worker: &'a ComputeFsOperationWorker,
    local: &'a Snapshot,
    remote: &'a Snapshot,
    lists: UnsyncedLists,
    /// Per side, directories already queued for deletion (no nested entries)
    dirs_to_delete: HashMap<ReplicaSide, BTreeSet<PathBuf>>,
    output: ComputeOutput,
}

impl<'a> Pass<'a> {
    fn new(worker: &'a ComputeFsOperationWorker, local: &'a Snapshot, remote: &'a Snapshot) -> Self {
        Self {
            worker,
            local,
            remote,
            lists: UnsyncedLists::default(),
            dirs_to_delete: HashMap::new(),
            output: ComputeOutput::new(),
        }
    }

    fn snapshot(&self, side: ReplicaSide) -> &'a Snapshot {
        match side {
            ReplicaSide::Local => self.local,
            ReplicaSide::Remote => self.remote,
        }
    }

    async fn execute(&mut self) -> Result<(), WorkerError> {
        self.refresh_unsynced_lists().await?;

        let (local_ids, remote_ids) = self.explore_db_tree().await?;
        self.prune_covered_deletes();

        self.explore_snapshot_tree(ReplicaSide::Local, &local_ids)
            .await?;
        self.explore_snapshot_tree(ReplicaSide::Remote, &remote_ids)
            .await?;
        Ok(())
    }

    async fn refresh_unsynced_lists(&mut self) -> Result<(), WorkerError> {
        let nodes = &self.worker.sync_nodes;
        let id = self.worker.sync_db_id;

        let mut remote = nodes.sync_nodes(id, SyncNodeType::UndecidedList).await?;
        remote.extend(nodes.sync_nodes(id, SyncNodeType::BlackList).await?);
        let remote_tmp = nodes.sync_nodes(id, SyncNodeType::TmpRemoteBlacklist).await?;
        remote.extend(remote_tmp.iter().cloned());

        self.lists = UnsyncedLists {
            remote,
            remote_tmp,
            local_tmp: nodes.sync_nodes(id, SyncNodeType::TmpLocalBlacklist).await?,
            white: nodes.sync_nodes(id, SyncNodeType::WhiteList).await?,
        };
        Ok(())
    }

    async fn checkpoint(&self) -> Result<(), WorkerError> {
        let control = &self.worker.control;
        if !control.is_stopped() {
            control.wait_if_paused().await;
        }
        if control.is_stopped() {
            debug!("Stop requested, aborting pass");
            return Err(WorkerError::canceled());
        }
        Ok(())
    }

    fn insert_op(&mut self, side: ReplicaSide, op: FsOperation) {
        if self.worker.parameters.extended_log {
            match &op.destination_path {
                Some(destination) => debug!(
                    %side,
                    op = ?op.op_type,
                    node_id = %op.node_id,
                    from = %op.path.display(),
                    to = %destination.display(),
                    "Generated FS operation"
                ),
                None => debug!(
                    %side,
                    op = ?op.op_type,
                    node_id = %op.node_id,
                    path = %op.path.display(),
                    "Generated FS operation"
                ),
            }
        }
        self.output.ops_mut(side).insert_op(op);
    }

    // ========================================================================
    // Phase A: database tree
    // ========================================================================

    async fn explore_db_tree(&mut self) -> Result<(HashSet<NodeId>, HashSet<NodeId>), WorkerError> {
        let db = Arc::clone(&self.worker.db);
        let root = db.root_node().await.map_err(db_err)?;
        let mut db_ids = db.db_ids().await.map_err(db_err)?;
        db_ids.retain(|id| *id != root.db_id);
        db_ids.sort_unstable();

        let mut local_ids = HashSet::new();
        let mut remote_ids = HashSet::new();
        if db_ids.is_empty() {
            debug!("No items found in sync database");
            return Ok((local_ids, remote_ids));
        }

        // Directories first: exclusions found on a folder apply to its files
        let mut files = Vec::new();
        for db_id in db_ids {
            self.checkpoint().await?;
            let node = db
                .node(db_id)
                .await
                .map_err(db_err)?
                .ok_or_else(|| {
                    warn!(db_id, "Sync database row vanished");
                    WorkerError::db_entry_not_found()
                })?;

            local_ids.extend(node.node_id_local.clone());
            remote_ids.extend(node.node_id_remote.clone());

            if node.is_dir() {
                self.process_db_node(&node).await?;
            } else {
                files.push(node);
            }
        }
        for node in files {
            self.checkpoint().await?;
            self.process_db_node(&node).await?;
        }

        Ok((local_ids, remote_ids))
    }

    async fn process_db_node(&mut self, node: &DbNode) -> Result<(), WorkerError> {
        let db = Arc::clone(&self.worker.db);
        for side in ReplicaSide::ALL {
            let db_path = db
                .path(node.db_id, side)
                .await
                .map_err(db_err)?
                .ok_or_else(WorkerError::db_entry_not_found)?;
            let node_id = match node.node_id(side) {
                Some(id) if !id.is_empty() => id.clone(),
                _ => {
                    warn!(db_id = node.db_id, %side, "Node id missing in sync database");
                    return Err(WorkerError::db_entry_not_found());
                }
            };
            self.process_db_node_side(node, side, &node_id, &db_path)
                .await?;
        }
        self.check_file_integrity(node)
    }

    async fn process_db_node_side(
        &mut self,
        node: &DbNode,
        side: ReplicaSide,
        node_id: &NodeId,
        db_path: &Path,
    ) -> Result<(), WorkerError> {
        let snapshot = self.snapshot(side);
        let db_parent = self
            .worker
            .db
            .parent(side, node_id)
            .await
            .map_err(db_err)?
            .ok_or_else(|| {
                warn!(%side, %node_id, "Parent missing in sync database");
                WorkerError::db_entry_not_found()
            })?;

        let mut remote_item_unsynced = false;
        let mut moved_into_unsynced = false;
        match side {
            ReplicaSide::Remote => {
                if self.in_unsynced_list_db(node_id, side).await {
                    remote_item_unsynced = true;
                    // moved inside an excluded folder: removed by this pass
                    moved_into_unsynced = snapshot.parent_id(node_id) != Some(&db_parent);
                }
            }
            ReplicaSide::Local => {
                if self.in_unsynced_list_db(node_id, side).await {
                    return Ok(());
                }
            }
        }

        if !snapshot.exists(node_id) || moved_into_unsynced {
            return self.detect_delete(node, side, node_id, db_path).await;
        }

        if remote_item_unsynced {
            return Ok(());
        }

        let snap_path = match snapshot.path(node_id) {
            Ok(path) => path,
            Err(SnapshotError::Unrepresentable(_)) => {
                debug!(%side, %node_id, "Path cannot be represented, item ignored");
                return Ok(());
            }
            Err(e) => {
                warn!(%side, %node_id, error = %e, "Failed to retrieve path from snapshot");
                return Err(WorkerError::invalid_snapshot());
            }
        };

        match side {
            ReplicaSide::Local => {
                // delete events may have been missed by the observer
                let absolute = self.worker.local_root.join(&snap_path);
                let exists = self
                    .worker
                    .probe
                    .exists(&absolute)
                    .map_err(|e| io_err(&absolute, &e))?;
                if !exists {
                    debug!(path = %absolute.display(), "Item no longer exists on disk, snapshot must be rebuilt");
                    return Err(WorkerError::invalid_snapshot());
                }
            }
            ReplicaSide::Remote => {
                let node_type = snapshot.node_type(node_id).unwrap_or(node.node_type);
                if self.is_path_too_long(&snap_path, side, node_id, node_type) {
                    return Ok(());
                }
            }
        }

        let snap_last_modified = snapshot.last_modified(node_id).unwrap_or(0);
        let snap_created = snapshot.created_at(node_id).unwrap_or(0);
        let snap_size = snapshot.size(node_id);

        if node.node_type == NodeType::File
            && snap_last_modified != node.last_modified(side).unwrap_or(0)
        {
            self.insert_op(
                side,
                FsOperation::new(
                    OperationType::Edit,
                    node_id.clone(),
                    NodeType::File,
                    snap_created,
                    snap_last_modified,
                    snap_size,
                    snap_path.clone(),
                ),
            );
        }

        let renamed = normalize_name(node.name(side))
            != normalize_name(snapshot.name(node_id).unwrap_or_default());
        let moved = snapshot.parent_id(node_id) != Some(&db_parent);
        if renamed || moved {
            // only unsynced lists turn a move into a delete; a new name that
            // matches an exclusion template still yields a Move
            let op = if self
                .in_unsynced_list_snapshot(snapshot, node_id, side, false)
                .await
            {
                // moved into an excluded folder
                FsOperation::new(
                    OperationType::Delete,
                    node_id.clone(),
                    node.node_type,
                    snap_created,
                    snap_last_modified,
                    snap_size,
                    db_path.to_path_buf(),
                )
            } else {
                FsOperation::moved(
                    node_id.clone(),
                    node.node_type,
                    snap_created,
                    snap_last_modified,
                    snap_size,
                    db_path.to_path_buf(),
                    snap_path,
                )
            };
            self.insert_op(side, op);
        }
        Ok(())
    }

    async fn detect_delete(
        &mut self,
        node: &DbNode,
        side: ReplicaSide,
        node_id: &NodeId,
        db_path: &Path,
    ) -> Result<(), WorkerError> {
        if self.path_in_deleted_folder(side, db_path) {
            return Ok(());
        }

        match self.check_if_ok_to_delete(side, db_path, node_id)? {
            DeleteCheck::Ok => {}
            DeleteCheck::Excluded => return Ok(()),
            DeleteCheck::NoWritePermission => {
                self.worker
                    .sync_nodes
                    .blacklist_temporarily(self.worker.sync_db_id, side, node_id)
                    .await?;
                self.worker.errors.add_issue(
                    SyncIssue::node(
                        self.worker.sync_db_id,
                        side,
                        node_id.clone(),
                        NodeType::Directory,
                        db_path.to_path_buf(),
                    )
                    .with_exit(ExitCode::SystemError, ExitCause::FileAccessError),
                );
                return self.refresh_unsynced_lists().await;
            }
        }

        let snapshot = self.snapshot(side);
        if self
            .in_unsynced_list_snapshot(snapshot, node_id, side, true)
            .await
        {
            return Ok(());
        }

        let mut check_template = side == ReplicaSide::Remote;
        if side == ReplicaSide::Local {
            let absolute = self.worker.local_root.join(db_path);
            if self.path_too_long(&absolute) {
                warn!(path = %absolute.display(), "Path too long, delete not propagated");
                return Ok(());
            }
            if !snapshot.exists(node_id) {
                check_template = self
                    .worker
                    .probe
                    .exists(&absolute)
                    .map_err(|e| io_err(&absolute, &e))?;
            }
        }

        if check_template {
            let excluded = self
                .worker
                .templates
                .check_with_probe(
                    self.worker.probe.as_ref(),
                    &self.worker.local_root,
                    db_path,
                    self.worker.sync_hidden_files,
                )
                .map_err(|e| io_err(db_path, &e))?;
            if excluded.is_some() {
                return Ok(());
            }
        }

        self.insert_op(
            side,
            FsOperation::new(
                OperationType::Delete,
                node_id.clone(),
                node.node_type,
                node.created.unwrap_or(0),
                node.last_modified(side).unwrap_or(0),
                node.size,
                db_path.to_path_buf(),
            ),
        );
        if node.is_dir() {
            self.add_folder_to_delete(side, db_path);
        }
        Ok(())
    }

    /// Local items only: makes sure the item is really gone from disk
    fn check_if_ok_to_delete(
        &self,
        side: ReplicaSide,
        relative_path: &Path,
        node_id: &NodeId,
    ) -> Result<DeleteCheck, WorkerError> {
        if side != ReplicaSide::Local {
            return Ok(DeleteCheck::Ok);
        }

        if self.local.item_id(relative_path).is_some() {
            // another item now lives at this path: Delete + Create
            return Ok(DeleteCheck::Ok);
        }

        let probe = self.worker.probe.as_ref();
        let absolute = self.worker.local_root.join(relative_path);
        let on_disk = probe
            .node_id(&absolute)
            .map_err(|e| io_err(&absolute, &e))?;
        if on_disk.as_ref() != Some(node_id) {
            return Ok(DeleteCheck::Ok);
        }

        if !probe
            .can_write(&absolute)
            .map_err(|e| io_err(&absolute, &e))?
        {
            debug!(path = %absolute.display(), "Item has no write permission");
            return Ok(DeleteCheck::NoWritePermission);
        }

        match self.worker.templates.check_with_probe(
            probe,
            &self.worker.local_root,
            relative_path,
            self.worker.sync_hidden_files,
        ) {
            Ok(Some(_)) => return Ok(DeleteCheck::Excluded),
            Ok(None) => {}
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!(path = %absolute.display(), "Item misses search permission");
                return Err(WorkerError::new(
                    ExitCode::SystemError,
                    ExitCause::NoSearchPermission,
                ));
            }
            Err(e) => {
                warn!(path = %absolute.display(), error = %e, "Exclusion check failed");
                return Err(WorkerError::new(ExitCode::SystemError, ExitCause::FileAccessError));
            }
        }

        if self.local.item(node_id).is_some() && self.local.is_orphan(node_id) {
            // left behind by an interrupted exclusion
            return Ok(DeleteCheck::Ok);
        }

        debug!(
            path = %absolute.display(),
            "Item still exists on local replica, snapshot must be rebuilt"
        );
        Err(WorkerError::invalid_snapshot())
    }

    fn check_file_integrity(&mut self, node: &DbNode) -> Result<(), WorkerError> {
        if !self.worker.parameters.file_size_mismatch_detection || node.is_dir() {
            return Ok(());
        }
        let (Some(local_id), Some(remote_id), Some(db_last_modified)) = (
            node.node_id_local.as_ref(),
            node.node_id_remote.as_ref(),
            node.last_modified_local,
        ) else {
            return Ok(());
        };
        if self.output.size_mismatch.contains_key(local_id) {
            return Ok(());
        }
        if !self.local.exists(local_id) || !self.remote.exists(remote_id) {
            return Ok(());
        }
        // links do not have the same size on every platform
        if self.local.is_link(local_id) {
            return Ok(());
        }

        let local_size = self.local.size(local_id);
        let remote_size = self.remote.size(remote_id);
        let local_last_modified = self.local.last_modified(local_id);
        let remote_last_modified = self.remote.last_modified(remote_id);

        if local_size != remote_size
            && local_last_modified == Some(db_last_modified)
            && local_last_modified == remote_last_modified
        {
            let path = self.local.path(local_id).map_err(|e| {
                warn!(node_id = %local_id, error = %e, "Failed to retrieve path from snapshot");
                WorkerError::invalid_snapshot()
            })?;
            let absolute = self.worker.local_root.join(path);
            info!(
                path = %absolute.display(),
                local_size,
                remote_size,
                "File size mismatch, remote version will be downloaded again"
            );
            self.output.size_mismatch.insert(local_id.clone(), absolute);
        }
        Ok(())
    }

    fn add_folder_to_delete(&mut self, side: ReplicaSide, path: &Path) {
        let dirs = self.dirs_to_delete.entry(side).or_default();
        dirs.retain(|d| !d.starts_with(path));
        dirs.insert(path.to_path_buf());
    }

    fn path_in_deleted_folder(&self, side: ReplicaSide, path: &Path) -> bool {
        self.dirs_to_delete
            .get(&side)
            .is_some_and(|dirs| dirs.iter().any(|d| path.starts_with(d)))
    }

    /// Drops Deletes already implied by the Delete of an ancestor directory
    fn prune_covered_deletes(&mut self) {
        for side in ReplicaSide::ALL {
            let Some(dirs) = self.dirs_to_delete.get(&side) else {
                continue;
            };
            let removed = self.output.ops_mut(side).remove_ops_where(|op| {
                op.op_type == OperationType::Delete
                    && dirs.iter().any(|d| op.path != *d && op.path.starts_with(d))
            });
            if removed > 0 {
                debug!(%side, removed, "Dropped Deletes covered by a directory Delete");
            }
        }
    }

    // ========================================================================
    // Phase B: snapshot trees
    // ========================================================================

    async fn explore_snapshot_tree(
        &mut self,
        side: ReplicaSide,
        db_ids: &HashSet<NodeId>,
    ) -> Result<(), WorkerError> {
        let snapshot = self.snapshot(side);

        // Breadth-first from the root: orphans are never reached and a
        // directory always precedes its descendants
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut queue = VecDeque::from([snapshot.root_id().clone()]);
        while let Some(id) = queue.pop_front() {
            for child in snapshot.children_ids(&id) {
                if snapshot.node_type(&child) == Some(NodeType::Directory) {
                    queue.push_back(child.clone());
                    dirs.push(child);
                } else {
                    files.push(child);
                }
            }
        }
        if dirs.is_empty() && files.is_empty() {
            debug!(%side, "No items found in snapshot");
            return Ok(());
        }

        for node_id in dirs.iter().chain(files.iter()) {
            self.checkpoint().await?;
            if db_ids.contains(node_id) {
                continue;
            }

            let path = match snapshot.path(node_id) {
                Ok(path) => path,
                Err(SnapshotError::Unrepresentable(_)) => continue,
                Err(e) => {
                    warn!(%side, %node_id, error = %e, "Failed to retrieve path from snapshot");
                    return Err(WorkerError::invalid_snapshot());
                }
            };
            let node_type = snapshot.node_type(node_id).unwrap_or(NodeType::File);
            let size = snapshot.size(node_id);

            if self
                .is_excluded_from_sync(side, node_id, &path, node_type, size)
                .await?
            {
                continue;
            }

            self.insert_op(
                side,
                FsOperation::new(
                    OperationType::Create,
                    node_id.clone(),
                    node_type,
                    snapshot.created_at(node_id).unwrap_or(0),
                    snapshot.last_modified(node_id).unwrap_or(0),
                    size,
                    path,
                ),
            );
        }
        Ok(())
    }

    async fn is_excluded_from_sync(
        &mut self,
        side: ReplicaSide,
        node_id: &NodeId,
        path: &Path,
        node_type: NodeType,
        size: i64,
    ) -> Result<bool, WorkerError> {
        let snapshot = self.snapshot(side);
        let extended_log = self.worker.parameters.extended_log;

        if self
            .in_unsynced_list_snapshot(snapshot, node_id, side, false)
            .await
        {
            if extended_log {
                debug!(%side, path = %path.display(), "Item ignored because it is not synced");
            }
            return Ok(true);
        }

        if let Some(exclusion) = self.worker.templates.is_excluded_path(path) {
            if extended_log {
                debug!(%side, path = %path.display(), ?exclusion, "Item ignored by template");
            }
            return Ok(true);
        }

        match side {
            ReplicaSide::Remote => {
                if self.is_path_too_long(path, side, node_id, node_type) {
                    return Ok(true);
                }
                if node_type == NodeType::Directory && self.is_too_big(node_id, path, size).await? {
                    return Ok(true);
                }
            }
            ReplicaSide::Local => {
                let probe = self.worker.probe.as_ref();
                let absolute = self.worker.local_root.join(path);
                match probe.exists(&absolute) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(path = %absolute.display(), "Item ignored because it does not exist");
                        return Ok(true);
                    }
                    Err(e) => {
                        warn!(path = %absolute.display(), error = %e, "Existence check failed");
                        return Ok(true);
                    }
                }
                if !self.worker.sync_hidden_files && probe.is_hidden(&absolute).unwrap_or(true) {
                    if extended_log {
                        debug!(path = %absolute.display(), "Hidden item ignored");
                    }
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Remote directory over the big-folder limit; moved to the undecided list
    async fn is_too_big(
        &mut self,
        node_id: &NodeId,
        path: &Path,
        size: i64,
    ) -> Result<bool, WorkerError> {
        let remote = self.remote;
        if self.is_whitelisted(remote, node_id) {
            return Ok(false);
        }

        // already synchronized locally
        if let Ok(Some(_)) = self
            .worker
            .db
            .corresponding_node_id(ReplicaSide::Remote, node_id)
            .await
        {
            return Ok(false);
        }
        if self.local.item_id(path).is_some() {
            return Ok(false);
        }

        let parameters = &self.worker.parameters;
        if !parameters.use_big_folder_size_limit || size <= parameters.big_folder_size_limit_bytes() {
            return Ok(false);
        }

        let sync_db_id = self.worker.sync_db_id;
        let mut undecided = self
            .worker
            .sync_nodes
            .sync_nodes(sync_db_id, SyncNodeType::UndecidedList)
            .await?;
        // the folder entry supersedes entries for its descendants
        undecided.retain(|id| !remote.is_ancestor(id, node_id));
        undecided.insert(node_id.clone());
        self.worker
            .sync_nodes
            .update(sync_db_id, SyncNodeType::UndecidedList, undecided)
            .await?;
        info!(path = %path.display(), size, "Folder over the size limit added to the undecided list");

        self.refresh_unsynced_lists().await?;
        Ok(true)
    }

    fn is_whitelisted(&self, snapshot: &Snapshot, node_id: &NodeId) -> bool {
        let mut current = node_id.clone();
        for _ in 0..=snapshot.nb_items() {
            if current.is_empty() || current == *snapshot.root_id() {
                break;
            }
            if self.lists.white.contains(&current) {
                return true;
            }
            current = snapshot.parent_id(&current).cloned().unwrap_or_default();
        }
        false
    }

    fn path_too_long(&self, absolute: &Path) -> bool {
        absolute.as_os_str().len() > self.worker.parameters.max_path_length
    }

    /// Reports and skips items whose local path would exceed the platform limit
    fn is_path_too_long(
        &self,
        relative_path: &Path,
        side: ReplicaSide,
        node_id: &NodeId,
        node_type: NodeType,
    ) -> bool {
        let absolute = self.worker.local_root.join(relative_path);
        if !self.path_too_long(&absolute) {
            return false;
        }
        warn!(
            path = %absolute.display(),
            length = absolute.as_os_str().len(),
            "Path length too big, item ignored"
        );
        self.worker.errors.add_issue(
            SyncIssue::node(
                self.worker.sync_db_id,
                side,
                node_id.clone(),
                node_type,
                relative_path.to_path_buf(),
            )
            .with_inconsistency(InconsistencyType::PathLength),
        );
        true
    }

    // ========================================================================
    // Unsynced-list membership
    // ========================================================================

    /// Membership of the item or of one of its ancestors as recorded in the
    /// sync database
    async fn in_unsynced_list_db(&self, node_id: &NodeId, side: ReplicaSide) -> bool {
        let list = match side {
            ReplicaSide::Local => &self.lists.local_tmp,
            ReplicaSide::Remote => &self.lists.remote,
        };
        if list.is_empty() {
            return false;
        }

        let mut current = node_id.clone();
        loop {
            if list.contains(&current) {
                return true;
            }
            match self.worker.db.parent(side, &current).await {
                Ok(Some(parent)) => current = parent,
                Ok(None) => return false,
                Err(e) => {
                    warn!(error = %e, "Error while walking sync database parents");
                    return false;
                }
            }
        }
    }

    /// Membership of the item or of one of its snapshot ancestors, either
    /// directly or through the id of the same node on the other side
    async fn in_unsynced_list_snapshot(
        &self,
        snapshot: &Snapshot,
        node_id: &NodeId,
        side: ReplicaSide,
        tmp_only: bool,
    ) -> bool {
        let remote_list = if tmp_only {
            &self.lists.remote_tmp
        } else {
            &self.lists.remote
        };
        let (own, corresponding) = match side {
            ReplicaSide::Local => (&self.lists.local_tmp, remote_list),
            ReplicaSide::Remote => (remote_list, &self.lists.local_tmp),
        };
        if own.is_empty() && corresponding.is_empty() {
            return false;
        }

        let mut current = node_id.clone();
        for _ in 0..=snapshot.nb_items() {
            if current.is_empty() || current == *snapshot.root_id() {
                break;
            }
            if own.contains(&current) {
                return true;
            }
            if let Ok(Some(other)) = self.worker.db.corresponding_node_id(side, &current).await {
                if corresponding.contains(&other) {
                    return true;
                }
            }
            current = snapshot.parent_id(&current).cloned().unwrap_or_default();
        }
        false
    }
}
