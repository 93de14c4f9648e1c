//! Remote snapshot maintenance
//!
//! [`RemoteFileSystemObserver`] bootstraps the remote [`Snapshot`] from a
//! full recursive listing, then keeps it current by replaying the change
//! actions the server reports after the persisted listing cursor.
//!
//! ## Loop
//!
//! ```text
//! ┌──────────────┐ invalid ┌──────────────────────────┐
//! │ run (loop)   │────────→│ generate_initial_snapshot │
//! └──────┬───────┘         └────────────┬─────────────┘
//!        │ valid                         │
//!        ▼                               ▼
//! ┌──────────────┐ changes ┌──────────────────────────┐
//! │ long-poll    │────────→│ continue listing (pages) │──→ process_actions
//! └──────────────┘         └──────────────────────────┘
//! ```
//!
//! A [`RemoteFileSystemObserver::force_refresh`] aborts an outstanding
//! long-poll and goes straight to the continuation requests.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use kdsync_core::config::Config;
use kdsync_core::domain::{
    CancelType, ExitCause, ExitCode, InconsistencyType, NodeId, NodeType, ReplicaSide,
    SnapshotItem, SyncIssue, SyncNodeType, WorkerError,
};
use kdsync_core::ports::{DriveError, IErrorSink, IRemoteDrive, ISyncDb, RemoteAction};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::control::WorkerControl;
use crate::exclusion::ExclusionTemplateCache;
use crate::snapshot::{normalize_name, LiveSnapshot, Snapshot};
use crate::sync_nodes::SyncNodeCache;

// ============================================================================
// Action codes
// ============================================================================

/// Change reported by the server for one item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Create,
    Rename,
    Edit,
    Access,
    Trash,
    Delete,
    MoveIn,
    MoveOut,
    Restore,
    AccessRightInsert,
    AccessRightUpdate,
    AccessRightRemove,
    AccessRightUserInsert,
    AccessRightUserUpdate,
    AccessRightUserRemove,
    AccessRightTeamInsert,
    AccessRightTeamUpdate,
    AccessRightTeamRemove,
    AccessRightMainUsersInsert,
    AccessRightMainUsersUpdate,
    AccessRightMainUsersRemove,
    FileShareCreate,
    FileShareDelete,
    ShareLinkCreate,
    ShareLinkDelete,
    Unknown(String),
}

impl ActionKind {
    pub fn from_code(code: &str) -> Self {
        match code {
            "file_create" => Self::Create,
            "file_rename" => Self::Rename,
            "file_update" => Self::Edit,
            "file_access" => Self::Access,
            "file_trash" => Self::Trash,
            "file_delete" => Self::Delete,
            "file_move" => Self::MoveIn,
            "file_move_out" => Self::MoveOut,
            "file_restore" => Self::Restore,
            "acl_insert" => Self::AccessRightInsert,
            "acl_update" => Self::AccessRightUpdate,
            "acl_remove" => Self::AccessRightRemove,
            "acl_user_insert" => Self::AccessRightUserInsert,
            "acl_user_update" => Self::AccessRightUserUpdate,
            "acl_user_remove" => Self::AccessRightUserRemove,
            "acl_team_insert" => Self::AccessRightTeamInsert,
            "acl_team_update" => Self::AccessRightTeamUpdate,
            "acl_team_remove" => Self::AccessRightTeamRemove,
            "acl_main_users_insert" => Self::AccessRightMainUsersInsert,
            "acl_main_users_update" => Self::AccessRightMainUsersUpdate,
            "acl_main_users_remove" => Self::AccessRightMainUsersRemove,
            "file_share_create" => Self::FileShareCreate,
            "file_share_delete" => Self::FileShareDelete,
            "share_link_create" => Self::ShareLinkCreate,
            "share_link_delete" => Self::ShareLinkDelete,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Effect of an action on the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    /// Insert or overwrite the item, exploring a reappearing directory
    Upsert,
    /// Overwrite the item's metadata
    UpdateMetadata,
    Remove,
    Ignore,
    /// Access granted: upsert if the item is readable, ignore otherwise
    ConditionalUpsertOnRights,
    /// Access revoked: ignore if the item is still readable, remove otherwise
    ConditionalRemoveOnRights,
}

pub fn classify(kind: &ActionKind) -> ActionClass {
    use ActionKind::*;
    match kind {
        AccessRightInsert
        | AccessRightUpdate
        | AccessRightUserInsert
        | AccessRightUserUpdate
        | AccessRightTeamInsert
        | AccessRightTeamUpdate
        | AccessRightMainUsersInsert
        | AccessRightMainUsersUpdate => ActionClass::ConditionalUpsertOnRights,
        Create | Rename | MoveIn | Restore => ActionClass::Upsert,
        Edit => ActionClass::UpdateMetadata,
        AccessRightRemove
        | AccessRightUserRemove
        | AccessRightTeamRemove
        | AccessRightMainUsersRemove => ActionClass::ConditionalRemoveOnRights,
        MoveOut | Trash => ActionClass::Remove,
        Access | Delete | FileShareCreate | FileShareDelete | ShareLinkCreate
        | ShareLinkDelete | Unknown(_) => ActionClass::Ignore,
    }
}

// ============================================================================
// Error mapping
// ============================================================================

fn drive_error(e: &DriveError) -> WorkerError {
    match e {
        DriveError::InvalidToken => WorkerError::new(ExitCode::InvalidToken, ExitCause::Unknown),
        DriveError::Timeout => WorkerError::new(ExitCode::NetworkError, ExitCause::NetworkTimeout),
        DriveError::Network(_) => WorkerError::new(ExitCode::NetworkError, ExitCause::Unknown),
        DriveError::ListingParse(_) => {
            WorkerError::new(ExitCode::LogicError, ExitCause::FullListParsingError)
        }
        // a listing cut short is a transfer problem, not a server bug
        DriveError::ListingTruncated => {
            WorkerError::new(ExitCode::NetworkError, ExitCause::FullListParsingError)
        }
        DriveError::Http { .. }
        | DriveError::Forbidden(_)
        | DriveError::NotFound(_)
        | DriveError::Api { .. }
        | DriveError::InvalidResponse(_) => {
            WorkerError::new(ExitCode::BackError, ExitCause::ApiErr)
        }
    }
}

/// Errors the observer loop cannot recover from by itself
///
/// A `DataError` other than a snapshot to rebuild (an unregistered sync
/// profile) stays the same on every retry.
fn is_fatal(e: &WorkerError) -> bool {
    match e.code {
        ExitCode::DbError | ExitCode::InvalidToken | ExitCode::SystemError => true,
        ExitCode::DataError => !e.requires_snapshot_rebuild(),
        _ => false,
    }
}

/// Names the local filesystem cannot hold
fn has_unsupported_characters(name: &str) -> bool {
    name.is_empty() || name.contains(['\0', '/'])
}

// ============================================================================
// Listing monitor
// ============================================================================

const LISTING_WINDOW: Duration = Duration::from_secs(3600);
const MAX_LISTINGS_PER_WINDOW: u32 = 60;

/// Detects a sync stuck rebuilding its snapshot over and over
#[derive(Debug)]
struct ListingMonitor {
    count: u32,
    since: Instant,
}

impl ListingMonitor {
    fn new() -> Self {
        Self {
            count: 0,
            since: Instant::now(),
        }
    }

    /// Records a full listing; returns `true` when the looping threshold was crossed
    fn record(&mut self, now: Instant) -> bool {
        let mut reset = now.duration_since(self.since) > LISTING_WINDOW;
        let looping = self.count > MAX_LISTINGS_PER_WINDOW;
        if looping {
            warn!(
                count = self.count,
                "Too many full listings within an hour, sync is looping"
            );
            reset = true;
        }
        if reset {
            self.count = 0;
            self.since = now;
        }
        self.count += 1;
        looping
    }
}

// ============================================================================
// Observer
// ============================================================================

/// Keeps the remote snapshot of one sync profile current
pub struct RemoteFileSystemObserver {
    sync_db_id: i64,
    extended_log: bool,
    loop_sleep: Duration,
    drive: Arc<dyn IRemoteDrive>,
    db: Arc<dyn ISyncDb>,
    snapshot: Arc<LiveSnapshot>,
    sync_nodes: Arc<SyncNodeCache>,
    templates: Arc<ExclusionTemplateCache>,
    errors: Arc<dyn IErrorSink>,
    control: WorkerControl,
    /// Set while the snapshot is being (re)built or changes are being fetched
    updating: AtomicBool,
    refresh: Notify,
    monitor: Mutex<ListingMonitor>,
}

impl RemoteFileSystemObserver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        drive: Arc<dyn IRemoteDrive>,
        db: Arc<dyn ISyncDb>,
        sync_nodes: Arc<SyncNodeCache>,
        templates: Arc<ExclusionTemplateCache>,
        errors: Arc<dyn IErrorSink>,
        control: WorkerControl,
    ) -> Self {
        Self {
            sync_db_id: config.sync.sync_db_id,
            extended_log: config.parameters.extended_log,
            loop_sleep: Duration::from_millis(config.sync.loop_sleep_ms),
            drive,
            db,
            snapshot: Arc::new(LiveSnapshot::new(
                ReplicaSide::Remote,
                config.sync.root_remote_id.as_str(),
            )),
            sync_nodes,
            templates,
            errors,
            control,
            updating: AtomicBool::new(false),
            refresh: Notify::new(),
            monitor: Mutex::new(ListingMonitor::new()),
        }
    }

    /// The live remote snapshot, shared with the reconciliation pass
    pub fn snapshot(&self) -> Arc<LiveSnapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn control(&self) -> &WorkerControl {
        &self.control
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::Acquire)
    }

    /// Fetches pending changes right away, aborting an outstanding long-poll
    pub fn force_refresh(&self) {
        debug!("Forced refresh of the remote snapshot requested");
        self.updating.store(true, Ordering::Release);
        self.refresh.notify_one();
    }

    fn invalidate_snapshot(&self) {
        if self.snapshot.is_valid() {
            info!("Invalidating remote snapshot");
        }
        self.snapshot.update(Snapshot::init);
    }

    fn report(&self, error: &WorkerError) {
        let reported = match error.code {
            ExitCode::NetworkError => error.cause == ExitCause::NetworkTimeout,
            ExitCode::LogicError => error.cause == ExitCause::FullListParsingError,
            _ => false,
        };
        if reported {
            self.errors.add_issue(SyncIssue::sync_pass(
                self.sync_db_id,
                error.code,
                error.cause,
            ));
        }
    }

    /// Observer loop; returns once stopped or on a fatal error
    ///
    /// Network and server errors are retried on the next iteration.
    ///
    /// # Errors
    ///
    /// `DbError`, `InvalidToken`, `SystemError` or a `DataError` that a
    /// rebuild cannot fix; the snapshot is invalid on return.
    #[instrument(skip_all, fields(sync_db_id = self.sync_db_id))]
    pub async fn run(&self) -> Result<(), WorkerError> {
        info!("Remote observer started");
        loop {
            if self.control.is_stopped() {
                self.invalidate_snapshot();
                break;
            }

            let result = if self.snapshot.is_valid() {
                self.process_events().await
            } else {
                match self.generate_initial_snapshot().await {
                    Ok(()) => self.process_events().await,
                    Err(e) => Err(e),
                }
            };

            if let Err(e) = result {
                if is_fatal(&e) {
                    warn!(error = %e, "Remote observer stopped on error");
                    self.invalidate_snapshot();
                    return Err(e);
                }
                warn!(error = %e, "Remote observer iteration failed, retrying");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.loop_sleep) => {}
                _ = self.control.cancelled() => {}
            }
        }
        info!("Remote observer stopped");
        Ok(())
    }

    /// Rebuilds the snapshot from a full listing of the sync root
    ///
    /// # Errors
    ///
    /// Any listing or database error; the snapshot is left invalid.
    pub async fn generate_initial_snapshot(&self) -> Result<(), WorkerError> {
        info!("Starting remote snapshot generation");
        let start = Instant::now();

        self.snapshot.init();
        self.updating.store(true, Ordering::Release);
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(Instant::now());

        let root_id = self.snapshot.read(|s| s.root_id().clone());
        let result = self.get_items_in_dir(&root_id, true).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(()) if !self.control.is_stopped() => {
                self.snapshot.set_valid(true);
                info!(
                    elapsed_ms,
                    items = self.snapshot.read(Snapshot::nb_items),
                    "Remote snapshot generated"
                );
            }
            _ => {
                self.invalidate_snapshot();
                warn!(elapsed_ms, "Remote snapshot generation stopped or failed");
                if let Err(e) = &result {
                    self.report(e);
                }
            }
        }
        self.updating.store(false, Ordering::Release);
        result
    }

    async fn explore_directory(&self, dir_id: &NodeId) -> Result<(), WorkerError> {
        let result = self.get_items_in_dir(dir_id, false).await;
        if let Err(e) = &result {
            self.report(e);
        }
        result
    }

    /// Lists the subtree of `dir_id` into the snapshot, then drops orphans
    async fn get_items_in_dir(&self, dir_id: &NodeId, save_cursor: bool) -> Result<(), WorkerError> {
        if self.control.is_stopped() {
            return Ok(());
        }
        let blacklist = self
            .sync_nodes
            .sync_nodes(self.sync_db_id, SyncNodeType::BlackList)
            .await?;

        let listing = tokio::select! {
            res = self.drive.full_listing(dir_id, &blacklist) => res,
            _ = self.control.cancelled() => {
                debug!(%dir_id, "Listing aborted");
                return Ok(());
            }
        };
        let listing = listing.map_err(|e| {
            warn!(%dir_id, error = %e, "Full listing failed");
            drive_error(&e)
        })?;

        if save_cursor {
            self.save_cursor(None, &listing.cursor).await?;
        }

        debug!(%dir_id, rows = listing.items.len(), "Parsing listing");
        let start = Instant::now();
        let mut existing: HashSet<(NodeId, String)> = HashSet::new();
        let mut accepted = Vec::with_capacity(listing.items.len());
        let mut duplicates = Vec::new();
        for item in listing.items {
            if self.control.is_stopped() {
                return Ok(());
            }
            if self.templates.is_excluded(&item.name).is_some() {
                continue;
            }
            if self.unsupported_name(&item.id, &item.name, item.node_type) {
                continue;
            }
            if !existing.insert((item.parent_id.clone(), normalize_name(&item.name))) {
                debug!(name = %item.name, parent = %item.parent_id, "Item already exists in directory");
                duplicates.push(item);
                continue;
            }
            accepted.push(item);
        }

        let extended_log = self.extended_log;
        let item_count = accepted.len();
        self.snapshot.update(|snapshot| {
            for item in accepted {
                let id = item.id.clone();
                match snapshot.update_item(item) {
                    Ok(true) if extended_log => {
                        debug!(node_id = %id, "Item inserted in remote snapshot");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(node_id = %id, error = %e, "Listing row rejected"),
                }
            }

            let orphans: Vec<NodeId> = snapshot
                .ids()
                .into_iter()
                .filter(|id| snapshot.is_orphan(id))
                .collect();
            for id in orphans {
                debug!(node_id = %id, "Removing orphan from remote snapshot");
                snapshot.remove_item(&id);
            }
        });

        for item in duplicates {
            let path = self.item_path(&item.parent_id, &item.name);
            self.errors.add_issue(
                SyncIssue::node(
                    self.sync_db_id,
                    ReplicaSide::Remote,
                    item.id,
                    NodeType::Directory,
                    path,
                )
                .with_cancel(CancelType::AlreadyExistLocal),
            );
        }

        debug!(
            items = item_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "End of listing parsing"
        );
        Ok(())
    }

    /// Path of a child of `parent_id`, best effort
    fn item_path(&self, parent_id: &NodeId, name: &str) -> PathBuf {
        self.snapshot
            .read(|s| s.path(parent_id))
            .unwrap_or_default()
            .join(name)
    }

    fn unsupported_name(&self, id: &NodeId, name: &str, node_type: NodeType) -> bool {
        if !has_unsupported_characters(name) {
            return false;
        }
        debug!(node_id = %id, name, "Name contains a character not supported locally, item ignored");
        self.errors.add_issue(
            SyncIssue::node(
                self.sync_db_id,
                ReplicaSide::Remote,
                id.clone(),
                node_type,
                PathBuf::from(name),
            )
            .with_inconsistency(InconsistencyType::NotYetSupportedChar),
        );
        true
    }

    /// Persists `cursor` if it differs from `current`
    async fn save_cursor(&self, current: Option<&str>, cursor: &str) -> Result<(), WorkerError> {
        if current == Some(cursor) {
            return Ok(());
        }
        let timestamp = chrono::Utc::now().timestamp();
        self.db
            .set_listing_cursor(cursor, timestamp)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to save listing cursor");
                WorkerError::db_access()
            })?;
        debug!(cursor, "Listing cursor updated");
        Ok(())
    }

    /// Waits for remote changes and applies them to the snapshot
    ///
    /// # Errors
    ///
    /// Database, network or server errors. A batch that cannot be applied
    /// invalidates the snapshot.
    pub async fn process_events(&self) -> Result<(), WorkerError> {
        if self.control.is_stopped() {
            return Ok(());
        }

        let mut cursor = self
            .db
            .listing_cursor()
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to read listing cursor");
                WorkerError::db_access()
            })?
            .map(|c| c.cursor)
            .unwrap_or_default();

        if !self.is_updating() && !self.send_long_poll(&cursor).await? {
            return Ok(());
        }

        self.updating.store(true, Ordering::Release);
        let result = self.fetch_changes(&mut cursor).await;
        self.updating.store(false, Ordering::Release);
        result
    }

    async fn fetch_changes(&self, cursor: &mut String) -> Result<(), WorkerError> {
        let mut has_more = true;
        while has_more {
            if self.control.is_stopped() {
                break;
            }
            if cursor.is_empty() {
                warn!("Listing cursor is empty, invalidating snapshot");
                self.invalidate_snapshot();
                return Ok(());
            }

            let page = tokio::select! {
                res = self.drive.continue_listing(cursor) => res,
                _ = self.control.cancelled() => break,
            };
            let page = match page {
                Ok(page) => page,
                Err(e) if e.is_forbidden() => {
                    warn!("Access forbidden");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "Continue listing request failed");
                    return Err(drive_error(&e));
                }
            };

            self.save_cursor(Some(cursor.as_str()), &page.cursor).await?;
            *cursor = page.cursor;
            has_more = page.has_more;

            if let Err(e) = self.process_actions(&page.actions).await {
                self.invalidate_snapshot();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Returns whether the server reports pending changes
    async fn send_long_poll(&self, cursor: &str) -> Result<bool, WorkerError> {
        if !self.snapshot.is_valid() {
            return Ok(false);
        }

        let result = tokio::select! {
            res = self.drive.long_poll(cursor) => res,
            _ = self.control.cancelled() => {
                debug!("Aborting long-poll");
                return Ok(false);
            }
            _ = self.refresh.notified() => {
                debug!("Long-poll aborted by a forced refresh");
                return Ok(true);
            }
        };

        match result {
            Ok(changes) => Ok(changes),
            Err(e) if e.is_bad_gateway() => {
                info!("Long-poll failed with a bad gateway, checking for changes anyway");
                Ok(true)
            }
            Err(e) if e.is_network() => {
                debug!(error = %e, "Long-poll request failed");
                let error = drive_error(&e);
                self.report(&error);
                Err(error)
            }
            Err(e) => {
                warn!(error = %e, "Long-poll request failed");
                Err(WorkerError::new(ExitCode::BackError, ExitCause::ApiErr))
            }
        }
    }

    /// Applies one batch of change actions
    ///
    /// # Errors
    ///
    /// `BackError` if an item cannot be removed or its rights cannot be
    /// checked, or the error of a failed directory exploration.
    pub async fn process_actions(&self, actions: &[RemoteAction]) -> Result<(), WorkerError> {
        let mut moved_in: HashSet<NodeId> = HashSet::new();
        for action in actions {
            if self.control.is_stopped() {
                return Ok(());
            }

            if self.unsupported_name(&action.file_id, &action.name, action.node_type) {
                continue;
            }

            if let Some(exclusion) = self.templates.is_excluded(&action.name) {
                if exclusion.is_warning() {
                    let path = self.item_path(&action.parent_id, &action.name);
                    self.errors.add_issue(
                        SyncIssue::node(
                            self.sync_db_id,
                            ReplicaSide::Remote,
                            action.file_id.clone(),
                            action.node_type,
                            path,
                        )
                        .with_cancel(CancelType::ExcludedByTemplate),
                    );
                }
                self.snapshot.update(|s| s.remove_item(&action.file_id));
                continue;
            }

            self.process_action(action, &mut moved_in).await?;
        }
        Ok(())
    }

    async fn process_action(
        &self,
        action: &RemoteAction,
        moved_in: &mut HashSet<NodeId>,
    ) -> Result<(), WorkerError> {
        let kind = ActionKind::from_code(&action.action);
        let mut item = action.to_item();

        match classify(&kind) {
            ActionClass::ConditionalUpsertOnRights => {
                if !self.check_rights_and_update_item(&mut item).await? {
                    // no access to this item
                    return Ok(());
                }
                self.upsert(&kind, item, moved_in).await
            }
            ActionClass::Upsert => self.upsert(&kind, item, moved_in).await,
            ActionClass::UpdateMetadata => {
                self.update_item(item);
                Ok(())
            }
            ActionClass::ConditionalRemoveOnRights => {
                if self.check_rights_and_update_item(&mut item).await? {
                    // still readable through another right
                    return Ok(());
                }
                self.remove(&item, moved_in).await
            }
            ActionClass::Remove if kind == ActionKind::MoveOut => self.remove(&item, moved_in).await,
            ActionClass::Remove => self.remove(&item, &HashSet::new()).await,
            ActionClass::Ignore => {
                if let ActionKind::Unknown(code) = &kind {
                    debug!(code = %code, node_id = %item.id, "Unknown action received, ignored");
                }
                Ok(())
            }
        }
    }

    fn update_item(&self, item: SnapshotItem) {
        let id = item.id.clone();
        if let Err(e) = self.snapshot.update(|s| s.update_item(item)) {
            warn!(node_id = %id, error = %e, "Failed to update remote snapshot item");
        }
    }

    async fn clear_tmp_blacklist(&self, node_id: &NodeId) {
        if let Err(e) = self
            .sync_nodes
            .remove_from_tmp_blacklist(self.sync_db_id, ReplicaSide::Remote, node_id)
            .await
        {
            warn!(%node_id, error = %e, "Failed to update temporary blacklist");
        }
    }

    async fn upsert(
        &self,
        kind: &ActionKind,
        item: SnapshotItem,
        moved_in: &mut HashSet<NodeId>,
    ) -> Result<(), WorkerError> {
        let id = item.id.clone();
        let explore = item.is_dir()
            && *kind != ActionKind::Create
            && !self.snapshot.read(|s| s.exists(&id));

        self.clear_tmp_blacklist(&id).await;
        self.update_item(item);
        if explore {
            // the directory reappeared with content unknown to the snapshot
            self.explore_directory(&id).await?;
        }
        if *kind == ActionKind::MoveIn {
            moved_in.insert(id);
        }
        Ok(())
    }

    async fn remove(&self, item: &SnapshotItem, moved_in: &HashSet<NodeId>) -> Result<(), WorkerError> {
        if moved_in.contains(&item.id) {
            // moved within the synced tree
            return Ok(());
        }
        self.clear_tmp_blacklist(&item.id).await;
        if !self.snapshot.update(|s| s.remove_item(&item.id)) {
            warn!(node_id = %item.id, name = %item.name, "Failed to remove item from remote snapshot");
            self.invalidate_snapshot();
            return Err(WorkerError::new(ExitCode::BackError, ExitCause::Unknown));
        }
        Ok(())
    }

    /// Re-reads the item; `false` if the account may no longer access it
    async fn check_rights_and_update_item(&self, item: &mut SnapshotItem) -> Result<bool, WorkerError> {
        match self.drive.file_info(&item.id).await {
            Ok(info) => {
                item.created_at = info.created_at;
                item.last_modified = info.last_modified;
                item.size = info.size;
                item.is_link = info.is_link;
                Ok(true)
            }
            Err(e) if e.is_forbidden() || matches!(e, DriveError::NotFound(_)) => Ok(false),
            Err(e) => {
                warn!(node_id = %item.id, name = %item.name, error = %e, "Error while determining access rights");
                self.invalidate_snapshot();
                Err(WorkerError::new(ExitCode::BackError, ExitCause::ApiErr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    use kdsync_cache::{DatabasePool, SqliteSyncDb};
    use kdsync_core::ports::{FullListing, ListingPage, RemoteFileInfo};

    use crate::error_collector::ErrorCollector;
    use crate::exclusion::ExclusionTemplate;

    // ------------------------------------------------------------------------
    // Fake drive
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct DriveState {
        /// Subtree listings by directory id
        listings: HashMap<NodeId, Vec<SnapshotItem>>,
        listing_error: Option<DriveError>,
        listing_cursor: String,
        without_ids: Vec<HashSet<NodeId>>,
        pages: VecDeque<Result<ListingPage, DriveError>>,
        continue_calls: Vec<String>,
        long_polls: VecDeque<Result<bool, DriveError>>,
        file_infos: HashMap<NodeId, Result<RemoteFileInfo, DriveError>>,
    }

    #[derive(Default)]
    struct FakeDrive {
        state: Mutex<DriveState>,
    }

    impl FakeDrive {
        fn state(&self) -> std::sync::MutexGuard<'_, DriveState> {
            self.state.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl IRemoteDrive for FakeDrive {
        async fn full_listing(
            &self,
            directory_id: &NodeId,
            without_ids: &HashSet<NodeId>,
        ) -> Result<FullListing, DriveError> {
            let mut state = self.state();
            state.without_ids.push(without_ids.clone());
            if let Some(e) = state.listing_error.clone() {
                return Err(e);
            }
            Ok(FullListing {
                cursor: state.listing_cursor.clone(),
                items: state.listings.get(directory_id).cloned().unwrap_or_default(),
            })
        }

        async fn continue_listing(&self, cursor: &str) -> Result<ListingPage, DriveError> {
            let mut state = self.state();
            state.continue_calls.push(cursor.to_string());
            state.pages.pop_front().unwrap_or_else(|| {
                Ok(ListingPage {
                    cursor: cursor.to_string(),
                    has_more: false,
                    actions: Vec::new(),
                })
            })
        }

        async fn long_poll(&self, _cursor: &str) -> Result<bool, DriveError> {
            self.state().long_polls.pop_front().unwrap_or(Ok(false))
        }

        async fn file_info(&self, file_id: &NodeId) -> Result<RemoteFileInfo, DriveError> {
            self.state()
                .file_infos
                .get(file_id)
                .cloned()
                .unwrap_or_else(|| Err(DriveError::NotFound(file_id.to_string())))
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn dir(id: &str, parent: &str, name: &str) -> SnapshotItem {
        SnapshotItem::new(id, parent, name, NodeType::Directory)
    }

    fn file(id: &str, parent: &str, name: &str) -> SnapshotItem {
        SnapshotItem::new(id, parent, name, NodeType::File)
            .with_times(10, 20)
            .with_size(5)
    }

    fn action(code: &str, item: &SnapshotItem) -> RemoteAction {
        RemoteAction {
            action: code.to_string(),
            file_id: item.id.clone(),
            parent_id: item.parent_id.clone(),
            name: item.name.clone(),
            created_at: item.created_at,
            last_modified: item.last_modified,
            node_type: item.node_type,
            size: item.size,
            is_link: false,
            can_write: None,
        }
    }

    fn info(item: &SnapshotItem) -> RemoteFileInfo {
        RemoteFileInfo {
            id: item.id.clone(),
            parent_id: item.parent_id.clone(),
            name: item.name.clone(),
            node_type: item.node_type,
            created_at: 1,
            last_modified: 99,
            size: 42,
            is_link: false,
            can_write: true,
        }
    }

    struct Setup {
        drive: Arc<FakeDrive>,
        db: Arc<SqliteSyncDb>,
        nodes: Arc<SyncNodeCache>,
        templates: Arc<ExclusionTemplateCache>,
        errors: Arc<ErrorCollector>,
        observer: RemoteFileSystemObserver,
    }

    async fn setup(listing: Vec<SnapshotItem>) -> Setup {
        let pool = DatabasePool::in_memory().await.unwrap();
        let db = Arc::new(SqliteSyncDb::new(pool.pool().clone()));
        db.init_root(&NodeId::new("L0"), &NodeId::new("1"))
            .await
            .unwrap();
        let nodes = Arc::new(SyncNodeCache::new());
        nodes.init_cache(1, db.clone()).await.unwrap();

        let drive = Arc::new(FakeDrive::default());
        {
            let mut state = drive.state();
            state.listings.insert(NodeId::new("1"), listing);
            state.listing_cursor = "c0".into();
        }

        let mut config = Config::default();
        config.sync.sync_db_id = 1;
        config.sync.root_remote_id = "1".into();
        config.sync.loop_sleep_ms = 10;

        let templates = Arc::new(ExclusionTemplateCache::with_defaults());
        let errors = Arc::new(ErrorCollector::new());
        let observer = RemoteFileSystemObserver::new(
            &config,
            drive.clone(),
            db.clone(),
            nodes.clone(),
            templates.clone(),
            errors.clone(),
            WorkerControl::new(),
        );
        Setup {
            drive,
            db,
            nodes,
            templates,
            errors,
            observer,
        }
    }

    fn has(observer: &RemoteFileSystemObserver, id: &str) -> bool {
        observer.snapshot().read(|s| s.exists(&NodeId::new(id)))
    }

    // ------------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------------

    #[test]
    fn action_codes_are_classified() {
        let cases = [
            ("file_create", ActionClass::Upsert),
            ("file_rename", ActionClass::Upsert),
            ("file_move", ActionClass::Upsert),
            ("file_restore", ActionClass::Upsert),
            ("file_update", ActionClass::UpdateMetadata),
            ("file_move_out", ActionClass::Remove),
            ("file_trash", ActionClass::Remove),
            ("file_delete", ActionClass::Ignore),
            ("file_access", ActionClass::Ignore),
            ("share_link_create", ActionClass::Ignore),
            ("acl_user_insert", ActionClass::ConditionalUpsertOnRights),
            ("acl_main_users_update", ActionClass::ConditionalUpsertOnRights),
            ("acl_team_remove", ActionClass::ConditionalRemoveOnRights),
            ("something_new", ActionClass::Ignore),
        ];
        for (code, expected) in cases {
            assert_eq!(classify(&ActionKind::from_code(code)), expected, "{code}");
        }
        assert_eq!(
            ActionKind::from_code("something_new"),
            ActionKind::Unknown("something_new".into())
        );
    }

    #[test]
    fn listing_monitor_flags_looping_sync() {
        let mut monitor = ListingMonitor::new();
        let now = Instant::now();
        let flagged = (0..70).filter(|_| monitor.record(now)).count();
        assert_eq!(flagged, 1);

        // counter restarts once the window has elapsed
        let mut monitor = ListingMonitor::new();
        for _ in 0..50 {
            monitor.record(now);
        }
        assert!(!monitor.record(now + LISTING_WINDOW + Duration::from_secs(1)));
        assert_eq!(monitor.count, 1);
    }

    // ------------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn initial_snapshot_is_built_from_full_listing() {
        let s = setup(vec![
            dir("2", "1", "Docs"),
            file("3", "2", "a.txt"),
            file("4", "2", "tmp.part"),
            file("5", "99", "lost.txt"),
        ])
        .await;

        s.observer.generate_initial_snapshot().await.unwrap();

        let snapshot = s.observer.snapshot();
        assert!(snapshot.is_valid());
        assert!(has(&s.observer, "2"));
        assert!(has(&s.observer, "3"));
        assert!(!has(&s.observer, "4"), "template-excluded rows are skipped");
        assert!(
            snapshot.read(|s| s.item(&NodeId::new("5")).is_none()),
            "orphans are removed"
        );
        assert_eq!(
            s.db.listing_cursor().await.unwrap().unwrap().cursor,
            "c0"
        );
        assert!(!s.observer.is_updating());
    }

    #[tokio::test]
    async fn blacklisted_folders_are_not_listed() {
        let s = setup(vec![dir("2", "1", "Docs")]).await;
        s.nodes
            .update(1, SyncNodeType::BlackList, HashSet::from([NodeId::new("7")]))
            .await
            .unwrap();

        s.observer.generate_initial_snapshot().await.unwrap();

        assert_eq!(
            s.drive.state().without_ids,
            vec![HashSet::from([NodeId::new("7")])]
        );
    }

    #[tokio::test]
    async fn duplicate_names_keep_first_item_and_raise_issue() {
        let s = setup(vec![
            dir("2", "1", "Docs"),
            file("3", "2", "caf\u{e9}.txt"),
            file("4", "2", "cafe\u{301}.txt"),
        ])
        .await;

        s.observer.generate_initial_snapshot().await.unwrap();

        assert!(has(&s.observer, "3"));
        assert!(!has(&s.observer, "4"));
        let issues = s.errors.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].cancel, Some(CancelType::AlreadyExistLocal));
        assert_eq!(issues[0].path, Some(PathBuf::from("Docs/cafe\u{301}.txt")));
    }

    #[tokio::test]
    async fn truncated_listing_leaves_snapshot_invalid() {
        let s = setup(vec![dir("2", "1", "Docs")]).await;
        s.drive.state().listing_error = Some(DriveError::ListingTruncated);

        let err = s.observer.generate_initial_snapshot().await.unwrap_err();
        assert_eq!(err.code, ExitCode::NetworkError);
        assert_eq!(err.cause, ExitCause::FullListParsingError);
        assert!(!s.observer.snapshot().is_valid());
        assert!(!has(&s.observer, "2"));
    }

    #[tokio::test]
    async fn malformed_listing_is_reported() {
        let s = setup(Vec::new()).await;
        s.drive.state().listing_error = Some(DriveError::ListingParse("bad size".into()));

        let err = s.observer.generate_initial_snapshot().await.unwrap_err();
        assert_eq!(err.code, ExitCode::LogicError);
        let issues = s.errors.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].exit_cause, Some(ExitCause::FullListParsingError));
    }

    // ------------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn create_and_edit_actions_update_snapshot() {
        let s = setup(vec![dir("2", "1", "Docs")]).await;
        s.observer.generate_initial_snapshot().await.unwrap();

        let new = file("10", "2", "new.txt");
        s.observer
            .process_actions(&[action("file_create", &new)])
            .await
            .unwrap();
        assert!(has(&s.observer, "10"));

        let edited = file("10", "2", "new.txt").with_times(10, 500).with_size(9);
        s.observer
            .process_actions(&[action("file_update", &edited)])
            .await
            .unwrap();
        let snapshot = s.observer.snapshot();
        assert_eq!(snapshot.read(|s| s.last_modified(&NodeId::new("10"))), Some(500));
        assert_eq!(snapshot.read(|s| s.size(&NodeId::new("10"))), 9);
    }

    #[tokio::test]
    async fn move_out_then_move_in_is_net_zero() {
        let s = setup(vec![dir("2", "1", "Docs"), file("3", "2", "a.txt")]).await;
        s.observer.generate_initial_snapshot().await.unwrap();
        let before = s.observer.snapshot().view();

        let item = file("3", "2", "a.txt");
        s.observer
            .process_actions(&[action("file_move_out", &item), action("file_move", &item)])
            .await
            .unwrap();

        let after = s.observer.snapshot().view();
        assert!(after.exists(&NodeId::new("3")));
        assert_eq!(after.item(&NodeId::new("3")), before.item(&NodeId::new("3")));
    }

    #[tokio::test]
    async fn move_out_after_move_in_is_ignored() {
        let s = setup(vec![
            dir("2", "1", "Docs"),
            dir("5", "1", "Other"),
            file("3", "2", "a.txt"),
        ])
        .await;
        s.observer.generate_initial_snapshot().await.unwrap();

        let moved = file("3", "5", "a.txt");
        s.observer
            .process_actions(&[action("file_move", &moved), action("file_move_out", &moved)])
            .await
            .unwrap();

        let snapshot = s.observer.snapshot().view();
        assert!(snapshot.exists(&NodeId::new("3")));
        assert_eq!(snapshot.parent_id(&NodeId::new("3")), Some(&NodeId::new("5")));
    }

    #[tokio::test]
    async fn moved_in_directory_is_explored() {
        let s = setup(Vec::new()).await;
        s.observer.generate_initial_snapshot().await.unwrap();
        s.drive.state().listings.insert(
            NodeId::new("20"),
            vec![file("21", "20", "inside.txt")],
        );

        s.observer
            .process_actions(&[action("file_move", &dir("20", "1", "Imported"))])
            .await
            .unwrap();

        assert!(has(&s.observer, "20"));
        assert!(has(&s.observer, "21"));
    }

    #[tokio::test]
    async fn trash_removes_item_and_clears_tmp_blacklist() {
        let s = setup(vec![file("3", "1", "a.txt")]).await;
        s.observer.generate_initial_snapshot().await.unwrap();
        s.nodes
            .blacklist_temporarily(1, ReplicaSide::Remote, &NodeId::new("3"))
            .await
            .unwrap();

        s.observer
            .process_actions(&[action("file_trash", &file("3", "1", "a.txt"))])
            .await
            .unwrap();

        assert!(!has(&s.observer, "3"));
        assert!(!s
            .nodes
            .contains(1, SyncNodeType::TmpRemoteBlacklist, &NodeId::new("3"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn access_right_actions_recheck_rights() {
        let s = setup(vec![file("3", "1", "kept.txt"), file("4", "1", "gone.txt")]).await;
        s.observer.generate_initial_snapshot().await.unwrap();

        let granted = file("6", "1", "granted.txt");
        let denied = file("7", "1", "denied.txt");
        {
            let mut state = s.drive.state();
            state.file_infos.insert(NodeId::new("6"), Ok(info(&granted)));
            state
                .file_infos
                .insert(NodeId::new("7"), Err(DriveError::Forbidden("no".into())));
            state
                .file_infos
                .insert(NodeId::new("3"), Ok(info(&file("3", "1", "kept.txt"))));
        }

        s.observer
            .process_actions(&[
                action("acl_insert", &granted),
                action("acl_user_insert", &denied),
                action("acl_remove", &file("3", "1", "kept.txt")),
                action("acl_team_remove", &file("4", "1", "gone.txt")),
            ])
            .await
            .unwrap();

        assert!(has(&s.observer, "6"));
        assert_eq!(
            s.observer.snapshot().read(|s| s.size(&NodeId::new("6"))),
            42,
            "metadata refreshed from file info"
        );
        assert!(!has(&s.observer, "7"));
        assert!(has(&s.observer, "3"));
        assert!(!has(&s.observer, "4"));
    }

    #[tokio::test]
    async fn rights_check_failure_invalidates_snapshot() {
        let s = setup(Vec::new()).await;
        s.observer.generate_initial_snapshot().await.unwrap();
        s.drive
            .state()
            .file_infos
            .insert(NodeId::new("6"), Err(DriveError::Timeout));

        let err = s
            .observer
            .process_actions(&[action("acl_insert", &file("6", "1", "x.txt"))])
            .await
            .unwrap_err();
        assert_eq!(err.code, ExitCode::BackError);
        assert!(!s.observer.snapshot().is_valid());
    }

    #[tokio::test]
    async fn warning_template_raises_issue_and_removes_item() {
        let s = setup(vec![file("3", "1", "notes.txt")]).await;
        s.templates.update(
            false,
            vec![ExclusionTemplate::new("*.secret").with_warning(true)],
        );
        s.observer.generate_initial_snapshot().await.unwrap();

        s.observer
            .process_actions(&[action("file_rename", &file("3", "1", "notes.secret"))])
            .await
            .unwrap();

        assert!(!has(&s.observer, "3"));
        let issues = s.errors.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].cancel, Some(CancelType::ExcludedByTemplate));
    }

    #[tokio::test]
    async fn unknown_actions_are_ignored() {
        let s = setup(Vec::new()).await;
        s.observer.generate_initial_snapshot().await.unwrap();

        s.observer
            .process_actions(&[action("file_teleport", &file("3", "1", "a.txt"))])
            .await
            .unwrap();
        assert!(!has(&s.observer, "3"));
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn no_changes_means_no_listing_request() {
        let s = setup(Vec::new()).await;
        s.observer.generate_initial_snapshot().await.unwrap();

        s.observer.process_events().await.unwrap();
        assert!(s.drive.state().continue_calls.is_empty());
    }

    #[tokio::test]
    async fn pages_are_applied_and_cursor_saved() {
        let s = setup(vec![dir("2", "1", "Docs")]).await;
        s.observer.generate_initial_snapshot().await.unwrap();
        {
            let mut state = s.drive.state();
            state.long_polls.push_back(Ok(true));
            state.pages.push_back(Ok(ListingPage {
                cursor: "c1".into(),
                has_more: true,
                actions: vec![action("file_create", &file("10", "2", "one.txt"))],
            }));
            state.pages.push_back(Ok(ListingPage {
                cursor: "c2".into(),
                has_more: false,
                actions: vec![action("file_create", &file("11", "2", "two.txt"))],
            }));
        }

        s.observer.process_events().await.unwrap();

        assert_eq!(s.drive.state().continue_calls, vec!["c0", "c1"]);
        assert_eq!(s.db.listing_cursor().await.unwrap().unwrap().cursor, "c2");
        assert!(has(&s.observer, "10"));
        assert!(has(&s.observer, "11"));
        assert!(!s.observer.is_updating());
    }

    #[tokio::test]
    async fn bad_gateway_long_poll_checks_changes_anyway() {
        let s = setup(Vec::new()).await;
        s.observer.generate_initial_snapshot().await.unwrap();
        s.drive.state().long_polls.push_back(Err(DriveError::Http {
            status: 502,
            body: String::new(),
        }));

        s.observer.process_events().await.unwrap();
        assert_eq!(s.drive.state().continue_calls.len(), 1);
    }

    #[tokio::test]
    async fn long_poll_timeout_is_reported() {
        let s = setup(Vec::new()).await;
        s.observer.generate_initial_snapshot().await.unwrap();
        s.drive.state().long_polls.push_back(Err(DriveError::Timeout));

        let err = s.observer.process_events().await.unwrap_err();
        assert_eq!(err.cause, ExitCause::NetworkTimeout);
        assert_eq!(s.errors.len(), 1);
        assert!(s.observer.snapshot().is_valid());
    }

    #[tokio::test]
    async fn forced_refresh_skips_long_poll() {
        let s = setup(Vec::new()).await;
        s.observer.generate_initial_snapshot().await.unwrap();

        s.observer.force_refresh();
        s.observer.process_events().await.unwrap();

        assert_eq!(s.drive.state().continue_calls.len(), 1);
        assert!(s.drive.state().long_polls.is_empty());
    }

    #[tokio::test]
    async fn forbidden_continuation_is_not_an_error() {
        let s = setup(Vec::new()).await;
        s.observer.generate_initial_snapshot().await.unwrap();
        {
            let mut state = s.drive.state();
            state.long_polls.push_back(Ok(true));
            state
                .pages
                .push_back(Err(DriveError::Forbidden("forbidden_error".into())));
        }

        s.observer.process_events().await.unwrap();
        assert!(s.observer.snapshot().is_valid());
    }

    #[tokio::test]
    async fn empty_cursor_invalidates_snapshot() {
        let s = setup(Vec::new()).await;
        s.drive.state().listing_cursor = String::new();
        s.observer.generate_initial_snapshot().await.unwrap();
        s.observer.force_refresh();

        s.observer.process_events().await.unwrap();

        assert!(!s.observer.snapshot().is_valid());
        assert!(s.drive.state().continue_calls.is_empty());
    }

    #[tokio::test]
    async fn run_stops_and_invalidates_snapshot() {
        let s = setup(vec![dir("2", "1", "Docs")]).await;
        let observer = Arc::new(s.observer);
        let task = {
            let observer = Arc::clone(&observer);
            tokio::spawn(async move { observer.run().await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while !observer.snapshot().is_valid() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("snapshot built");

        observer.control().stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("observer stopped")
            .unwrap()
            .unwrap();
        assert!(!observer.snapshot().is_valid());
    }

    #[test]
    fn only_unrecoverable_errors_are_fatal() {
        assert!(is_fatal(&WorkerError::new(ExitCode::DbError, ExitCause::Unknown)));
        assert!(is_fatal(&WorkerError::new(ExitCode::DataError, ExitCause::Unknown)));
        assert!(!is_fatal(&WorkerError::invalid_snapshot()));
        assert!(!is_fatal(&WorkerError::new(
            ExitCode::NetworkError,
            ExitCause::NetworkTimeout
        )));
    }

    #[tokio::test]
    async fn run_exits_on_unregistered_sync_profile() {
        let s = setup(vec![dir("2", "1", "Docs")]).await;
        let mut config = Config::default();
        config.sync.sync_db_id = 7;
        config.sync.root_remote_id = "1".into();
        config.sync.loop_sleep_ms = 10;
        let observer = RemoteFileSystemObserver::new(
            &config,
            s.drive.clone(),
            s.db.clone(),
            Arc::new(SyncNodeCache::new()),
            s.templates.clone(),
            s.errors.clone(),
            WorkerControl::new(),
        );

        let err = tokio::time::timeout(Duration::from_secs(5), observer.run())
            .await
            .expect("observer returned")
            .unwrap_err();

        assert_eq!(err.code, ExitCode::DataError);
        assert!(!observer.snapshot().is_valid());
    }
}
