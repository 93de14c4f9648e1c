//! Local snapshot maintenance
//!
//! [`LocalFileSystemObserver`] builds the local [`Snapshot`] by walking the
//! sync root, then keeps it current from `notify` events. Every event is
//! handled by re-reading the affected paths from disk, so dropped or
//! coalesced events only delay an update.
//!
//! ## Architecture
//!
//! ```text
//! inotify / FSEvents
//!       │
//!       ▼
//!  RecommendedWatcher ──→ mpsc::channel ──→ run loop ──→ LiveSnapshot
//! ```
//!
//! A watcher error invalidates the snapshot, which is rebuilt by a full walk
//! on the next iteration.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use kdsync_core::config::Config;
use kdsync_core::domain::{
    CancelType, ExitCause, ExitCode, NodeId, NodeType, ReplicaSide, SnapshotItem, SyncIssue,
    WorkerError,
};
use kdsync_core::ports::IErrorSink;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::control::WorkerControl;
use crate::exclusion::ExclusionTemplateCache;
use crate::io_helper::{file_id, io_err, IoHelper};
use crate::snapshot::{LiveSnapshot, Snapshot};

const EVENT_QUEUE: usize = 1024;

/// What the watcher thread hands over to the observer loop
#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchEvent {
    /// Paths to re-read, in the order the OS reported them
    Paths(Vec<PathBuf>),
    /// Events were lost; the snapshot must be rebuilt
    Rescan,
}

fn map_notify_event(event: &notify::Event) -> Option<WatchEvent> {
    if event.need_rescan() {
        return Some(WatchEvent::Rescan);
    }
    match event.kind {
        EventKind::Access(_) => None,
        _ if event.paths.is_empty() => None,
        _ => Some(WatchEvent::Paths(event.paths.clone())),
    }
}

// ============================================================================
// Walker
// ============================================================================

/// Reads items from disk and applies the local exclusion rules
#[derive(Clone)]
struct Walker {
    sync_db_id: i64,
    root: PathBuf,
    sync_hidden: bool,
    extended_log: bool,
    templates: Arc<ExclusionTemplateCache>,
    errors: Arc<dyn IErrorSink>,
    control: WorkerControl,
}

impl Walker {
    fn relative<'p>(&self, path: &'p Path) -> &'p Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    fn is_excluded(&self, path: &Path, item: &SnapshotItem) -> bool {
        let relative = self.relative(path);
        let exclusion = match self
            .templates
            .check_if_is_excluded(&self.root, relative, self.sync_hidden)
        {
            Ok(exclusion) => exclusion,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot check item attributes, item ignored");
                return true;
            }
        };
        let Some(exclusion) = exclusion else {
            return false;
        };
        if self.extended_log {
            debug!(path = %relative.display(), ?exclusion, "Local item excluded");
        }
        if exclusion.is_warning() {
            self.errors.add_issue(
                SyncIssue::node(
                    self.sync_db_id,
                    ReplicaSide::Local,
                    item.id.clone(),
                    item.node_type,
                    relative.to_path_buf(),
                )
                .with_cancel(CancelType::ExcludedByTemplate),
            );
        }
        true
    }

    /// Every non-excluded item below `dir`, parents before children
    fn walk(&self, dir: &Path, dir_id: &NodeId) -> Result<Vec<SnapshotItem>, WorkerError> {
        let mut items = Vec::new();
        let mut pending = vec![(dir.to_path_buf(), dir_id.clone())];
        while let Some((dir, dir_id)) = pending.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if dir != self.root && e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) if dir != self.root && e.kind() == io::ErrorKind::PermissionDenied => {
                    warn!(path = %dir.display(), "Directory is not searchable, content ignored");
                    self.errors.add_issue(
                        SyncIssue::node(
                            self.sync_db_id,
                            ReplicaSide::Local,
                            dir_id,
                            NodeType::Directory,
                            self.relative(&dir).to_path_buf(),
                        )
                        .with_exit(ExitCode::SystemError, ExitCause::NoSearchPermission),
                    );
                    continue;
                }
                Err(e) => return Err(io_err(&dir, &e)),
            };

            for entry in entries {
                if self.control.is_stopped() {
                    return Err(WorkerError::canceled());
                }
                let path = match entry {
                    Ok(entry) => entry.path(),
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "Failed to read directory entry");
                        continue;
                    }
                };
                let item = match IoHelper::item_at(&path, &dir_id) {
                    Ok(Some(item)) => item,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to read item, ignored");
                        continue;
                    }
                };
                if self.is_excluded(&path, &item) {
                    continue;
                }
                if item.is_dir() && !item.is_link {
                    pending.push((path, item.id.clone()));
                }
                items.push(item);
            }
        }
        Ok(items)
    }
}

// ============================================================================
// Observer
// ============================================================================

/// Keeps the local snapshot of one sync profile current
pub struct LocalFileSystemObserver {
    walker: Walker,
    root_id: NodeId,
    snapshot: Arc<LiveSnapshot>,
}

impl LocalFileSystemObserver {
    /// Binds the observer to `config.sync.local_root`
    ///
    /// # Errors
    ///
    /// `SystemError/FileAccessError` if the sync root cannot be read.
    pub fn new(
        config: &Config,
        templates: Arc<ExclusionTemplateCache>,
        errors: Arc<dyn IErrorSink>,
        control: WorkerControl,
    ) -> Result<Self, WorkerError> {
        let root = config.sync.local_root.clone();
        let meta = match IoHelper::metadata(&root) {
            Ok(Some(meta)) if meta.is_dir() => meta,
            Ok(_) => {
                warn!(path = %root.display(), "Sync root is missing or not a directory");
                return Err(WorkerError::new(ExitCode::SystemError, ExitCause::FileAccessError));
            }
            Err(e) => return Err(io_err(&root, &e)),
        };
        let root_id = file_id(&meta, &root);

        Ok(Self {
            snapshot: Arc::new(LiveSnapshot::new(ReplicaSide::Local, root_id.clone())),
            root_id,
            walker: Walker {
                sync_db_id: config.sync.sync_db_id,
                root,
                sync_hidden: config.sync.sync_hidden_files,
                extended_log: config.parameters.extended_log,
                templates,
                errors,
                control,
            },
        })
    }

    /// The live local snapshot, shared with the reconciliation pass
    pub fn snapshot(&self) -> Arc<LiveSnapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    pub fn control(&self) -> &WorkerControl {
        &self.walker.control
    }

    fn invalidate_snapshot(&self) {
        if self.snapshot.is_valid() {
            info!("Invalidating local snapshot");
        }
        self.snapshot.update(Snapshot::init);
    }

    /// Rebuilds the snapshot by walking the sync root
    ///
    /// # Errors
    ///
    /// `OperationCanceled` if stopped during the walk, `SystemError` if the
    /// root cannot be read. The snapshot is left invalid in both cases.
    pub async fn generate_initial_snapshot(&self) -> Result<(), WorkerError> {
        info!(root = %self.walker.root.display(), "Starting local snapshot generation");
        let start = Instant::now();
        self.snapshot.init();

        let walker = self.walker.clone();
        let root_id = self.root_id.clone();
        let walked = tokio::task::spawn_blocking(move || walker.walk(&walker.root, &root_id))
            .await
            .map_err(|e| {
                error!(error = %e, "Local snapshot walk panicked");
                WorkerError::new(ExitCode::SystemError, ExitCause::Unknown)
            })?;

        let items = match walked {
            Ok(items) if !self.walker.control.is_stopped() => items,
            Ok(_) => return Err(WorkerError::canceled()),
            Err(e) => {
                warn!(error = %e, "Local snapshot generation failed");
                self.invalidate_snapshot();
                return Err(e);
            }
        };

        let nb_items = self.snapshot.update(|snapshot| {
            for item in items {
                let id = item.id.clone();
                if let Err(e) = snapshot.update_item(item) {
                    warn!(node_id = %id, error = %e, "Local item rejected");
                }
            }
            snapshot.set_valid(true);
            snapshot.nb_items()
        });
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            items = nb_items,
            "Local snapshot generated"
        );
        Ok(())
    }

    /// Watches the sync root until stopped
    ///
    /// # Errors
    ///
    /// `SystemError` if the watcher cannot be set up or the root becomes
    /// unreadable. The snapshot is invalid on return.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let (tx, mut rx) = mpsc::channel::<WatchEvent>(EVENT_QUEUE);
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(event) => map_notify_event(&event),
                    Err(err) => {
                        error!(error = %err, "File watcher error");
                        Some(WatchEvent::Rescan)
                    }
                };
                if let Some(event) = event {
                    if let Err(e) = tx.blocking_send(event) {
                        debug!(error = %e, "Local observer is gone, dropping event");
                    }
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| {
            warn!(error = %e, "Failed to create file watcher");
            WorkerError::new(ExitCode::SystemError, ExitCause::Unknown)
        })?;
        watcher
            .watch(&self.walker.root, RecursiveMode::Recursive)
            .map_err(|e| {
                warn!(path = %self.walker.root.display(), error = %e, "Failed to watch sync root");
                WorkerError::new(ExitCode::SystemError, ExitCause::FileAccessError)
            })?;
        info!(path = %self.walker.root.display(), "Local observer started");

        let result = self.event_loop(&mut rx).await;
        self.invalidate_snapshot();
        info!("Local observer stopped");
        result
    }

    async fn event_loop(&self, rx: &mut mpsc::Receiver<WatchEvent>) -> Result<(), WorkerError> {
        let control = &self.walker.control;
        loop {
            if control.is_stopped() {
                return Ok(());
            }
            if !self.snapshot.is_valid() {
                match self.generate_initial_snapshot().await {
                    Ok(()) => {}
                    Err(e) if e.code == ExitCode::OperationCanceled => return Ok(()),
                    Err(e) => return Err(e),
                }
            }

            let event = tokio::select! {
                event = rx.recv() => event,
                _ = control.cancelled() => return Ok(()),
            };
            control.wait_if_paused().await;
            match event {
                Some(WatchEvent::Paths(paths)) => self.handle_paths(&paths),
                Some(WatchEvent::Rescan) => self.invalidate_snapshot(),
                None => {
                    warn!("File watcher channel closed");
                    return Err(WorkerError::new(ExitCode::SystemError, ExitCause::Unknown));
                }
            }
        }
    }

    /// Re-reads `paths` and updates the snapshot accordingly
    ///
    /// Paths are handled last to first, so that the destination of a rename
    /// is seen before its source.
    pub(crate) fn handle_paths(&self, paths: &[PathBuf]) {
        if !self.snapshot.is_valid() {
            return;
        }
        for path in paths.iter().rev() {
            if let Err(e) = self.refresh_path(path) {
                warn!(path = %path.display(), error = %e, "Failed to refresh local item, invalidating snapshot");
                self.invalidate_snapshot();
                return;
            }
        }
    }

    fn remove_path(&self, relative: &Path) {
        self.snapshot.update(|snapshot| {
            if let Some(id) = snapshot.item_id(relative) {
                if id != *snapshot.root_id() {
                    debug!(path = %relative.display(), node_id = %id, "Local item removed");
                    snapshot.remove_item(&id);
                }
            }
        });
    }

    fn refresh_path(&self, path: &Path) -> Result<(), WorkerError> {
        let Ok(relative) = path.strip_prefix(&self.walker.root) else {
            return Ok(());
        };
        if relative.as_os_str().is_empty() {
            return Ok(());
        }
        let Some(parent) = path.parent() else {
            return Ok(());
        };

        let parent_id = if parent == self.walker.root {
            self.root_id.clone()
        } else {
            match IoHelper::metadata(parent).map_err(|e| io_err(parent, &e))? {
                Some(meta) => file_id(&meta, parent),
                None => {
                    self.remove_path(relative);
                    return Ok(());
                }
            }
        };
        if parent_id != self.root_id && !self.snapshot.read(|s| s.exists(&parent_id)) {
            // inside an excluded or not yet known directory
            return Ok(());
        }

        let item = match IoHelper::item_at(path, &parent_id) {
            Ok(Some(item)) => item,
            Ok(None) => {
                self.remove_path(relative);
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!(path = %path.display(), "Item is not readable, ignored");
                return Ok(());
            }
            Err(e) => return Err(io_err(path, &e)),
        };

        if self.walker.is_excluded(path, &item) {
            let id = item.id;
            self.snapshot.update(|s| s.remove_item(&id));
            self.remove_path(relative);
            return Ok(());
        }

        let id = item.id.clone();
        let explore = item.is_dir() && !item.is_link;
        let inserted = self
            .snapshot
            .update(|s| s.update_item(item))
            .map_err(|e| {
                warn!(node_id = %id, error = %e, "Local item rejected");
                WorkerError::invalid_snapshot()
            })?;
        if self.walker.extended_log {
            debug!(path = %relative.display(), node_id = %id, inserted, "Local item updated");
        }

        if inserted && explore {
            // a directory moved in from outside the sync root arrives as a single event
            let children = self.walker.walk(path, &id)?;
            self.snapshot.update(|snapshot| {
                for child in children {
                    if let Err(e) = snapshot.update_item(child) {
                        warn!(error = %e, "Local item rejected");
                    }
                }
            });
        }
        Ok(())
    }
}
