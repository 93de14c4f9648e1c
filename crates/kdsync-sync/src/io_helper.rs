//! Filesystem probes
//!
//! [`LocalProbe`] is the seam between the engine and the local disk: the
//! reconciliation pass re-checks existence, identity and rights through it
//! before trusting a snapshot. [`IoHelper`] is the real implementation.

use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use kdsync_core::domain::{ExitCause, ExitCode, NodeId, NodeType, SnapshotItem, SyncTime, WorkerError};
use tracing::warn;

/// Filesystem checks used by the reconciliation pass
pub trait LocalProbe: Send + Sync {
    /// `Ok(false)` if nothing exists at `path`
    fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Identity of the item at `path`, `None` if nothing exists there
    fn node_id(&self, path: &Path) -> io::Result<Option<NodeId>>;

    /// Whether the current user may modify the item
    fn can_write(&self, path: &Path) -> io::Result<bool>;

    /// Whether the item is hidden (dot-file, or hidden flag where supported)
    fn is_hidden(&self, path: &Path) -> io::Result<bool>;
}

/// [`LocalProbe`] backed by the real filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct IoHelper;

/// Maps a filesystem failure to the worker error reported for it
pub(crate) fn io_err(path: &Path, e: &io::Error) -> WorkerError {
    warn!(path = %path.display(), error = %e, "Local filesystem access failed");
    let cause = if e.kind() == io::ErrorKind::InvalidInput {
        ExitCause::InvalidName
    } else {
        ExitCause::FileAccessError
    };
    WorkerError::new(ExitCode::SystemError, cause)
}

fn not_found(e: &io::Error) -> bool {
    // ENOTDIR: a path component is a regular file
    e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ENOTDIR)
}

impl IoHelper {
    /// `symlink_metadata` with "does not exist" mapped to `None`
    pub fn metadata(path: &Path) -> io::Result<Option<Metadata>> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Builds a snapshot item for the entry at `path`
    ///
    /// Returns `None` if the entry vanished in the meantime.
    pub fn item_at(path: &Path, parent_id: &NodeId) -> io::Result<Option<SnapshotItem>> {
        let Some(meta) = Self::metadata(path)? else {
            return Ok(None);
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let node_type = if meta.is_dir() {
            NodeType::Directory
        } else {
            NodeType::File
        };
        let (created_at, last_modified) = timestamps(&meta);
        let size = if meta.is_dir() { 0 } else { meta.len() as i64 };

        Ok(Some(
            SnapshotItem::new(file_id(&meta, path), parent_id.clone(), name, node_type)
                .with_times(created_at, last_modified)
                .with_size(size)
                .with_link(meta.file_type().is_symlink()),
        ))
    }
}

impl LocalProbe for IoHelper {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(Self::metadata(path)?.is_some())
    }

    fn node_id(&self, path: &Path) -> io::Result<Option<NodeId>> {
        Ok(Self::metadata(path)?.map(|meta| file_id(&meta, path)))
    }

    #[cfg(unix)]
    fn can_write(&self, path: &Path) -> io::Result<bool> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
        let rc = unsafe { libc::access(c_path.as_ptr(), libc::W_OK) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EROFS) | Some(libc::EPERM) => Ok(false),
            _ => Err(err),
        }
    }

    #[cfg(not(unix))]
    fn can_write(&self, path: &Path) -> io::Result<bool> {
        Ok(!std::fs::symlink_metadata(path)?.permissions().readonly())
    }

    fn is_hidden(&self, path: &Path) -> io::Result<bool> {
        let Some(meta) = Self::metadata(path)? else {
            return Ok(false);
        };
        let dot_file = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('.'));
        Ok(dot_file || has_hidden_flag(&meta))
    }
}

#[cfg(target_os = "macos")]
fn has_hidden_flag(meta: &Metadata) -> bool {
    use std::os::macos::fs::MetadataExt;
    meta.st_flags() & libc::UF_HIDDEN != 0
}

#[cfg(not(target_os = "macos"))]
fn has_hidden_flag(_meta: &Metadata) -> bool {
    false
}

/// Stable identity of a filesystem entry (the inode number on Unix)
#[cfg(unix)]
pub fn file_id(meta: &Metadata, _path: &Path) -> NodeId {
    use std::os::unix::fs::MetadataExt;
    NodeId::from(meta.ino())
}

#[cfg(not(unix))]
pub fn file_id(_meta: &Metadata, path: &Path) -> NodeId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    NodeId::from(hasher.finish())
}

/// Creation and modification times in seconds since the epoch
///
/// Falls back to the modification time where the creation time is unavailable.
pub fn timestamps(meta: &Metadata) -> (SyncTime, SyncTime) {
    let secs = |t: std::io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as SyncTime)
    };
    let modified = secs(meta.modified()).unwrap_or(0);
    let created = secs(meta.created()).unwrap_or(modified);
    (created, modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_path_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(!IoHelper.exists(&missing).unwrap());
        assert_eq!(IoHelper.node_id(&missing).unwrap(), None);
        assert!(!IoHelper.is_hidden(&missing).unwrap());
    }

    #[test]
    fn node_id_is_stable_for_same_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();
        let first = IoHelper.node_id(&path).unwrap().unwrap();
        std::fs::write(&path, b"abcdef").unwrap();
        assert_eq!(IoHelper.node_id(&path).unwrap(), Some(first));
    }

    #[test]
    fn dot_files_are_hidden() {
        let dir = TempDir::new().unwrap();
        let hidden = dir.path().join(".secret");
        let visible = dir.path().join("plain");
        std::fs::write(&hidden, b"").unwrap();
        std::fs::write(&visible, b"").unwrap();
        assert!(IoHelper.is_hidden(&hidden).unwrap());
        assert!(!IoHelper.is_hidden(&visible).unwrap());
    }

    #[test]
    fn item_at_reads_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, [0u8; 12]).unwrap();

        let item = IoHelper::item_at(&path, &NodeId::new("p"))
            .unwrap()
            .expect("file exists");
        assert_eq!(item.name, "data.bin");
        assert_eq!(item.size, 12);
        assert_eq!(item.parent_id, NodeId::new("p"));
        assert_eq!(item.node_type, NodeType::File);
        assert!(item.last_modified > 0);
    }

    #[test]
    fn owner_can_write_own_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w.txt");
        std::fs::write(&path, b"").unwrap();
        assert!(IoHelper.can_write(&path).unwrap());
    }
}
