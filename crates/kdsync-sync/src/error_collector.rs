//! In-memory [`IErrorSink`]
//!
//! Item-level inconsistencies are reported once per broken subtree: a second
//! issue with the same tag under the same top-level folder is dropped.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use kdsync_core::domain::{CancelType, InconsistencyType, IssueLevel, SyncIssue};
use kdsync_core::ports::IErrorSink;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IssueTag {
    Inconsistency(InconsistencyType),
    Cancel(CancelType),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    sync_db_id: i64,
    tag: IssueTag,
    root_segment: PathBuf,
}

#[derive(Default)]
struct Issues {
    list: Vec<SyncIssue>,
    seen: HashSet<DedupKey>,
}

/// Collects issues for the UI layer
#[derive(Default)]
pub struct ErrorCollector {
    inner: Mutex<Issues>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the collected issues, oldest first
    pub fn issues(&self) -> Vec<SyncIssue> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .list
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .list
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every issue and forgets what was reported
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.list.clear();
        inner.seen.clear();
    }

    fn dedup_key(issue: &SyncIssue) -> Option<DedupKey> {
        if issue.level != IssueLevel::Node {
            return None;
        }
        let tag = match (issue.inconsistency, issue.cancel) {
            (Some(i), _) => IssueTag::Inconsistency(i),
            (None, Some(c)) => IssueTag::Cancel(c),
            (None, None) => return None,
        };
        Some(DedupKey {
            sync_db_id: issue.sync_db_id,
            tag,
            root_segment: issue.root_segment()?.to_path_buf(),
        })
    }
}

impl IErrorSink for ErrorCollector {
    fn add_issue(&self, issue: SyncIssue) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = Self::dedup_key(&issue) {
            if !inner.seen.insert(key) {
                debug!(path = ?issue.path, "Issue already reported for this subtree");
                return;
            }
        }
        warn!(
            sync_db_id = issue.sync_db_id,
            level = ?issue.level,
            code = ?issue.exit_code,
            cause = ?issue.exit_cause,
            node_id = ?issue.node_id,
            path = ?issue.path,
            inconsistency = ?issue.inconsistency,
            cancel = ?issue.cancel,
            "Sync issue"
        );
        inner.list.push(issue);
    }
}
