//! User-facing sync issues
//!
//! A [`SyncIssue`] is what the engine hands to the error-reporting layer
//! through [`crate::ports::IErrorSink`]. Pass-level issues carry an exit
//! code/cause; node-level issues carry the affected item and either an
//! inconsistency or a cancel tag.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{ExitCause, ExitCode};
use super::node::{NodeId, NodeType, ReplicaSide};

/// Why a name or path cannot be synchronized as is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InconsistencyType {
    Case,
    ForbiddenChar,
    ReservedName,
    NameLength,
    PathLength,
    NotYetSupportedChar,
    DuplicateNames,
}

/// Why an individual change was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelType {
    Create,
    Edit,
    Move,
    Delete,
    AlreadyExistRemote,
    AlreadyExistLocal,
    MoveToBinFailed,
    TmpBlacklisted,
    ExcludedByTemplate,
    Hardlink,
}

/// Granularity of an issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueLevel {
    /// A whole pass or observer loop failed
    SyncPass,
    /// A single item is affected
    Node,
}

/// A structured error record for the UI/error-reporting layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIssue {
    pub sync_db_id: i64,
    pub level: IssueLevel,
    pub exit_code: Option<ExitCode>,
    pub exit_cause: Option<ExitCause>,
    pub side: Option<ReplicaSide>,
    pub node_id: Option<NodeId>,
    pub node_type: Option<NodeType>,
    pub path: Option<PathBuf>,
    pub inconsistency: Option<InconsistencyType>,
    pub cancel: Option<CancelType>,
    pub timestamp: DateTime<Utc>,
}

impl SyncIssue {
    /// A pass-level failure
    pub fn sync_pass(sync_db_id: i64, code: ExitCode, cause: ExitCause) -> Self {
        Self {
            sync_db_id,
            level: IssueLevel::SyncPass,
            exit_code: Some(code),
            exit_cause: Some(cause),
            side: None,
            node_id: None,
            node_type: None,
            path: None,
            inconsistency: None,
            cancel: None,
            timestamp: Utc::now(),
        }
    }

    /// An item-level issue; attach a tag with [`Self::with_inconsistency`]
    /// or [`Self::with_cancel`]
    pub fn node(
        sync_db_id: i64,
        side: ReplicaSide,
        node_id: NodeId,
        node_type: NodeType,
        path: PathBuf,
    ) -> Self {
        Self {
            sync_db_id,
            level: IssueLevel::Node,
            exit_code: None,
            exit_cause: None,
            side: Some(side),
            node_id: Some(node_id),
            node_type: Some(node_type),
            path: Some(path),
            inconsistency: None,
            cancel: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_inconsistency(mut self, inconsistency: InconsistencyType) -> Self {
        self.inconsistency = Some(inconsistency);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelType) -> Self {
        self.cancel = Some(cancel);
        self
    }

    #[must_use]
    pub fn with_exit(mut self, code: ExitCode, cause: ExitCause) -> Self {
        self.exit_code = Some(code);
        self.exit_cause = Some(cause);
        self
    }

    /// First normal component of the affected path, used to report an
    /// inconsistency only once per broken subtree
    #[must_use]
    pub fn root_segment(&self) -> Option<&Path> {
        self.path.as_deref().and_then(|p| {
            p.components().find_map(|c| match c {
                Component::Normal(seg) => Some(Path::new(seg)),
                _ => None,
            })
        })
    }
}
