//! Continuation, long-poll and file-info payloads
//!
//! Serde models for the JSON endpoints and their conversion into the
//! port-level types of `kdsync_core::ports`.

use kdsync_core::domain::{NodeId, NodeType, SyncTime};
use kdsync_core::ports::{ListingPage, RemoteAction, RemoteFileInfo};
use serde::Deserialize;

// ============================================================================
// Continuation
// ============================================================================

/// `data` object of `/files/listing/continue`
#[derive(Debug, Deserialize)]
pub struct ContinuePayload {
    pub cursor: String,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub actions: Vec<ActionPayload>,
}

#[derive(Debug, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub can_write: bool,
}

/// One entry of the `actions` array
#[derive(Debug, Deserialize)]
pub struct ActionPayload {
    pub action: String,
    pub file_id: i64,
    pub parent_id: i64,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub created_at: Option<SyncTime>,
    #[serde(default)]
    pub last_modified_at: Option<SyncTime>,
    pub file_type: String,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub symbolic_link: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
}

/// Last segment of a slash-separated server path
fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl ActionPayload {
    /// Path the item lives at after the action
    pub fn effective_path(&self) -> &str {
        match self.destination.as_deref() {
            Some(dest) if !dest.is_empty() => dest,
            _ => &self.path,
        }
    }
}

impl From<ActionPayload> for RemoteAction {
    fn from(p: ActionPayload) -> Self {
        let node_type = if p.file_type == "file" {
            NodeType::File
        } else {
            NodeType::Directory
        };
        let name = last_segment(p.effective_path()).to_string();
        // Directory sizes are derived from their children
        let size = match node_type {
            NodeType::File => p.size.unwrap_or(0),
            NodeType::Directory => 0,
        };

        RemoteAction {
            action: p.action,
            file_id: NodeId::from(p.file_id.to_string()),
            parent_id: NodeId::from(p.parent_id.to_string()),
            name,
            created_at: p.created_at.unwrap_or(0),
            last_modified: p.last_modified_at.unwrap_or(0),
            node_type,
            size,
            is_link: p.symbolic_link.is_some_and(|s| !s.is_empty()),
            can_write: p.capabilities.map(|c| c.can_write),
        }
    }
}

impl From<ContinuePayload> for ListingPage {
    fn from(p: ContinuePayload) -> Self {
        ListingPage {
            cursor: p.cursor,
            has_more: p.has_more,
            actions: p.actions.into_iter().map(RemoteAction::from).collect(),
        }
    }
}

// ============================================================================
// Long-poll
// ============================================================================

/// Body of `/files/listing/listen`
#[derive(Debug, Deserialize)]
pub struct LongPollPayload {
    #[serde(default)]
    pub changes: bool,
}

// ============================================================================
// File info
// ============================================================================

/// `data` object of `/files/{id}`
#[derive(Debug, Deserialize)]
pub struct FileInfoPayload {
    pub id: i64,
    #[serde(default)]
    pub parent_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub file_type: String,
    #[serde(default)]
    pub created_at: Option<SyncTime>,
    #[serde(default)]
    pub last_modified_at: Option<SyncTime>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub is_link: bool,
    #[serde(default)]
    pub symbolic_link: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
}

impl From<FileInfoPayload> for RemoteFileInfo {
    fn from(p: FileInfoPayload) -> Self {
        let node_type = if p.file_type == "dir" {
            NodeType::Directory
        } else {
            NodeType::File
        };
        RemoteFileInfo {
            id: NodeId::from(p.id.to_string()),
            parent_id: NodeId::from(p.parent_id.to_string()),
            name: p.name,
            node_type,
            created_at: p.created_at.unwrap_or(0),
            last_modified: p.last_modified_at.unwrap_or(0),
            size: p.size.unwrap_or(0),
            is_link: p.is_link || p.symbolic_link.is_some_and(|s| !s.is_empty()),
            can_write: p.capabilities.map_or(true, |c| c.can_write),
        }
    }
}
