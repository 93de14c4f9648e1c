//! Remote drive port (driven/secondary port)
//!
//! This module defines the requests the remote observer issues against the
//! drive server: a full recursive listing (bootstrap), cursor-based
//! continuation (incremental change batches), a long-poll (idle wait) and a
//! single-file lookup (rights re-check).
//!
//! ## Design Notes
//!
//! - Unlike the database port, failures are classified with [`DriveError`]
//!   because the observer reacts differently to timeouts, bad gateways,
//!   forbidden responses and unparsable listings.
//! - [`RemoteAction`] is a port-level DTO carrying the raw action code; the
//!   observer decides what each code means.

use std::collections::HashSet;

use thiserror::Error;

use crate::domain::{NodeId, NodeType, SnapshotItem, SyncTime};

/// Errors reported by a remote drive adapter
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriveError {
    /// The request did not complete in time
    #[error("Request timed out")]
    Timeout,

    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Unexpected HTTP status
    #[error("HTTP {status}: {body}")]
    Http {
        /// Response status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// The item exists but the account may not access it
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The item does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The access token was rejected
    #[error("Invalid token")]
    InvalidToken,

    /// The server flagged the request as failed in its JSON envelope
    #[error("API error {code}: {message}")]
    Api {
        /// Server error code, e.g. `forbidden_error`
        code: String,
        /// Human-readable description
        message: String,
    },

    /// The response body could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A row of the full listing is malformed
    #[error("Listing parse error: {0}")]
    ListingParse(String),

    /// The full listing ended without its end-of-file marker
    #[error("Listing truncated: end-of-file marker missing")]
    ListingTruncated,
}

impl DriveError {
    /// HTTP 502, which the server returns when a long-poll is cut short
    #[must_use]
    pub fn is_bad_gateway(&self) -> bool {
        matches!(self, DriveError::Http { status: 502, .. })
    }

    /// Access denied, either by status code or by the JSON envelope
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        match self {
            DriveError::Forbidden(_) => true,
            DriveError::Http { status, .. } => *status == 403,
            DriveError::Api { code, .. } => code == "forbidden_error",
            _ => false,
        }
    }

    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, DriveError::Timeout | DriveError::Network(_))
    }
}

/// Result of a full recursive listing
#[derive(Debug, Clone, Default)]
pub struct FullListing {
    /// Cursor positioned right after the listing
    pub cursor: String,
    /// Parsed rows, in server order
    pub items: Vec<SnapshotItem>,
}

/// One change record of an incremental batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAction {
    /// Raw action code, e.g. `file_move`
    pub action: String,
    pub file_id: NodeId,
    pub parent_id: NodeId,
    /// Last segment of the item's path or destination
    pub name: String,
    pub created_at: SyncTime,
    pub last_modified: SyncTime,
    pub node_type: NodeType,
    pub size: i64,
    pub is_link: bool,
    /// Present only when the server sent a capabilities object
    pub can_write: Option<bool>,
}

impl RemoteAction {
    /// Snapshot representation of the acted-upon item
    #[must_use]
    pub fn to_item(&self) -> SnapshotItem {
        SnapshotItem::new(
            self.file_id.clone(),
            self.parent_id.clone(),
            self.name.clone(),
            self.node_type,
        )
        .with_times(self.created_at, self.last_modified)
        .with_size(self.size)
        .with_link(self.is_link)
        .with_can_write(self.can_write.unwrap_or(true))
    }
}

/// One page of a cursor continuation
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub cursor: String,
    pub has_more: bool,
    pub actions: Vec<RemoteAction>,
}

/// Metadata of a single remote file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    pub created_at: SyncTime,
    pub last_modified: SyncTime,
    pub size: i64,
    pub is_link: bool,
    pub can_write: bool,
}

/// Port trait for the remote drive server
#[async_trait::async_trait]
pub trait IRemoteDrive: Send + Sync {
    /// Lists the whole subtree under `directory_id`, omitting `without_ids`
    async fn full_listing(
        &self,
        directory_id: &NodeId,
        without_ids: &HashSet<NodeId>,
    ) -> Result<FullListing, DriveError>;

    /// Fetches the next batch of changes after `cursor`
    async fn continue_listing(&self, cursor: &str) -> Result<ListingPage, DriveError>;

    /// Waits until changes are available after `cursor` or the server times
    /// out; returns whether changes are available
    async fn long_poll(&self, cursor: &str) -> Result<bool, DriveError>;

    async fn file_info(&self, file_id: &NodeId) -> Result<RemoteFileInfo, DriveError>;
}
