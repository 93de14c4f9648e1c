//! kdsync Drive - Remote drive API client
//!
//! Provides an async client for the endpoints the remote observer needs:
//! - Full recursive listing in CSV form (snapshot bootstrap)
//! - Cursor continuation returning batches of change actions
//! - Long-poll notification of pending changes
//! - Single-file metadata lookup (access-right re-checks)
//!
//! ## Modules
//!
//! - [`client`] - Authenticated HTTP client and status mapping
//! - [`listing`] - CSV full-listing parser
//! - [`changes`] - Continuation, long-poll and file-info payloads
//! - [`provider`] - `IRemoteDrive` implementation

pub mod changes;
pub mod client;
pub mod listing;
pub mod provider;

pub use client::DriveClient;
pub use kdsync_core::ports::DriveError;
