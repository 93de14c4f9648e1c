//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! engine. The observers and the operation worker depend on them, while the
//! implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`ISyncDb`] - Last agreed state, persisted node-id lists, listing cursor
//! - [`IRemoteDrive`] - Remote listing, cursor continuation, long-poll, file info
//! - [`IErrorSink`] - Structured issue reporting towards the UI layer

pub mod error_sink;
pub mod remote_drive;
pub mod sync_db;

pub use error_sink::IErrorSink;
pub use remote_drive::{
    DriveError, FullListing, IRemoteDrive, ListingPage, RemoteAction, RemoteFileInfo,
};
pub use sync_db::{ISyncDb, ListingCursor};
