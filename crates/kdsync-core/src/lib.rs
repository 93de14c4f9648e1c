//! kdsync Core - Domain model and ports of the change-detection engine
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain types** - `SnapshotItem`, `DbNode`, `FsOperation`, `FsOperationSet`, `SyncIssue`
//! - **Port definitions** - Traits for adapters: `ISyncDb`, `IRemoteDrive`, `IErrorSink`
//! - **Configuration** - YAML-backed settings shared by the observers and the worker
//!
//! # Architecture
//!
//! The domain module holds plain data with no I/O. Ports define the trait
//! interfaces that the `kdsync-cache` (SQLite) and `kdsync-drive` (HTTP)
//! adapter crates implement, and that `kdsync-sync` consumes.

pub mod config;
pub mod domain;
pub mod logging;
pub mod ports;
