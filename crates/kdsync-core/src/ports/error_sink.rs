//! Error sink port
//!
//! The engine never surfaces item-level problems through return values: a
//! single unsynchronizable item must not abort a pass. They are pushed to an
//! [`IErrorSink`] instead, which the UI layer drains.

use crate::domain::SyncIssue;

/// Receives structured issues raised by the observers and the worker
pub trait IErrorSink: Send + Sync {
    /// Records one issue; implementations may de-duplicate
    fn add_issue(&self, issue: SyncIssue);
}
