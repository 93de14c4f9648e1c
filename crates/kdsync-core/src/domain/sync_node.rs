//! Categories of persisted node-id lists

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::{ExitCause, ExitCode, WorkerError};
use super::node::ReplicaSide;

/// Category of a persisted node-id set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncNodeType {
    /// Remote ids explicitly excluded by the user
    BlackList,
    /// Remote ids explicitly included, overriding the big-folder limit
    WhiteList,
    /// Remote ids waiting for user confirmation (e.g. oversized folders)
    UndecidedList,
    /// Local ids excluded for now after an access error
    TmpLocalBlacklist,
    /// Remote ids excluded for now after an access error
    TmpRemoteBlacklist,
}

impl SyncNodeType {
    pub const ALL: [SyncNodeType; 5] = [
        SyncNodeType::BlackList,
        SyncNodeType::WhiteList,
        SyncNodeType::UndecidedList,
        SyncNodeType::TmpLocalBlacklist,
        SyncNodeType::TmpRemoteBlacklist,
    ];

    /// Temporary blacklist of the given side
    #[must_use]
    pub fn tmp_blacklist(side: ReplicaSide) -> Self {
        match side {
            ReplicaSide::Local => SyncNodeType::TmpLocalBlacklist,
            ReplicaSide::Remote => SyncNodeType::TmpRemoteBlacklist,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncNodeType::BlackList => "blacklist",
            SyncNodeType::WhiteList => "whitelist",
            SyncNodeType::UndecidedList => "undecided",
            SyncNodeType::TmpLocalBlacklist => "tmp_local_blacklist",
            SyncNodeType::TmpRemoteBlacklist => "tmp_remote_blacklist",
        }
    }
}

impl Display for SyncNodeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncNodeType {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncNodeType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or(WorkerError::new(ExitCode::DataError, ExitCause::Unknown))
    }
}
