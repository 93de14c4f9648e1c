//! Per-profile cache of persisted node-id lists
//!
//! Every sync profile owns five lists (blacklist, whitelist, undecided list
//! and one temporary blacklist per side). They are read on every
//! reconciliation pass but rarely written, so the whole cache sits behind a
//! single async mutex and each list is loaded from the profile's database
//! on first access.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use kdsync_core::domain::{
    ExitCause, ExitCode, NodeId, ReplicaSide, SyncNodeType, WorkerError,
};
use kdsync_core::ports::ISyncDb;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct ProfileNodes {
    db: Arc<dyn ISyncDb>,
    lists: HashMap<SyncNodeType, HashSet<NodeId>>,
}

impl ProfileNodes {
    async fn list(&mut self, node_type: SyncNodeType) -> Result<&mut HashSet<NodeId>, WorkerError> {
        if !self.lists.contains_key(&node_type) {
            let ids = self.db.select_all_sync_nodes(node_type).await.map_err(|e| {
                warn!(%node_type, error = %e, "Failed to load sync node list");
                WorkerError::db_access()
            })?;
            debug!(%node_type, count = ids.len(), "Loaded sync node list");
            self.lists.insert(node_type, ids);
        }
        Ok(self.lists.entry(node_type).or_default())
    }

    async fn persist(&mut self, node_type: SyncNodeType, ids: HashSet<NodeId>) -> Result<(), WorkerError> {
        self.db
            .update_all_sync_nodes(node_type, &ids)
            .await
            .map_err(|e| {
                warn!(%node_type, error = %e, "Failed to persist sync node list");
                WorkerError::db_access()
            })?;
        self.lists.insert(node_type, ids);
        Ok(())
    }
}

/// Cached access to the node-id lists of every registered sync profile
#[derive(Default)]
pub struct SyncNodeCache {
    profiles: Mutex<HashMap<i64, ProfileNodes>>,
}

fn unknown_profile(sync_db_id: i64) -> WorkerError {
    warn!(sync_db_id, "Sync profile is not registered in the node cache");
    WorkerError::new(ExitCode::DataError, ExitCause::Unknown)
}

impl SyncNodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a profile and eagerly loads its lists
    pub async fn init_cache(&self, sync_db_id: i64, db: Arc<dyn ISyncDb>) -> Result<(), WorkerError> {
        let mut profile = ProfileNodes {
            db,
            lists: HashMap::new(),
        };
        for node_type in SyncNodeType::ALL {
            profile.list(node_type).await?;
        }
        self.profiles.lock().await.insert(sync_db_id, profile);
        info!(sync_db_id, "Sync node cache initialized");
        Ok(())
    }

    /// Forgets a profile; its persisted lists are left untouched
    pub async fn clear(&self, sync_db_id: i64) {
        if self.profiles.lock().await.remove(&sync_db_id).is_some() {
            info!(sync_db_id, "Sync node cache cleared");
        }
    }

    /// Copy of one list
    ///
    /// # Errors
    ///
    /// `DataError` if the profile is unknown, `DbError` if the list cannot be loaded.
    pub async fn sync_nodes(
        &self,
        sync_db_id: i64,
        node_type: SyncNodeType,
    ) -> Result<HashSet<NodeId>, WorkerError> {
        let mut profiles = self.profiles.lock().await;
        let profile = profiles
            .get_mut(&sync_db_id)
            .ok_or_else(|| unknown_profile(sync_db_id))?;
        Ok(profile.list(node_type).await?.clone())
    }

    /// Replaces one list and persists it
    pub async fn update(
        &self,
        sync_db_id: i64,
        node_type: SyncNodeType,
        ids: HashSet<NodeId>,
    ) -> Result<(), WorkerError> {
        let mut profiles = self.profiles.lock().await;
        let profile = profiles
            .get_mut(&sync_db_id)
            .ok_or_else(|| unknown_profile(sync_db_id))?;
        debug!(sync_db_id, %node_type, count = ids.len(), "Updating sync node list");
        profile.persist(node_type, ids).await
    }

    /// Removes one id from every list of the profile
    pub async fn delete_sync_node(&self, sync_db_id: i64, node_id: &NodeId) -> Result<(), WorkerError> {
        let mut profiles = self.profiles.lock().await;
        let profile = profiles
            .get_mut(&sync_db_id)
            .ok_or_else(|| unknown_profile(sync_db_id))?;
        for node_type in SyncNodeType::ALL {
            let list = profile.list(node_type).await?;
            if list.contains(node_id) {
                let mut ids = list.clone();
                ids.remove(node_id);
                profile.persist(node_type, ids).await?;
            }
        }
        Ok(())
    }

    pub async fn contains(
        &self,
        sync_db_id: i64,
        node_type: SyncNodeType,
        node_id: &NodeId,
    ) -> Result<bool, WorkerError> {
        let mut profiles = self.profiles.lock().await;
        let profile = profiles
            .get_mut(&sync_db_id)
            .ok_or_else(|| unknown_profile(sync_db_id))?;
        Ok(profile.list(node_type).await?.contains(node_id))
    }

    /// `true` if the id is in any list of the profile
    pub async fn contains_any(&self, sync_db_id: i64, node_id: &NodeId) -> Result<bool, WorkerError> {
        for node_type in SyncNodeType::ALL {
            if self.contains(sync_db_id, node_type, node_id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Adds an id to the temporary blacklist of `side`
    pub async fn blacklist_temporarily(
        &self,
        sync_db_id: i64,
        side: ReplicaSide,
        node_id: &NodeId,
    ) -> Result<(), WorkerError> {
        let node_type = SyncNodeType::tmp_blacklist(side);
        let mut ids = self.sync_nodes(sync_db_id, node_type).await?;
        if ids.insert(node_id.clone()) {
            info!(sync_db_id, %side, %node_id, "Item blacklisted temporarily");
            self.update(sync_db_id, node_type, ids).await?;
        }
        Ok(())
    }

    /// Removes an id from the temporary blacklist of `side`
    pub async fn remove_from_tmp_blacklist(
        &self,
        sync_db_id: i64,
        side: ReplicaSide,
        node_id: &NodeId,
    ) -> Result<(), WorkerError> {
        let node_type = SyncNodeType::tmp_blacklist(side);
        let mut ids = self.sync_nodes(sync_db_id, node_type).await?;
        if ids.remove(node_id) {
            debug!(sync_db_id, %side, %node_id, "Item removed from temporary blacklist");
            self.update(sync_db_id, node_type, ids).await?;
        }
        Ok(())
    }

    /// Empties both temporary blacklists of the profile
    pub async fn clear_tmp_blacklists(&self, sync_db_id: i64) -> Result<(), WorkerError> {
        for side in ReplicaSide::ALL {
            self.update(sync_db_id, SyncNodeType::tmp_blacklist(side), HashSet::new())
                .await?;
        }
        Ok(())
    }
}
