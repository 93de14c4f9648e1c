//! SQLite implementation of ISyncDb
//!
//! ## Type Mapping
//!
//! | Domain Type   | SQL Type | Strategy                                   |
//! |---------------|----------|--------------------------------------------|
//! | NodeId        | TEXT     | `as_str()` / `NodeId::new()`, NULL = unset |
//! | NodeType      | TEXT     | `as_str()` / `NodeType::from_db()`         |
//! | SyncTime      | INTEGER  | seconds since epoch                        |
//! | SyncNodeType  | TEXT     | `as_str()`                                 |

use std::collections::HashSet;
use std::path::PathBuf;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use kdsync_core::domain::{
    DbNode, DbNodeId, NodeId, NodeType, ReplicaSide, SyncNodeType, SyncTime,
};
use kdsync_core::ports::{ISyncDb, ListingCursor};

use crate::CacheError;

const NODE_COLUMNS: &str = "db_id, parent_db_id, name_local, name_remote, node_id_local, \
     node_id_remote, created, last_modified_local, last_modified_remote, type, size";

/// SQLite-backed sync database of one sync profile
pub struct SqliteSyncDb {
    pool: SqlitePool,
}

impl SqliteSyncDb {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the root row if the database is empty and returns its id
    ///
    /// The root has no parent and empty names on both sides.
    pub async fn init_root(
        &self,
        local_root_id: &NodeId,
        remote_root_id: &NodeId,
    ) -> Result<DbNodeId, CacheError> {
        if let Some(row) = sqlx::query("SELECT db_id FROM nodes WHERE parent_db_id IS NULL")
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(row.try_get("db_id")?);
        }

        let result = sqlx::query(
            "INSERT INTO nodes (parent_db_id, name_local, name_remote, node_id_local, \
             node_id_remote, type, size) VALUES (NULL, '', '', ?, ?, ?, 0)",
        )
        .bind(local_root_id.as_str())
        .bind(remote_root_id.as_str())
        .bind(NodeType::Directory.as_str())
        .execute(&self.pool)
        .await?;

        debug!(local = %local_root_id, remote = %remote_root_id, "Sync root row created");
        Ok(result.last_insert_rowid())
    }

    async fn parent_and_name(
        &self,
        db_id: DbNodeId,
        side: ReplicaSide,
    ) -> Result<Option<(Option<DbNodeId>, String)>, CacheError> {
        let sql = format!(
            "SELECT parent_db_id, {} AS name FROM nodes WHERE db_id = ?",
            name_column(side)
        );
        let row = sqlx::query(&sql)
            .bind(db_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some((row.try_get("parent_db_id")?, row.try_get("name")?))),
            None => Ok(None),
        }
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn id_column(side: ReplicaSide) -> &'static str {
    match side {
        ReplicaSide::Local => "node_id_local",
        ReplicaSide::Remote => "node_id_remote",
    }
}

fn name_column(side: ReplicaSide) -> &'static str {
    match side {
        ReplicaSide::Local => "name_local",
        ReplicaSide::Remote => "name_remote",
    }
}

fn row_to_node(row: &SqliteRow) -> Result<DbNode, CacheError> {
    let node_type: String = row.try_get("type")?;
    let local: Option<String> = row.try_get("node_id_local")?;
    let remote: Option<String> = row.try_get("node_id_remote")?;
    Ok(DbNode {
        db_id: row.try_get("db_id")?,
        parent_db_id: row.try_get("parent_db_id")?,
        name_local: row.try_get("name_local")?,
        name_remote: row.try_get("name_remote")?,
        node_id_local: local.map(NodeId::new),
        node_id_remote: remote.map(NodeId::new),
        created: row.try_get("created")?,
        last_modified_local: row.try_get("last_modified_local")?,
        last_modified_remote: row.try_get("last_modified_remote")?,
        node_type: NodeType::from_db(&node_type),
        size: row.try_get("size")?,
    })
}

// ============================================================================
// ISyncDb
// ============================================================================

#[async_trait::async_trait]
impl ISyncDb for SqliteSyncDb {
    async fn root_node(&self) -> anyhow::Result<DbNode> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE parent_db_id IS NULL");
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(CacheError::from)?
            .ok_or_else(|| CacheError::CorruptedRow("sync root row is missing".into()))?;
        Ok(row_to_node(&row)?)
    }

    async fn db_ids(&self) -> anyhow::Result<Vec<DbNodeId>> {
        let rows = sqlx::query("SELECT db_id FROM nodes ORDER BY db_id")
            .fetch_all(&self.pool)
            .await
            .map_err(CacheError::from)?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: DbNodeId = row.try_get("db_id").map_err(CacheError::from)?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn node(&self, db_id: DbNodeId) -> anyhow::Result<Option<DbNode>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE db_id = ?");
        let row = sqlx::query(&sql)
            .bind(db_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(CacheError::from)?;
        Ok(row.as_ref().map(row_to_node).transpose()?)
    }

    async fn path(&self, db_id: DbNodeId, side: ReplicaSide) -> anyhow::Result<Option<PathBuf>> {
        let mut names = Vec::new();
        let mut current = Some(db_id);
        let mut first = true;

        while let Some(id) = current {
            let Some((parent, name)) = self.parent_and_name(id, side).await? else {
                if first {
                    return Ok(None);
                }
                return Err(CacheError::CorruptedRow(format!("dangling parent id {id}")).into());
            };
            first = false;
            if parent.is_some() {
                names.push(name);
            }
            current = parent;
        }

        Ok(Some(names.iter().rev().collect()))
    }

    async fn db_id(
        &self,
        side: ReplicaSide,
        node_id: &NodeId,
    ) -> anyhow::Result<Option<DbNodeId>> {
        let sql = format!("SELECT db_id FROM nodes WHERE {} = ?", id_column(side));
        let row = sqlx::query(&sql)
            .bind(node_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(CacheError::from)?;
        let id: Option<DbNodeId> = row
            .map(|r| r.try_get("db_id"))
            .transpose()
            .map_err(CacheError::from)?;
        Ok(id)
    }

    async fn parent(&self, side: ReplicaSide, node_id: &NodeId) -> anyhow::Result<Option<NodeId>> {
        let column = id_column(side);
        let sql = format!(
            "SELECT p.{column} AS parent_id FROM nodes n \
             JOIN nodes p ON p.db_id = n.parent_db_id WHERE n.{column} = ?"
        );
        let row = sqlx::query(&sql)
            .bind(node_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(CacheError::from)?;
        let parent: Option<Option<String>> = row
            .map(|r| r.try_get("parent_id"))
            .transpose()
            .map_err(CacheError::from)?;
        Ok(parent.flatten().map(NodeId::new))
    }

    async fn corresponding_node_id(
        &self,
        side: ReplicaSide,
        node_id: &NodeId,
    ) -> anyhow::Result<Option<NodeId>> {
        let sql = format!(
            "SELECT {} AS other FROM nodes WHERE {} = ?",
            id_column(side.other()),
            id_column(side)
        );
        let row = sqlx::query(&sql)
            .bind(node_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(CacheError::from)?;
        let other: Option<Option<String>> = row
            .map(|r| r.try_get("other"))
            .transpose()
            .map_err(CacheError::from)?;
        Ok(other.flatten().map(NodeId::new))
    }

    async fn insert_node(&self, node: &DbNode) -> anyhow::Result<DbNodeId> {
        let result = sqlx::query(
            "INSERT INTO nodes (parent_db_id, name_local, name_remote, node_id_local, \
             node_id_remote, created, last_modified_local, last_modified_remote, type, size) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(node.parent_db_id)
        .bind(&node.name_local)
        .bind(&node.name_remote)
        .bind(node.node_id_local.as_ref().map(NodeId::as_str))
        .bind(node.node_id_remote.as_ref().map(NodeId::as_str))
        .bind(node.created)
        .bind(node.last_modified_local)
        .bind(node.last_modified_remote)
        .bind(node.node_type.as_str())
        .bind(node.size)
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;
        Ok(result.last_insert_rowid())
    }

    async fn update_node(&self, node: &DbNode) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE nodes SET parent_db_id = ?, name_local = ?, name_remote = ?, \
             node_id_local = ?, node_id_remote = ?, created = ?, last_modified_local = ?, \
             last_modified_remote = ?, type = ?, size = ? WHERE db_id = ?",
        )
        .bind(node.parent_db_id)
        .bind(&node.name_local)
        .bind(&node.name_remote)
        .bind(node.node_id_local.as_ref().map(NodeId::as_str))
        .bind(node.node_id_remote.as_ref().map(NodeId::as_str))
        .bind(node.created)
        .bind(node.last_modified_local)
        .bind(node.last_modified_remote)
        .bind(node.node_type.as_str())
        .bind(node.size)
        .bind(node.db_id)
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_node(&self, db_id: DbNodeId) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM nodes WHERE db_id = ?")
            .bind(db_id)
            .execute(&self.pool)
            .await
            .map_err(CacheError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn select_all_sync_nodes(
        &self,
        node_type: SyncNodeType,
    ) -> anyhow::Result<HashSet<NodeId>> {
        let rows = sqlx::query("SELECT node_id FROM sync_nodes WHERE type = ?")
            .bind(node_type.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(CacheError::from)?;
        let mut ids = HashSet::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("node_id").map_err(CacheError::from)?;
            ids.insert(NodeId::new(id));
        }
        Ok(ids)
    }

    async fn update_all_sync_nodes(
        &self,
        node_type: SyncNodeType,
        ids: &HashSet<NodeId>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.map_err(CacheError::from)?;
        sqlx::query("DELETE FROM sync_nodes WHERE type = ?")
            .bind(node_type.as_str())
            .execute(&mut *tx)
            .await
            .map_err(CacheError::from)?;
        for id in ids {
            sqlx::query("INSERT INTO sync_nodes (node_id, type) VALUES (?, ?)")
                .bind(id.as_str())
                .bind(node_type.as_str())
                .execute(&mut *tx)
                .await
                .map_err(CacheError::from)?;
        }
        tx.commit().await.map_err(CacheError::from)?;
        debug!(list = %node_type, count = ids.len(), "Sync node list replaced");
        Ok(())
    }

    async fn listing_cursor(&self) -> anyhow::Result<Option<ListingCursor>> {
        let row = sqlx::query("SELECT cursor, timestamp FROM listing_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(CacheError::from)?;
        match row {
            Some(row) => Ok(Some(ListingCursor {
                cursor: row.try_get("cursor").map_err(CacheError::from)?,
                timestamp: row.try_get("timestamp").map_err(CacheError::from)?,
            })),
            None => Ok(None),
        }
    }

    async fn set_listing_cursor(&self, cursor: &str, timestamp: SyncTime) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO listing_cursor (id, cursor, timestamp) VALUES (1, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET cursor = excluded.cursor, timestamp = excluded.timestamp",
        )
        .bind(cursor)
        .bind(timestamp)
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;
        Ok(())
    }
}
