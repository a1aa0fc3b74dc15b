//! Conflict store repository

use crate::error::{Error, Result};
use crate::models::{
    ConflictId, ConflictResolution, ConflictStatus, DataConflict, VersionSnapshot,
};
use crate::util::{datetime_from_millis, unix_millis_now};
use libsql::{params, Connection, Row};
use serde_json::Value;

const SELECT_COLUMNS: &str = "SELECT id, user_id, data_type, data_id,
    local_timestamp, local_data, local_device_id,
    remote_timestamp, remote_data, remote_device_id,
    conflict_type, status, resolution_strategy, resolved_by, resolved_at, resolution_data,
    created_at, updated_at
    FROM data_conflicts";

/// Trait for conflict storage operations (async)
#[allow(async_fn_in_trait)]
pub trait ConflictRepository {
    /// Persist a newly detected conflict
    async fn insert(&self, conflict: &DataConflict) -> Result<()>;

    /// Fetch a conflict by id
    async fn get(&self, id: &ConflictId) -> Result<Option<DataConflict>>;

    /// List a user's conflicts with the given status, newest first
    async fn list(&self, user_id: &str, status: ConflictStatus) -> Result<Vec<DataConflict>>;

    /// Move a pending conflict to `resolved`.
    ///
    /// Returns `false` if the conflict is missing or no longer pending.
    async fn mark_resolved(&self, id: &ConflictId, resolution: &ConflictResolution)
        -> Result<bool>;

    /// Move a pending conflict to `discarded`.
    ///
    /// Returns `false` if the conflict is missing or no longer pending.
    async fn mark_discarded(&self, id: &ConflictId) -> Result<bool>;
}

/// libSQL implementation of `ConflictRepository`
pub struct LibSqlConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &Row) -> Result<DataConflict> {
        let id: String = row.get(0)?;
        let data_type: String = row.get(2)?;
        let local_data: String = row.get(5)?;
        let remote_data: String = row.get(8)?;
        let conflict_type: String = row.get(10)?;
        let status: String = row.get(11)?;
        let strategy: Option<String> = row.get(12)?;
        let resolved_by: Option<String> = row.get(13)?;
        let resolved_at: Option<i64> = row.get(14)?;
        let resolution_data: Option<String> = row.get(15)?;

        let resolution = match (strategy, resolved_by, resolved_at) {
            (Some(strategy), Some(resolved_by), Some(resolved_at)) => Some(ConflictResolution {
                strategy: strategy.parse()?,
                resolved_by: resolved_by.parse()?,
                resolved_at: datetime_from_millis(resolved_at),
                resolution_data: resolution_data
                    .map(|data| serde_json::from_str::<Value>(&data))
                    .transpose()?,
            }),
            _ => None,
        };

        Ok(DataConflict {
            id: id
                .parse()
                .map_err(|_| Error::Database(format!("invalid conflict id `{id}`")))?,
            user_id: row.get(1)?,
            data_type: data_type.parse()?,
            data_id: row.get(3)?,
            local_version: VersionSnapshot {
                timestamp: datetime_from_millis(row.get(4)?),
                data: serde_json::from_str(&local_data)?,
                device_id: row.get(6)?,
            },
            remote_version: VersionSnapshot {
                timestamp: datetime_from_millis(row.get(7)?),
                data: serde_json::from_str(&remote_data)?,
                device_id: row.get(9)?,
            },
            conflict_type: conflict_type.parse()?,
            status: status.parse()?,
            resolution,
            created_at: datetime_from_millis(row.get(16)?),
            updated_at: datetime_from_millis(row.get(17)?),
        })
    }
}

impl ConflictRepository for LibSqlConflictRepository<'_> {
    async fn insert(&self, conflict: &DataConflict) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO data_conflicts (
                    id, user_id, data_type, data_id,
                    local_timestamp, local_data, local_device_id,
                    remote_timestamp, remote_data, remote_device_id,
                    conflict_type, status, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    conflict.id.as_str(),
                    conflict.user_id.as_str(),
                    conflict.data_type.as_str(),
                    conflict.data_id.as_str(),
                    conflict.local_version.timestamp.timestamp_millis(),
                    serde_json::to_string(&conflict.local_version.data)?,
                    conflict.local_version.device_id.clone(),
                    conflict.remote_version.timestamp.timestamp_millis(),
                    serde_json::to_string(&conflict.remote_version.data)?,
                    conflict.remote_version.device_id.clone(),
                    conflict.conflict_type.as_str(),
                    conflict.status.as_str(),
                    conflict.created_at.timestamp_millis(),
                    conflict.updated_at.timestamp_millis()
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &ConflictId) -> Result<Option<DataConflict>> {
        let mut rows = self
            .conn
            .query(&format!("{SELECT_COLUMNS} WHERE id = ?"), [id.as_str()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_conflict(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, user_id: &str, status: ConflictStatus) -> Result<Vec<DataConflict>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "{SELECT_COLUMNS}
                     WHERE user_id = ? AND status = ?
                     ORDER BY created_at DESC, id DESC"
                ),
                params![user_id, status.as_str()],
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(Self::parse_conflict(&row)?);
        }
        Ok(conflicts)
    }

    async fn mark_resolved(
        &self,
        id: &ConflictId,
        resolution: &ConflictResolution,
    ) -> Result<bool> {
        let resolution_data = resolution
            .resolution_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let rows = self
            .conn
            .execute(
                "UPDATE data_conflicts
                 SET status = 'resolved',
                     resolution_strategy = ?1,
                     resolved_by = ?2,
                     resolved_at = ?3,
                     resolution_data = ?4,
                     updated_at = ?5
                 WHERE id = ?6 AND status = 'pending'",
                params![
                    resolution.strategy.as_str(),
                    resolution.resolved_by.as_str(),
                    resolution.resolved_at.timestamp_millis(),
                    resolution_data,
                    unix_millis_now(),
                    id.as_str()
                ],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn mark_discarded(&self, id: &ConflictId) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE data_conflicts SET status = 'discarded', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![unix_millis_now(), id.as_str()],
            )
            .await?;
        Ok(rows > 0)
    }
}
