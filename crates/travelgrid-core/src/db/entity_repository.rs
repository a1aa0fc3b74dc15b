//! Synchronized entity repository
//!
//! Writes that race other devices are conditional on the revision the caller
//! last observed, so a lost race surfaces as `false` instead of overwriting.

#![allow(clippy::too_many_arguments)]

use crate::error::{Error, Result};
use crate::models::{DataType, SyncEntity};
use crate::util::{datetime_from_millis, unix_millis_now};
use libsql::{params, Connection, Row};
use serde_json::Value;

const SELECT_COLUMNS: &str = "SELECT id, user_id, data_type, data, revision, last_modified_by, created_at, updated_at, is_deleted FROM sync_entities";

/// Trait for entity storage operations (async)
#[allow(async_fn_in_trait)]
pub trait EntityRepository {
    /// Fetch an entity including tombstones
    async fn get_any(&self, user_id: &str, data_type: DataType, id: &str)
        -> Result<Option<SyncEntity>>;

    /// Fetch a live (non-deleted) entity
    async fn get(&self, user_id: &str, data_type: DataType, id: &str) -> Result<Option<SyncEntity>>;

    /// List a user's live entities of one type, most recently revised first
    async fn list(&self, user_id: &str, data_type: DataType) -> Result<Vec<SyncEntity>>;

    /// Insert a new entity; revives the user's tombstone with the same id.
    ///
    /// Returns `None` when a live entity with that id already exists.
    async fn insert(
        &self,
        user_id: &str,
        data_type: DataType,
        id: &str,
        data: &Value,
        revision: i64,
        modified_by: Option<&str>,
    ) -> Result<Option<SyncEntity>>;

    /// Replace the document if the stored revision still equals `expected_revision`
    async fn compare_and_swap(
        &self,
        user_id: &str,
        data_type: DataType,
        id: &str,
        expected_revision: i64,
        data: &Value,
        revision: i64,
        modified_by: Option<&str>,
    ) -> Result<bool>;

    /// Tombstone the entity if the stored revision still equals `expected_revision`
    async fn compare_and_delete(
        &self,
        user_id: &str,
        data_type: DataType,
        id: &str,
        expected_revision: i64,
        revision: i64,
        modified_by: Option<&str>,
    ) -> Result<bool>;

    /// Unconditionally replace the document, clearing any tombstone
    async fn overwrite(
        &self,
        user_id: &str,
        data_type: DataType,
        id: &str,
        data: &Value,
        revision: i64,
        modified_by: Option<&str>,
    ) -> Result<SyncEntity>;
}

/// libSQL implementation of `EntityRepository`
pub struct LibSqlEntityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_entity(row: &Row) -> Result<SyncEntity> {
        let data_type: String = row.get(2)?;
        let data: String = row.get(3)?;
        Ok(SyncEntity {
            id: row.get(0)?,
            user_id: row.get(1)?,
            data_type: data_type.parse()?,
            data: serde_json::from_str(&data)?,
            revision: row.get(4)?,
            last_modified_by: row.get(5)?,
            created_at: datetime_from_millis(row.get(6)?),
            updated_at: datetime_from_millis(row.get(7)?),
            is_deleted: row.get::<i64>(8)? != 0,
        })
    }

    async fn query_one(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Option<SyncEntity>> {
        let mut rows = self.conn.query(sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_entity(&row)?)),
            None => Ok(None),
        }
    }
}

impl EntityRepository for LibSqlEntityRepository<'_> {
    async fn get_any(
        &self,
        user_id: &str,
        data_type: DataType,
        id: &str,
    ) -> Result<Option<SyncEntity>> {
        self.query_one(
            &format!("{SELECT_COLUMNS} WHERE data_type = ? AND id = ? AND user_id = ?"),
            params![data_type.as_str(), id, user_id],
        )
        .await
    }

    async fn get(&self, user_id: &str, data_type: DataType, id: &str) -> Result<Option<SyncEntity>> {
        self.query_one(
            &format!(
                "{SELECT_COLUMNS} WHERE data_type = ? AND id = ? AND user_id = ? AND is_deleted = 0"
            ),
            params![data_type.as_str(), id, user_id],
        )
        .await
    }

    async fn list(&self, user_id: &str, data_type: DataType) -> Result<Vec<SyncEntity>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "{SELECT_COLUMNS}
                     WHERE user_id = ? AND data_type = ? AND is_deleted = 0
                     ORDER BY revision DESC, id ASC"
                ),
                params![user_id, data_type.as_str()],
            )
            .await?;

        let mut entities = Vec::new();
        while let Some(row) = rows.next().await? {
            entities.push(Self::parse_entity(&row)?);
        }
        Ok(entities)
    }

    async fn insert(
        &self,
        user_id: &str,
        data_type: DataType,
        id: &str,
        data: &Value,
        revision: i64,
        modified_by: Option<&str>,
    ) -> Result<Option<SyncEntity>> {
        let now = unix_millis_now();
        let rows = self
            .conn
            .execute(
                "INSERT INTO sync_entities (
                    data_type, id, user_id, data, revision, last_modified_by,
                    created_at, updated_at, is_deleted
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 0)
                 ON CONFLICT(user_id, data_type, id) DO UPDATE SET
                    data = excluded.data,
                    revision = excluded.revision,
                    last_modified_by = excluded.last_modified_by,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    is_deleted = 0
                 WHERE sync_entities.is_deleted = 1",
                params![
                    data_type.as_str(),
                    id,
                    user_id,
                    serde_json::to_string(data)?,
                    revision,
                    modified_by.map(str::to_string),
                    now
                ],
            )
            .await?;

        if rows == 0 {
            return Ok(None);
        }
        self.get(user_id, data_type, id).await
    }

    async fn compare_and_swap(
        &self,
        user_id: &str,
        data_type: DataType,
        id: &str,
        expected_revision: i64,
        data: &Value,
        revision: i64,
        modified_by: Option<&str>,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE sync_entities
                 SET data = ?1, revision = ?2, last_modified_by = ?3, updated_at = ?4
                 WHERE data_type = ?5 AND id = ?6 AND user_id = ?7
                   AND is_deleted = 0 AND revision = ?8",
                params![
                    serde_json::to_string(data)?,
                    revision,
                    modified_by.map(str::to_string),
                    unix_millis_now(),
                    data_type.as_str(),
                    id,
                    user_id,
                    expected_revision
                ],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn compare_and_delete(
        &self,
        user_id: &str,
        data_type: DataType,
        id: &str,
        expected_revision: i64,
        revision: i64,
        modified_by: Option<&str>,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE sync_entities
                 SET is_deleted = 1, revision = ?1, last_modified_by = ?2, updated_at = ?3
                 WHERE data_type = ?4 AND id = ?5 AND user_id = ?6
                   AND is_deleted = 0 AND revision = ?7",
                params![
                    revision,
                    modified_by.map(str::to_string),
                    unix_millis_now(),
                    data_type.as_str(),
                    id,
                    user_id,
                    expected_revision
                ],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn overwrite(
        &self,
        user_id: &str,
        data_type: DataType,
        id: &str,
        data: &Value,
        revision: i64,
        modified_by: Option<&str>,
    ) -> Result<SyncEntity> {
        let rows = self
            .conn
            .execute(
                "UPDATE sync_entities
                 SET data = ?1, revision = ?2, last_modified_by = ?3, updated_at = ?4, is_deleted = 0
                 WHERE data_type = ?5 AND id = ?6 AND user_id = ?7",
                params![
                    serde_json::to_string(data)?,
                    revision,
                    modified_by.map(str::to_string),
                    unix_millis_now(),
                    data_type.as_str(),
                    id,
                    user_id
                ],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(format!("{data_type} {id}")));
        }
        self.get(user_id, data_type, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{data_type} {id}")))
    }
}
