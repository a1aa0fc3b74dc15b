//! Device registry repository

use crate::error::Result;
use crate::models::{DataType, DeviceInfo, DeviceSyncRecord, SyncStatus};
use crate::util::{datetime_from_millis, unix_millis_now};
use libsql::{params, Connection, Row};

const SELECT_COLUMNS: &str = "SELECT user_id, device_id, data_type, last_sync_at, user_agent, platform, app_version, sync_status, created_at, updated_at FROM device_sync";

/// Trait for device sync record storage (async)
#[allow(async_fn_in_trait)]
pub trait DeviceRepository {
    /// Insert or refresh the record for (user, device, data type)
    async fn upsert(
        &self,
        user_id: &str,
        device_id: &str,
        data_type: DataType,
        info: &DeviceInfo,
    ) -> Result<DeviceSyncRecord>;

    /// Fetch one record by its key
    async fn get(
        &self,
        user_id: &str,
        device_id: &str,
        data_type: DataType,
    ) -> Result<Option<DeviceSyncRecord>>;

    /// List a user's records, optionally narrowed by device and/or data type
    async fn list(
        &self,
        user_id: &str,
        device_id: Option<&str>,
        data_type: Option<DataType>,
    ) -> Result<Vec<DeviceSyncRecord>>;

    /// Stamp the end of a sync cycle
    async fn mark_synced(
        &self,
        user_id: &str,
        device_id: &str,
        data_type: DataType,
        status: SyncStatus,
    ) -> Result<DeviceSyncRecord>;
}

/// libSQL implementation of `DeviceRepository`
pub struct LibSqlDeviceRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlDeviceRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_record(row: &Row) -> Result<DeviceSyncRecord> {
        let data_type: String = row.get(2)?;
        let sync_status: String = row.get(7)?;
        Ok(DeviceSyncRecord {
            user_id: row.get(0)?,
            device_id: row.get(1)?,
            data_type: data_type.parse()?,
            last_sync_timestamp: datetime_from_millis(row.get(3)?),
            device_info: DeviceInfo {
                user_agent: row.get(4)?,
                platform: row.get(5)?,
                app_version: row.get(6)?,
            },
            sync_status: sync_status.parse()?,
            created_at: datetime_from_millis(row.get(8)?),
            updated_at: datetime_from_millis(row.get(9)?),
        })
    }

    async fn require(
        &self,
        user_id: &str,
        device_id: &str,
        data_type: DataType,
    ) -> Result<DeviceSyncRecord> {
        self.get(user_id, device_id, data_type)
            .await?
            .ok_or(crate::Error::DeviceNotRegistered)
    }
}

impl DeviceRepository for LibSqlDeviceRepository<'_> {
    async fn upsert(
        &self,
        user_id: &str,
        device_id: &str,
        data_type: DataType,
        info: &DeviceInfo,
    ) -> Result<DeviceSyncRecord> {
        let now = unix_millis_now();

        // Re-registration refreshes metadata but keeps the last sync status
        self.conn
            .execute(
                "INSERT INTO device_sync (
                    user_id, device_id, data_type, last_sync_at,
                    user_agent, platform, app_version, sync_status, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'synced', ?4, ?4)
                 ON CONFLICT(user_id, device_id, data_type) DO UPDATE SET
                    last_sync_at = excluded.last_sync_at,
                    user_agent = excluded.user_agent,
                    platform = excluded.platform,
                    app_version = excluded.app_version,
                    updated_at = excluded.updated_at",
                params![
                    user_id,
                    device_id,
                    data_type.as_str(),
                    now,
                    info.user_agent.clone(),
                    info.platform.clone(),
                    info.app_version.clone()
                ],
            )
            .await?;

        self.require(user_id, device_id, data_type).await
    }

    async fn get(
        &self,
        user_id: &str,
        device_id: &str,
        data_type: DataType,
    ) -> Result<Option<DeviceSyncRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("{SELECT_COLUMNS} WHERE user_id = ? AND device_id = ? AND data_type = ?"),
                params![user_id, device_id, data_type.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        user_id: &str,
        device_id: Option<&str>,
        data_type: Option<DataType>,
    ) -> Result<Vec<DeviceSyncRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "{SELECT_COLUMNS}
                     WHERE user_id = ?1
                       AND (?2 IS NULL OR device_id = ?2)
                       AND (?3 IS NULL OR data_type = ?3)
                     ORDER BY device_id ASC, data_type ASC"
                ),
                params![
                    user_id,
                    device_id.map(str::to_string),
                    data_type.map(|data_type| data_type.as_str().to_string())
                ],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }

    async fn mark_synced(
        &self,
        user_id: &str,
        device_id: &str,
        data_type: DataType,
        status: SyncStatus,
    ) -> Result<DeviceSyncRecord> {
        let now = unix_millis_now();
        let rows = self
            .conn
            .execute(
                "UPDATE device_sync SET last_sync_at = ?1, sync_status = ?2, updated_at = ?1
                 WHERE user_id = ?3 AND device_id = ?4 AND data_type = ?5",
                params![now, status.as_str(), user_id, device_id, data_type.as_str()],
            )
            .await?;

        if rows == 0 {
            return Err(crate::Error::DeviceNotRegistered);
        }

        self.require(user_id, device_id, data_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn ios() -> DeviceInfo {
        DeviceInfo {
            user_agent: Some("TravelGrid/ios".to_string()),
            platform: Some("ios".to_string()),
            app_version: Some("1.4.0".to_string()),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_is_idempotent() {
        let db = setup().await;
        let repo = LibSqlDeviceRepository::new(db.connection());

        repo.upsert("u1", "phone", DataType::Trip, &DeviceInfo::default())
            .await
            .unwrap();
        let second = repo
            .upsert("u1", "phone", DataType::Trip, &ios())
            .await
            .unwrap();

        let all = repo.list("u1", None, None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(second.device_info, ios());
        assert_eq!(second.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reregistration_keeps_status() {
        let db = setup().await;
        let repo = LibSqlDeviceRepository::new(db.connection());

        repo.upsert("u1", "phone", DataType::Trip, &ios())
            .await
            .unwrap();
        repo.mark_synced("u1", "phone", DataType::Trip, SyncStatus::Conflict)
            .await
            .unwrap();
        let again = repo
            .upsert("u1", "phone", DataType::Trip, &ios())
            .await
            .unwrap();

        assert_eq!(again.sync_status, SyncStatus::Conflict);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_filters() {
        let db = setup().await;
        let repo = LibSqlDeviceRepository::new(db.connection());

        repo.upsert("u1", "phone", DataType::Trip, &ios())
            .await
            .unwrap();
        repo.upsert("u1", "phone", DataType::Budget, &ios())
            .await
            .unwrap();
        repo.upsert("u1", "laptop", DataType::Trip, &DeviceInfo::default())
            .await
            .unwrap();
        repo.upsert("u2", "phone", DataType::Trip, &ios())
            .await
            .unwrap();

        assert_eq!(repo.list("u1", None, None).await.unwrap().len(), 3);
        assert_eq!(repo.list("u1", Some("phone"), None).await.unwrap().len(), 2);
        assert_eq!(
            repo.list("u1", None, Some(DataType::Trip))
                .await
                .unwrap()
                .len(),
            2
        );
        let exact = repo
            .list("u1", Some("laptop"), Some(DataType::Trip))
            .await
            .unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].device_id, "laptop");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_synced_requires_registration() {
        let db = setup().await;
        let repo = LibSqlDeviceRepository::new(db.connection());

        let err = repo
            .mark_synced("u1", "ghost", DataType::Trip, SyncStatus::Synced)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::DeviceNotRegistered));
    }
}
