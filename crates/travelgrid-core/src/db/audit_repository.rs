//! Audit trail repository

use crate::error::Result;
use crate::models::{AuditEntry, NewAuditEntry};
use crate::util::{datetime_from_millis, unix_millis_now};
use libsql::{params, Connection, Row};
use serde_json::Value;

/// Trait for append-only audit storage (async)
#[allow(async_fn_in_trait)]
pub trait AuditRepository {
    /// Append one entry
    async fn append(&self, entry: &NewAuditEntry) -> Result<()>;

    /// Most recent entries for a user, newest first
    async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<AuditEntry>>;
}

/// libSQL implementation of `AuditRepository`
pub struct LibSqlAuditRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlAuditRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_entry(row: &Row) -> Result<AuditEntry> {
        let data_type: String = row.get(3)?;
        let action: String = row.get(5)?;
        let before: Option<String> = row.get(6)?;
        let after: Option<String> = row.get(7)?;
        Ok(AuditEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            device_id: row.get(2)?,
            data_type: data_type.parse()?,
            data_id: row.get(4)?,
            action: action.parse()?,
            before: before
                .map(|data| serde_json::from_str::<Value>(&data))
                .transpose()?,
            after: after
                .map(|data| serde_json::from_str::<Value>(&data))
                .transpose()?,
            created_at: datetime_from_millis(row.get(8)?),
        })
    }
}

impl AuditRepository for LibSqlAuditRepository<'_> {
    async fn append(&self, entry: &NewAuditEntry) -> Result<()> {
        let before = entry.before.as_ref().map(serde_json::to_string).transpose()?;
        let after = entry.after.as_ref().map(serde_json::to_string).transpose()?;

        self.conn
            .execute(
                "INSERT INTO sync_audit_log (
                    user_id, device_id, data_type, data_id, action, before_data, after_data, created_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    entry.user_id.as_str(),
                    entry.device_id.clone(),
                    entry.data_type.as_str(),
                    entry.data_id.as_str(),
                    entry.action.as_str(),
                    before,
                    after,
                    unix_millis_now()
                ],
            )
            .await?;
        Ok(())
    }

    async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<AuditEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self
            .conn
            .query(
                "SELECT id, user_id, device_id, data_type, data_id, action, before_data, after_data, created_at
                 FROM sync_audit_log
                 WHERE user_id = ?
                 ORDER BY id DESC
                 LIMIT ?",
                params![user_id, limit],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(Self::parse_entry(&row)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{AuditAction, DataType};
    use serde_json::json;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_append_and_list_newest_first() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlAuditRepository::new(db.connection());

        for (index, action) in [AuditAction::Create, AuditAction::Update, AuditAction::Delete]
            .into_iter()
            .enumerate()
        {
            repo.append(&NewAuditEntry {
                user_id: "u1".to_string(),
                device_id: Some("phone".to_string()),
                data_type: DataType::Trip,
                data_id: "t1".to_string(),
                action,
                before: None,
                after: Some(json!({"step": index})),
            })
            .await
            .unwrap();
        }

        let entries = repo.list("u1", 2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, AuditAction::Delete);
        assert_eq!(entries[1].action, AuditAction::Update);
        assert_eq!(entries[1].after, Some(json!({"step": 1})));
        assert!(repo.list("u2", 10).await.unwrap().is_empty());
    }
}
