//! Synchronized domain entities (trips, checklists, budgets)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DataType, VersionSnapshot};
use crate::util::datetime_from_millis;

/// A user-owned JSON document kept in sync across devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEntity {
    pub id: String,
    pub user_id: String,
    pub data_type: DataType,
    pub data: Value,
    /// Logical timestamp (Unix ms) of the last applied write
    pub revision: i64,
    /// Device that produced the current revision
    pub last_modified_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tombstone flag; deleted entities are kept so late updates are detectable
    pub is_deleted: bool,
}

impl SyncEntity {
    /// Server-side view used as the `localVersion` of a conflict.
    pub fn snapshot(&self) -> VersionSnapshot {
        VersionSnapshot {
            timestamp: datetime_from_millis(self.revision),
            data: self.data.clone(),
            device_id: self.last_modified_by.clone(),
        }
    }
}
