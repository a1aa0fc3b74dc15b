//! Device sync record model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Category of synchronized domain object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Itinerary,
    Checklist,
    Budget,
    Moodboard,
    Trip,
    /// Device subscribes to every data type
    All,
}

impl DataType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Itinerary => "itinerary",
            Self::Checklist => "checklist",
            Self::Budget => "budget",
            Self::Moodboard => "moodboard",
            Self::Trip => "trip",
            Self::All => "all",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "itinerary" => Ok(Self::Itinerary),
            "checklist" => Ok(Self::Checklist),
            "budget" => Ok(Self::Budget),
            "moodboard" => Ok(Self::Moodboard),
            "trip" => Ok(Self::Trip),
            "all" => Ok(Self::All),
            other => Err(Error::InvalidInput(format!("unknown dataType `{other}`"))),
        }
    }
}

/// Outcome of a device's most recent sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Synced,
    Pending,
    Conflict,
    Error,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflict" => Ok(Self::Conflict),
            "error" => Ok(Self::Error),
            other => Err(Error::Database(format!("unknown sync status `{other}`"))),
        }
    }
}

/// Client-reported device metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

/// Per-(user, device, data type) sync bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSyncRecord {
    pub user_id: String,
    pub device_id: String,
    pub data_type: DataType,
    /// Last time the device registered or completed a sync
    pub last_sync_timestamp: DateTime<Utc>,
    pub device_info: DeviceInfo,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
