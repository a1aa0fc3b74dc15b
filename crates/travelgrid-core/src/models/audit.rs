//! Sync audit trail model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use super::DataType;
use crate::error::Error;

/// What happened to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Conflict,
    Resolve,
    Discard,
}

impl AuditAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Conflict => "conflict",
            Self::Resolve => "resolve",
            Self::Discard => "discard",
        }
    }
}

impl FromStr for AuditAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "conflict" => Ok(Self::Conflict),
            "resolve" => Ok(Self::Resolve),
            "discard" => Ok(Self::Discard),
            other => Err(Error::Database(format!("unknown audit action `{other}`"))),
        }
    }
}

/// Append-only record of one mutation (who, what, when, before/after)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub user_id: String,
    pub device_id: Option<String>,
    pub data_type: DataType,
    pub data_id: String,
    pub action: AuditAction,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Audit entry before it receives a row id and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub user_id: String,
    pub device_id: Option<String>,
    pub data_type: DataType,
    pub data_id: String,
    pub action: AuditAction,
    pub before: Option<Value>,
    pub after: Option<Value>,
}
