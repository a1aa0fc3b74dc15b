//! Client change records submitted in a sync batch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::util::timestamp_from_value;

/// Mutation kind carried by a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::UnsupportedOperation(other.to_string())),
        }
    }
}

/// One client-side mutation.
///
/// Every field is kept as raw JSON and any batch element converts into a
/// `Change`, so a malformed item fails on its own when it is prepared
/// instead of rejecting the whole batch at deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "Value")]
pub struct Change {
    pub id: Value,
    pub operation: Value,
    pub data: Value,
    /// Logical timestamp assigned by the originating device
    pub timestamp: Value,
    /// Entity revision the device last saw; defaults to `timestamp`
    pub base_timestamp: Value,
}

impl From<Value> for Change {
    fn from(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            return Self::default();
        };
        let mut take = |name: &str| fields.remove(name).unwrap_or(Value::Null);
        Self {
            id: take("id"),
            operation: take("operation"),
            data: take("data"),
            timestamp: take("timestamp"),
            base_timestamp: take("baseTimestamp"),
        }
    }
}

impl Change {
    /// Trimmed entity ID, if one was supplied as a string or number.
    pub fn target_id(&self) -> Option<String> {
        match &self.id {
            Value::String(id) => crate::util::normalize_text_option(Some(id.clone())),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    /// Operation as sent, for failure reports.
    pub fn operation_name(&self) -> String {
        self.operation
            .as_str()
            .map(|op| op.trim().to_string())
            .unwrap_or_default()
    }

    pub fn timestamp(&self) -> Result<Option<DateTime<Utc>>, Error> {
        timestamp_from_value(&self.timestamp, "timestamp")
    }

    /// Revision the change claims to build on, in Unix milliseconds.
    pub fn baseline_millis(&self) -> Result<Option<i64>, Error> {
        let base = match timestamp_from_value(&self.base_timestamp, "baseTimestamp")? {
            Some(base) => Some(base),
            None => self.timestamp()?,
        };
        Ok(base.map(|ts| ts.timestamp_millis()))
    }
}

/// Descriptor of a change the server applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedChange {
    pub id: String,
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
    /// Stored revision after the write; the baseline for the next update
    pub revision: i64,
}

/// Descriptor of a change that failed without aborting its batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedChange {
    pub id: Option<String>,
    pub operation: String,
    pub error: String,
}
