//! Sync conflict model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::DataType;
use crate::error::Error;

/// A unique identifier for a conflict, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Create a new unique conflict ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// Kind of divergence between the server and the incoming change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Server revision is newer than the change's baseline
    EditConflict,
    /// Entity was deleted server-side
    DeleteConflict,
    /// Payload shape no longer matches the stored document
    StructureConflict,
}

/// Conflict lifecycle; only ever leaves `Pending` once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    #[default]
    Pending,
    Resolved,
    Discarded,
}

/// Policy used to collapse a conflict into one accepted state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    AcceptLocal,
    AcceptRemote,
    Merge,
    Manual,
}

/// Who resolved a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedBy {
    System,
    User,
}

macro_rules! string_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        "unknown {} `{other}`",
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

string_enum!(ConflictType {
    EditConflict => "edit_conflict",
    DeleteConflict => "delete_conflict",
    StructureConflict => "structure_conflict",
});

string_enum!(ConflictStatus {
    Pending => "pending",
    Resolved => "resolved",
    Discarded => "discarded",
});

string_enum!(ResolutionStrategy {
    AcceptLocal => "accept_local",
    AcceptRemote => "accept_remote",
    Merge => "merge",
    Manual => "manual",
});

string_enum!(ResolvedBy {
    System => "system",
    User => "user",
});

/// One side of a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub device_id: Option<String>,
}

/// Resolution requested by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRequest {
    pub strategy: ResolutionStrategy,
    pub resolved_by: ResolvedBy,
    #[serde(default)]
    pub resolution_data: Option<Value>,
}

/// Resolution stamped onto a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    pub resolved_by: ResolvedBy,
    pub resolved_at: DateTime<Utc>,
    pub resolution_data: Option<Value>,
}

/// Recorded divergence between server state and an incoming change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConflict {
    pub id: ConflictId,
    pub user_id: String,
    pub data_type: DataType,
    pub data_id: String,
    /// Server-held state when the conflict was detected
    pub local_version: VersionSnapshot,
    /// Incoming client state that was not applied
    pub remote_version: VersionSnapshot,
    pub conflict_type: ConflictType,
    pub status: ConflictStatus,
    pub resolution: Option<ConflictResolution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_id_unique_and_parseable() {
        let id1 = ConflictId::new();
        let id2 = ConflictId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().parse::<ConflictId>().unwrap(), id1);
    }

    #[test]
    fn enum_tags_match_wire_format() {
        assert_eq!(
            serde_json::to_value(ConflictType::EditConflict).unwrap(),
            Value::String("edit_conflict".to_string())
        );
        assert_eq!(
            serde_json::to_value(ResolutionStrategy::AcceptRemote).unwrap(),
            Value::String(ResolutionStrategy::AcceptRemote.as_str().to_string())
        );
        assert_eq!(
            "discarded".parse::<ConflictStatus>().unwrap(),
            ConflictStatus::Discarded
        );
        assert!("later".parse::<ResolvedBy>().is_err());
    }

    #[test]
    fn resolution_request_accepts_missing_payload() {
        let request: ResolutionRequest =
            serde_json::from_str(r#"{"strategy":"accept_local","resolvedBy":"user"}"#).unwrap();
        assert_eq!(request.strategy, ResolutionStrategy::AcceptLocal);
        assert_eq!(request.resolved_by, ResolvedBy::User);
        assert!(request.resolution_data.is_none());
    }
}
