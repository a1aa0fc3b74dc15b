//! Conflict detection for incoming updates

use serde_json::Value;

use crate::db::{EntityRepository, LibSqlEntityRepository};
use crate::error::Result;
use crate::models::{ConflictType, DataType, SyncEntity, VersionSnapshot};
use libsql::Connection;

/// A change that cannot be applied without a resolution
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedConflict {
    pub conflict_type: ConflictType,
    /// Server state at detection time
    pub local_version: VersionSnapshot,
}

/// Classify an update against the stored entity.
///
/// Returns `None` when the update can be applied, including when the entity
/// does not exist (the applier reports that case).
pub fn classify(
    current: Option<&SyncEntity>,
    baseline: i64,
    payload: &Value,
) -> Option<DetectedConflict> {
    let current = current?;

    let conflict_type = if current.is_deleted {
        ConflictType::DeleteConflict
    } else if current.revision > baseline {
        ConflictType::EditConflict
    } else if shape_mismatch(&current.data, payload) {
        ConflictType::StructureConflict
    } else {
        return None;
    };

    Some(DetectedConflict {
        conflict_type,
        local_version: current.snapshot(),
    })
}

/// Load the entity and classify the update in one step
pub async fn detect_conflict(
    conn: &Connection,
    user_id: &str,
    data_type: DataType,
    data_id: &str,
    baseline: i64,
    payload: &Value,
) -> Result<Option<DetectedConflict>> {
    let current = LibSqlEntityRepository::new(conn)
        .get_any(user_id, data_type, data_id)
        .await?;
    Ok(classify(current.as_ref(), baseline, payload))
}

fn shape_mismatch(stored: &Value, payload: &Value) -> bool {
    let (Some(stored), Some(payload)) = (stored.as_object(), payload.as_object()) else {
        return false;
    };
    payload.iter().any(|(field, incoming)| {
        stored
            .get(field)
            .is_some_and(|existing| kind(existing).zip(kind(incoming)).is_some_and(|(a, b)| a != b))
    })
}

fn kind(value: &Value) -> Option<&'static str> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some("boolean"),
        Value::Number(_) => Some("number"),
        Value::String(_) => Some("string"),
        Value::Array(_) => Some("array"),
        Value::Object(_) => Some("object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::datetime_from_millis;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn entity(data: Value, revision: i64, is_deleted: bool) -> SyncEntity {
        SyncEntity {
            id: "t1".to_string(),
            user_id: "u1".to_string(),
            data_type: DataType::Trip,
            data,
            revision,
            last_modified_by: Some("laptop".to_string()),
            created_at: datetime_from_millis(1_000),
            updated_at: datetime_from_millis(revision),
            is_deleted,
        }
    }

    #[test]
    fn missing_entity_is_not_a_conflict() {
        assert_eq!(classify(None, 1_000, &json!({})), None);
    }

    #[test]
    fn newer_revision_is_edit_conflict() {
        let current = entity(json!({"destination": "Lisbon"}), 2_000, false);
        let conflict = classify(Some(&current), 1_500, &json!({"destination": "Porto"})).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::EditConflict);
        assert_eq!(conflict.local_version.data, json!({"destination": "Lisbon"}));
        assert_eq!(conflict.local_version.timestamp, datetime_from_millis(2_000));
        assert_eq!(conflict.local_version.device_id.as_deref(), Some("laptop"));
    }

    #[test]
    fn equal_revision_applies() {
        let current = entity(json!({"destination": "Lisbon"}), 2_000, false);
        assert_eq!(classify(Some(&current), 2_000, &json!({"destination": "Porto"})), None);
    }

    #[test]
    fn tombstone_wins_over_revision_check() {
        let current = entity(json!({}), 500, true);
        let conflict = classify(Some(&current), 1_000, &json!({})).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::DeleteConflict);
    }

    #[test]
    fn changed_field_kind_is_structure_conflict() {
        let current = entity(json!({"interests": ["food"], "notes": null}), 1_000, false);
        let conflict = classify(Some(&current), 1_000, &json!({"interests": "food"})).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::StructureConflict);

        // nulls and new fields never count as a shape change
        assert_eq!(
            classify(Some(&current), 1_000, &json!({"notes": "x", "plan": {}, "interests": null})),
            None
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_detect_conflict_reads_stored_entity() {
        let db = crate::db::Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        LibSqlEntityRepository::new(conn)
            .insert("u1", DataType::Trip, "t1", &json!({"destination": "Lisbon"}), 2_000, Some("laptop"))
            .await
            .unwrap();

        let detected = detect_conflict(conn, "u1", DataType::Trip, "t1", 1_000, &json!({}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detected.conflict_type, ConflictType::EditConflict);

        // Entities are scoped per user
        let other = detect_conflict(conn, "u2", DataType::Trip, "t1", 1_000, &json!({}))
            .await
            .unwrap();
        assert_eq!(other, None);
    }

    #[test]
    fn non_object_payload_is_left_to_validation() {
        let current = entity(json!({"destination": "Lisbon"}), 1_000, false);
        assert_eq!(classify(Some(&current), 1_000, &json!("Porto")), None);
    }
}
