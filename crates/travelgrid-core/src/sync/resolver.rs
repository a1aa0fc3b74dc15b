//! Conflict resolution and discard
//!
//! Both leave `pending` through a conditional status update inside a
//! transaction, so a conflict is settled at most once and a failed entity
//! write leaves the conflict pending.
//!
//! Resolution reads the entity inside the same transaction and works from its
//! current document, not the local version recorded at detection. Writes
//! accepted after the conflict was raised are kept.

use chrono::Utc;
use libsql::Connection;
use serde_json::{Map, Value};

use super::appliers::{patch, ApplierRegistry};
use super::merge::MergeOptions;
use crate::db::{
    transaction, AuditRepository, ConflictRepository, EntityRepository, LibSqlAuditRepository,
    LibSqlConflictRepository, LibSqlEntityRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    AuditAction, ConflictId, ConflictResolution, ConflictStatus, DataConflict, NewAuditEntry,
    ResolutionRequest, ResolutionStrategy, SyncEntity,
};
use crate::util::user_fingerprint;

/// Load a conflict owned by `user_id`; other users' conflicts are not found.
pub async fn find_conflict(
    conn: &Connection,
    user_id: &str,
    conflict_id: &ConflictId,
) -> Result<DataConflict> {
    LibSqlConflictRepository::new(conn)
        .get(conflict_id)
        .await?
        .filter(|conflict| conflict.user_id == user_id)
        .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))
}

/// Fields the remote version changed relative to the recorded local version,
/// applied onto `base`.
fn rebase_remote(conflict: &DataConflict, base: &Value) -> Value {
    let remote = &conflict.remote_version.data;
    match (conflict.local_version.data.as_object(), remote.as_object()) {
        (Some(recorded), Some(fields)) => {
            let changed: Map<String, Value> = fields
                .iter()
                .filter(|(field, value)| recorded.get(field.as_str()) != Some(*value))
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect();
            patch(base, &Value::Object(changed))
        }
        _ => remote.clone(),
    }
}

/// Document the entity should hold after resolution, `None` to leave it alone
fn target_data(
    registry: &ApplierRegistry,
    conflict: &DataConflict,
    request: &ResolutionRequest,
    current: Option<&SyncEntity>,
) -> Result<Option<Value>> {
    let applier = registry.get(conflict.data_type)?;
    let local = current.map_or(&conflict.local_version.data, |entity| &entity.data);
    let target = match request.strategy {
        ResolutionStrategy::AcceptLocal => return Ok(None),
        ResolutionStrategy::AcceptRemote => rebase_remote(conflict, local),
        ResolutionStrategy::Merge => {
            let options = MergeOptions::from_resolution_data(request.resolution_data.as_ref())?;
            applier.merge(local, &rebase_remote(conflict, local), &options)
        }
        ResolutionStrategy::Manual => request
            .resolution_data
            .clone()
            .filter(Value::is_object)
            .ok_or_else(|| {
                Error::InvalidInput("manual resolution requires resolutionData object".into())
            })?,
    };
    applier.validate(&target)?;
    Ok(Some(target))
}

/// Resolve a pending conflict and apply the outcome to its entity
pub async fn resolve(
    conn: &Connection,
    registry: &ApplierRegistry,
    user_id: &str,
    conflict_id: &ConflictId,
    request: &ResolutionRequest,
) -> Result<DataConflict> {
    let conflict = find_conflict(conn, user_id, conflict_id).await?;
    ensure_pending(&conflict)?;

    transaction::begin(conn).await?;
    let outcome = apply_resolution(conn, registry, &conflict, request).await;
    transaction::finish(conn, outcome).await?;

    tracing::info!(
        user = user_fingerprint(user_id),
        conflict = %conflict_id,
        strategy = request.strategy.as_str(),
        "Conflict resolved"
    );
    find_conflict(conn, user_id, conflict_id).await
}

async fn apply_resolution(
    conn: &Connection,
    registry: &ApplierRegistry,
    conflict: &DataConflict,
    request: &ResolutionRequest,
) -> Result<()> {
    let entities = LibSqlEntityRepository::new(conn);
    let current = entities
        .get_any(&conflict.user_id, conflict.data_type, &conflict.data_id)
        .await?;
    let target = target_data(registry, conflict, request, current.as_ref())?;

    let conflicts = LibSqlConflictRepository::new(conn);
    let resolved_at = Utc::now();
    let resolution = ConflictResolution {
        strategy: request.strategy,
        resolved_by: request.resolved_by,
        resolved_at,
        resolution_data: request.resolution_data.clone(),
    };
    if !conflicts.mark_resolved(&conflict.id, &resolution).await? {
        return Err(settled_elsewhere(&conflicts, &conflict.id).await);
    }

    let mut before = None;
    if let Some(data) = &target {
        let now = resolved_at.timestamp_millis();
        let revision = current
            .as_ref()
            .map_or(now, |entity| now.max(entity.revision + 1));
        before = current
            .filter(|entity| !entity.is_deleted)
            .map(|entity| entity.data);

        // The transaction holds the write lock, so `current` is still the
        // stored revision here.
        let modified_by = format!("resolver:{}", request.resolved_by.as_str());
        entities
            .overwrite(
                &conflict.user_id,
                conflict.data_type,
                &conflict.data_id,
                data,
                revision,
                Some(&modified_by),
            )
            .await?;
    }

    LibSqlAuditRepository::new(conn)
        .append(&NewAuditEntry {
            user_id: conflict.user_id.clone(),
            device_id: None,
            data_type: conflict.data_type,
            data_id: conflict.data_id.clone(),
            action: AuditAction::Resolve,
            before,
            after: target,
        })
        .await
}

/// Discard a pending conflict without touching its entity
pub async fn discard(
    conn: &Connection,
    user_id: &str,
    conflict_id: &ConflictId,
) -> Result<DataConflict> {
    let conflict = find_conflict(conn, user_id, conflict_id).await?;
    ensure_pending(&conflict)?;

    transaction::begin(conn).await?;
    let outcome = async {
        let conflicts = LibSqlConflictRepository::new(conn);
        if !conflicts.mark_discarded(conflict_id).await? {
            return Err(settled_elsewhere(&conflicts, conflict_id).await);
        }
        LibSqlAuditRepository::new(conn)
            .append(&NewAuditEntry {
                user_id: conflict.user_id.clone(),
                device_id: None,
                data_type: conflict.data_type,
                data_id: conflict.data_id.clone(),
                action: AuditAction::Discard,
                before: None,
                after: None,
            })
            .await
    }
    .await;
    transaction::finish(conn, outcome).await?;

    tracing::info!(user = user_fingerprint(user_id), conflict = %conflict_id, "Conflict discarded");
    find_conflict(conn, user_id, conflict_id).await
}

fn ensure_pending(conflict: &DataConflict) -> Result<()> {
    if conflict.status == ConflictStatus::Pending {
        Ok(())
    } else {
        Err(Error::AlreadyResolved(conflict.status.as_str().to_string()))
    }
}

/// Error for a conditional status update that matched no pending row
async fn settled_elsewhere(conflicts: &LibSqlConflictRepository<'_>, id: &ConflictId) -> Error {
    match conflicts.get(id).await {
        Ok(Some(current)) => Error::AlreadyResolved(current.status.as_str().to_string()),
        Ok(None) => Error::NotFound(format!("conflict {id}")),
        Err(e) => e,
    }
}
