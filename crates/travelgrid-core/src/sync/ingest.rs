//! Batch change ingestion for one device and data type

use std::future::Future;

use chrono::{DateTime, Utc};
use libsql::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::appliers::{patch, ApplierRegistry, ChangeApplier, EntityWrite, PreparedChange};
use super::detector::classify;
use crate::db::{
    transaction, AuditRepository, ConflictRepository, DeviceRepository, EntityRepository,
    LibSqlAuditRepository, LibSqlConflictRepository, LibSqlDeviceRepository,
    LibSqlEntityRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    AppliedChange, AuditAction, Change, ConflictId, ConflictStatus, DataConflict, DataType,
    FailedChange, NewAuditEntry, Operation, SyncEntity, SyncStatus, VersionSnapshot,
};
use crate::util::{compact_text, user_fingerprint};

/// Attempts per change before a lost compare-and-swap is reported
const MAX_CAS_ATTEMPTS: usize = 3;

/// One device's sync batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub user_id: String,
    pub device_id: String,
    pub data_type: DataType,
    pub changes: Vec<Change>,
    #[serde(default)]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
}

/// What happened to a sync batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub processed_changes: Vec<AppliedChange>,
    /// Data IDs whose change raised a conflict
    pub conflicts: Vec<String>,
    pub conflict_ids: Vec<ConflictId>,
    pub failed_changes: Vec<FailedChange>,
}

#[derive(Debug)]
enum ChangeResult {
    Applied(AppliedChange),
    Conflict(Box<DataConflict>),
}

/// Apply a batch in order, recording conflicts instead of overwriting.
///
/// Per-change client errors land in `failed_changes`; store errors abort the
/// batch. The caller validates identifiers and batch size.
pub async fn ingest(
    conn: &Connection,
    registry: &ApplierRegistry,
    request: &SyncRequest,
) -> Result<SyncOutcome> {
    let devices = LibSqlDeviceRepository::new(conn);
    if devices
        .get(&request.user_id, &request.device_id, request.data_type)
        .await?
        .is_none()
    {
        tracing::warn!(
            user = user_fingerprint(&request.user_id),
            data_type = %request.data_type,
            "Sync rejected for unregistered device"
        );
        return Err(Error::DeviceNotRegistered);
    }

    tracing::info!(
        user = user_fingerprint(&request.user_id),
        data_type = %request.data_type,
        changes = request.changes.len(),
        last_sync = ?request.last_sync_timestamp,
        "Processing sync batch"
    );

    let mut outcome = SyncOutcome::default();
    let mut conflicts = Vec::new();

    for change in &request.changes {
        match process_change(conn, registry, request, change).await {
            Ok(ChangeResult::Applied(applied)) => outcome.processed_changes.push(applied),
            Ok(ChangeResult::Conflict(conflict)) => conflicts.push(*conflict),
            Err(e) if e.is_client_error() => {
                tracing::debug!(operation = %change.operation_name(), "Change failed: {}", e);
                outcome.failed_changes.push(FailedChange {
                    id: change.target_id(),
                    operation: change.operation_name(),
                    error: compact_text(&e.to_string()),
                });
            }
            Err(e) => return Err(e),
        }
    }

    persist_conflicts(conn, &conflicts, &request.device_id).await?;
    outcome.conflicts = conflicts.iter().map(|c| c.data_id.clone()).collect();
    outcome.conflict_ids = conflicts.iter().map(|c| c.id).collect();

    let status = if conflicts.is_empty() {
        SyncStatus::Synced
    } else {
        SyncStatus::Conflict
    };
    devices
        .mark_synced(&request.user_id, &request.device_id, request.data_type, status)
        .await?;

    tracing::info!(
        applied = outcome.processed_changes.len(),
        conflicts = outcome.conflicts.len(),
        failed = outcome.failed_changes.len(),
        "Sync batch complete"
    );
    Ok(outcome)
}

async fn process_change(
    conn: &Connection,
    registry: &ApplierRegistry,
    request: &SyncRequest,
    change: &Change,
) -> Result<ChangeResult> {
    let prepared = PreparedChange::try_from(change)?;
    let applier = registry.get(request.data_type)?;
    let label = format!(
        "{} {}",
        request.data_type,
        prepared.id.as_deref().unwrap_or_default()
    );
    let prepared = &prepared;
    with_cas_retries(&label, move || attempt_change(conn, applier, request, prepared)).await
}

/// Repeat `attempt` while it loses compare-and-swap races, at most
/// `MAX_CAS_ATTEMPTS` times.
async fn with_cas_retries<F, Fut>(label: &str, mut attempt: F) -> Result<ChangeResult>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<ChangeResult>>>,
{
    for round in 1..=MAX_CAS_ATTEMPTS {
        if let Some(result) = attempt().await? {
            return Ok(result);
        }
        tracing::warn!(entity = label, attempt = round, "Entity changed during sync, retrying");
    }
    Err(Error::Concurrency(label.to_string()))
}

/// Read, classify and write one change; `None` means the write lost its CAS.
async fn attempt_change(
    conn: &Connection,
    applier: &dyn ChangeApplier,
    request: &SyncRequest,
    prepared: &PreparedChange,
) -> Result<Option<ChangeResult>> {
    let current = match prepared.id.as_deref() {
        Some(id) => {
            LibSqlEntityRepository::new(conn)
                .get_any(&request.user_id, request.data_type, id)
                .await?
        }
        None => None,
    };

    if prepared.operation == Operation::Update {
        if let Some(detected) = classify(current.as_ref(), prepared.baseline, &prepared.data) {
            let data_id = prepared.id.clone().unwrap_or_default();
            tracing::debug!(
                data_id = %data_id,
                conflict_type = detected.conflict_type.as_str(),
                "Conflict detected"
            );
            // The remote version is the whole document the device wanted,
            // not just the fields it sent.
            let remote_data = current.as_ref().map_or_else(
                || prepared.data.clone(),
                |entity| patch(&entity.data, &prepared.data),
            );
            let now = Utc::now();
            return Ok(Some(ChangeResult::Conflict(Box::new(DataConflict {
                id: ConflictId::new(),
                user_id: request.user_id.clone(),
                data_type: request.data_type,
                data_id,
                local_version: detected.local_version,
                remote_version: VersionSnapshot {
                    timestamp: prepared.timestamp,
                    data: remote_data,
                    device_id: Some(request.device_id.clone()),
                },
                conflict_type: detected.conflict_type,
                status: ConflictStatus::Pending,
                resolution: None,
                created_at: now,
                updated_at: now,
            }))));
        }
    }

    let applied = write_change(conn, applier, request, prepared, current).await?;
    Ok(applied.map(ChangeResult::Applied))
}

/// Write `prepared` against the entity as last read.
///
/// Returns `None` when the stored revision no longer matches `current`.
async fn write_change(
    conn: &Connection,
    applier: &dyn ChangeApplier,
    request: &SyncRequest,
    prepared: &PreparedChange,
    current: Option<SyncEntity>,
) -> Result<Option<AppliedChange>> {
    let write = applier.apply(prepared, current.as_ref())?;
    let change_ts = prepared.timestamp.timestamp_millis();
    // Revisions only move forward, even when device clocks lag.
    let revision = current
        .as_ref()
        .map_or(change_ts, |entity| change_ts.max(entity.revision + 1));
    let before = current.filter(|entity| !entity.is_deleted).map(|entity| entity.data);

    transaction::begin(conn).await?;
    let written = write_and_audit(conn, request, &write, before, revision).await;
    if !transaction::finish(conn, written).await? {
        return Ok(None);
    }

    tracing::debug!(data_id = write.id(), operation = %prepared.operation, revision, "Change applied");
    Ok(Some(AppliedChange {
        id: write.id().to_string(),
        operation: prepared.operation,
        timestamp: prepared.timestamp,
        revision,
    }))
}

/// Execute one write plus its audit entry; `false` means the CAS lost.
async fn write_and_audit(
    conn: &Connection,
    request: &SyncRequest,
    write: &EntityWrite,
    before: Option<Value>,
    revision: i64,
) -> Result<bool> {
    let entities = LibSqlEntityRepository::new(conn);
    let user_id = request.user_id.as_str();
    let data_type = request.data_type;
    let device = Some(request.device_id.as_str());

    let (action, after) = match write {
        EntityWrite::Insert { id, data } => {
            if entities
                .insert(user_id, data_type, id, data, revision, device)
                .await?
                .is_none()
            {
                return Err(Error::InvalidInput(format!("{data_type} {id} already exists")));
            }
            (AuditAction::Create, Some(data.clone()))
        }
        EntityWrite::Replace {
            id,
            expected_revision,
            data,
        } => {
            if !entities
                .compare_and_swap(user_id, data_type, id, *expected_revision, data, revision, device)
                .await?
            {
                return Ok(false);
            }
            (AuditAction::Update, Some(data.clone()))
        }
        EntityWrite::Delete {
            id,
            expected_revision,
        } => {
            if !entities
                .compare_and_delete(user_id, data_type, id, *expected_revision, revision, device)
                .await?
            {
                return Ok(false);
            }
            (AuditAction::Delete, None)
        }
    };

    LibSqlAuditRepository::new(conn)
        .append(&NewAuditEntry {
            user_id: user_id.to_string(),
            device_id: Some(request.device_id.clone()),
            data_type,
            data_id: write.id().to_string(),
            action,
            before,
            after,
        })
        .await?;
    Ok(true)
}

/// Store every conflict of a batch in one transaction
async fn persist_conflicts(
    conn: &Connection,
    conflicts: &[DataConflict],
    device_id: &str,
) -> Result<()> {
    if conflicts.is_empty() {
        return Ok(());
    }

    transaction::begin(conn).await?;
    let stored = async {
        let repo = LibSqlConflictRepository::new(conn);
        let audit = LibSqlAuditRepository::new(conn);
        for conflict in conflicts {
            repo.insert(conflict).await?;
            audit
                .append(&NewAuditEntry {
                    user_id: conflict.user_id.clone(),
                    device_id: Some(device_id.to_string()),
                    data_type: conflict.data_type,
                    data_id: conflict.data_id.clone(),
                    action: AuditAction::Conflict,
                    before: Some(conflict.local_version.data.clone()),
                    after: Some(conflict.remote_version.data.clone()),
                })
                .await?;
        }
        Ok(())
    }
    .await;
    transaction::finish(conn, stored).await
}
