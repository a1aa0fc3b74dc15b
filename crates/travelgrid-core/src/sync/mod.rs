//! Multi-device sync engine: registry, ingestion, detection, resolution.

mod appliers;
mod detector;
mod ingest;
mod merge;
mod resolver;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

pub use appliers::{
    ApplierRegistry, BudgetApplier, ChangeApplier, ChecklistApplier, EntityWrite, PreparedChange,
    TripApplier,
};
pub use detector::{classify, detect_conflict, DetectedConflict};
pub use ingest::{SyncOutcome, SyncRequest};
pub use merge::{merge_fields, union_by_key, MergeOptions, Side};

use crate::db::{
    AuditRepository, ConflictRepository, Database, DeviceRepository, EntityRepository,
    LibSqlAuditRepository, LibSqlConflictRepository, LibSqlDeviceRepository,
    LibSqlEntityRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    AuditEntry, ConflictId, ConflictStatus, DataConflict, DataType, DeviceInfo,
    DeviceSyncRecord, ResolutionRequest, SyncEntity,
};
use crate::util::{require_text, user_fingerprint};

/// Default cap on changes accepted in one sync call
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;
/// Audit entries returned when no limit is given
pub const DEFAULT_AUDIT_LIMIT: usize = 50;
/// Upper bound for audit trail page size
pub const MAX_AUDIT_LIMIT: usize = 500;

/// Fresh opaque device identifier
pub fn generate_device_id() -> String {
    Uuid::new_v4().to_string()
}

/// Thread-safe service for sync operations.
#[derive(Clone)]
pub struct SyncService {
    db: Arc<Mutex<Database>>,
    appliers: Arc<ApplierRegistry>,
    max_batch_size: usize,
}

impl SyncService {
    /// Open a service backed by the database file at `db_path`.
    ///
    /// `:memory:` opens a private in-memory database.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if db_path.as_os_str() == ":memory:" {
            return Self::open_in_memory().await;
        }
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path).await?;
        tracing::info!("Sync database ready at {}", db_path.display());
        Ok(Self::from_database(db))
    }

    /// Open an in-memory service (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self::from_database(db))
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            appliers: Arc::new(ApplierRegistry::default()),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    /// Override the per-call change limit
    #[must_use]
    pub const fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Register (or refresh) a device for one data type.
    pub async fn register_device(
        &self,
        user_id: &str,
        device_id: &str,
        data_type: DataType,
        device_info: &DeviceInfo,
    ) -> Result<DeviceSyncRecord> {
        let user_id = require_text(user_id, "userId")?;
        let device_id = require_text(device_id, "deviceId")?;

        let db = self.db.lock().await;
        let record = LibSqlDeviceRepository::new(db.connection())
            .upsert(&user_id, &device_id, data_type, device_info)
            .await?;
        tracing::info!(
            user = user_fingerprint(&user_id),
            data_type = %data_type,
            "Device registered for sync"
        );
        Ok(record)
    }

    /// Sync records for a user, optionally narrowed by device and data type.
    pub async fn get_sync_status(
        &self,
        user_id: &str,
        device_id: Option<&str>,
        data_type: Option<DataType>,
    ) -> Result<Vec<DeviceSyncRecord>> {
        let user_id = require_text(user_id, "userId")?;
        let device_id = device_id.map(str::trim).filter(|id| !id.is_empty());

        let db = self.db.lock().await;
        LibSqlDeviceRepository::new(db.connection())
            .list(&user_id, device_id, data_type)
            .await
    }

    /// Apply a batch of device changes.
    pub async fn sync_data(&self, mut request: SyncRequest) -> Result<SyncOutcome> {
        request.user_id = require_text(&request.user_id, "userId")?;
        request.device_id = require_text(&request.device_id, "deviceId")?;
        if request.changes.len() > self.max_batch_size {
            tracing::warn!(
                user = user_fingerprint(&request.user_id),
                changes = request.changes.len(),
                "Sync batch over limit"
            );
            return Err(Error::InvalidInput(format!(
                "changes exceeds limit of {} per request",
                self.max_batch_size
            )));
        }

        let db = self.db.lock().await;
        ingest::ingest(db.connection(), &self.appliers, &request).await
    }

    /// A user's conflicts with the given status, newest first.
    pub async fn get_conflicts(
        &self,
        user_id: &str,
        status: ConflictStatus,
    ) -> Result<Vec<DataConflict>> {
        let user_id = require_text(user_id, "userId")?;
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list(&user_id, status)
            .await
    }

    /// One conflict owned by the user.
    pub async fn get_conflict(&self, user_id: &str, conflict_id: &ConflictId) -> Result<DataConflict> {
        let db = self.db.lock().await;
        resolver::find_conflict(db.connection(), user_id, conflict_id).await
    }

    /// Resolve a pending conflict owned by the user.
    pub async fn resolve_conflict(
        &self,
        user_id: &str,
        conflict_id: &ConflictId,
        resolution: &ResolutionRequest,
    ) -> Result<DataConflict> {
        let db = self.db.lock().await;
        resolver::resolve(db.connection(), &self.appliers, user_id, conflict_id, resolution).await
    }

    /// Discard a pending conflict owned by the user.
    pub async fn discard_conflict(
        &self,
        user_id: &str,
        conflict_id: &ConflictId,
    ) -> Result<DataConflict> {
        let db = self.db.lock().await;
        resolver::discard(db.connection(), user_id, conflict_id).await
    }

    /// Newest audit entries for a user; `limit` defaults to 50, capped at 500.
    pub async fn get_audit_trail(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<AuditEntry>> {
        let user_id = require_text(user_id, "userId")?;
        let limit = limit
            .unwrap_or(DEFAULT_AUDIT_LIMIT)
            .clamp(1, MAX_AUDIT_LIMIT);

        let db = self.db.lock().await;
        LibSqlAuditRepository::new(db.connection())
            .list(&user_id, limit)
            .await
    }

    /// Live entity by id.
    pub async fn get_entity(
        &self,
        user_id: &str,
        data_type: DataType,
        id: &str,
    ) -> Result<Option<SyncEntity>> {
        let db = self.db.lock().await;
        LibSqlEntityRepository::new(db.connection())
            .get(user_id, data_type, id)
            .await
    }

    /// Live entities of one type, most recently revised first.
    pub async fn list_entities(&self, user_id: &str, data_type: DataType) -> Result<Vec<SyncEntity>> {
        let db = self.db.lock().await;
        LibSqlEntityRepository::new(db.connection())
            .list(user_id, data_type)
            .await
    }
}
