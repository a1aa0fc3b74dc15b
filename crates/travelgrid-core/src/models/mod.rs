//! Data models for TravelGrid sync

mod audit;
mod change;
mod device;
mod entity;
mod sync_conflict;

pub use audit::{AuditAction, AuditEntry, NewAuditEntry};
pub use change::{AppliedChange, Change, FailedChange, Operation};
pub use device::{DataType, DeviceInfo, DeviceSyncRecord, SyncStatus};
pub use entity::SyncEntity;
pub use sync_conflict::{
    ConflictId, ConflictResolution, ConflictStatus, ConflictType, DataConflict,
    ResolutionRequest, ResolutionStrategy, ResolvedBy, VersionSnapshot,
};
