//! Database layer for TravelGrid sync

mod audit_repository;
mod conflict_repository;
mod connection;
mod device_repository;
mod entity_repository;
mod migrations;
pub mod transaction;

pub use audit_repository::{AuditRepository, LibSqlAuditRepository};
pub use conflict_repository::{ConflictRepository, LibSqlConflictRepository};
pub use connection::Database;
pub use device_repository::{DeviceRepository, LibSqlDeviceRepository};
pub use entity_repository::{EntityRepository, LibSqlEntityRepository};
