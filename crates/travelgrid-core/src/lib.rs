//! travelgrid-core - Sync engine for TravelGrid
//!
//! This crate contains the sync models, the libSQL storage layer, and the
//! conflict detection and resolution logic served by `travelgrid-api`.

pub mod db;
pub mod error;
pub mod models;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{ConflictId, DataType};
pub use sync::{generate_device_id, SyncOutcome, SyncRequest, SyncService};
