//! Error types for travelgrid-core

use thiserror::Error;

/// Result type alias using travelgrid-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in travelgrid-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity, conflict or device not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sync attempted from a device without a sync record
    #[error("Device not registered for sync")]
    DeviceNotRegistered,

    /// No change applier exists for the data type
    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    /// Change operation is not create/update/delete
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Conflict left `pending` before this call
    #[error("Conflict already {0}")]
    AlreadyResolved(String),

    /// Compare-and-swap kept losing to concurrent writers
    #[error("Concurrent modification of {0}")]
    Concurrency(String),
}

impl Error {
    /// Whether the error is caused by the caller's input rather than the store.
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::InvalidInput(_)
                | Self::DeviceNotRegistered
                | Self::UnsupportedDataType(_)
                | Self::UnsupportedOperation(_)
                | Self::AlreadyResolved(_)
                | Self::Concurrency(_)
        )
    }
}
