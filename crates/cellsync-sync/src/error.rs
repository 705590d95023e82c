//! # Sync Error Types
//!
//! Error types for queue, store and engine operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Queue       │  │     Store               │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  RecordNotFound │  │  StoreUnavailable       │ │
//! │  │  MissingDeviceId│  │  QueuePersist   │  │  StoreRejected          │ │
//! │  │  ConfigLoad/Save│  │  QueueCorrupt   │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Database     │  │   Ingestion     │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  DatabaseError  │  │  Ingestion      │  │  ShuttingDown           │ │
//! │  │                 │  │  Serialization  │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`StoreError`] is what an [`InspectionStore`](crate::storage::InspectionStore)
//! returns. Its two variants decide how a flush reacts:
//!
//! - `Rejected` concerns one record. The record's retry count goes up and the
//!   flush moves on to the next record.
//! - `Unavailable` concerns the whole store. The flush stops and the records
//!   not yet applied stay pending untouched.

use cellsync_core::{CoreError, IngestionError};
use cellsync_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// Store Errors
// =============================================================================

/// Failure reported by the shared inspection store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store refused this one change.
    #[error("Change rejected by store: {0}")]
    Rejected(String),

    /// The store cannot be reached at all.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        if err.is_unavailable() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Rejected(err.to_string())
        }
    }
}

// =============================================================================
// Sync Errors
// =============================================================================

/// Sync error type covering engine, queue and configuration failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (every change is stamped with it).
    #[error("Device ID not configured")]
    MissingDeviceId,

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Queue Errors
    // =========================================================================
    /// No record with this id is in the queue.
    #[error("Change record not found: {id}")]
    RecordNotFound { id: String },

    /// Writing the queue snapshot to durable storage failed.
    #[error("Failed to persist change queue: {0}")]
    QueuePersistFailed(String),

    /// The stored queue snapshot could not be decoded.
    #[error("Stored change queue is corrupt: {0}")]
    QueueCorrupt(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// The shared store could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The shared store refused a change.
    #[error("Store rejected change: {0}")]
    StoreRejected(String),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Ingestion Errors
    // =========================================================================
    /// The spreadsheet input could not be ingested at all.
    #[error("Ingestion failed: {0}")]
    Ingestion(#[from] IngestionError),

    /// Failed to serialize a value.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Worker is shutting down.
    #[error("Sync worker is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        if err.is_unavailable() {
            SyncError::StoreUnavailable(err.to_string())
        } else {
            SyncError::DatabaseError(err.to_string())
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Rejected(reason) => SyncError::StoreRejected(reason),
            StoreError::Unavailable(reason) => SyncError::StoreUnavailable(reason),
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Ingestion(e) => SyncError::Ingestion(e),
            other => SyncError::InvalidConfig(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried later.
    ///
    /// ## Retryable Errors
    /// - Store or database unreachable
    /// - Queue snapshot could not be written
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - A change the store rejected outright
    /// - Corrupt persisted data
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::StoreUnavailable(_)
                | SyncError::QueuePersistFailed(_)
                | SyncError::DatabaseError(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
