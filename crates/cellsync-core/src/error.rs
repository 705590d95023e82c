//! # Error Types
//!
//! Domain-specific error types for cellsync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  cellsync-core errors (this file)                                      │
//! │  ├── AddressError     - Cell address cannot be parsed (row-local)      │
//! │  ├── IngestionError   - Whole row sequence is malformed (fatal)        │
//! │  └── CoreError        - General domain errors                          │
//! │                                                                         │
//! │  cellsync-db errors (separate crate)                                   │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  cellsync-sync errors (separate crate)                                 │
//! │  └── SyncError        - Queue / store / config failures                │
//! │                                                                         │
//! │  Flow: AddressError → CoreError → DbError → SyncError → Consumer       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Row-level findings that are NOT errors (warnings, anomalies) live in
//! [`crate::ingest`] as plain data, so callers never have to tell them apart
//! by parsing message text.

use thiserror::Error;

// =============================================================================
// Address Error
// =============================================================================

/// A warehouse location string could not be mapped to a [`crate::CellAddress`].
///
/// Parsing never guesses: anything that does not structurally match one of
/// the supported dialects ends up here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Input was empty or whitespace only.
    #[error("cell address is empty")]
    Empty,

    /// Input matched none of the supported dialects.
    #[error("unrecognized cell address '{input}'")]
    Unrecognized { input: String },

    /// Input had the right shape but a part had the wrong length or alphabet.
    #[error("invalid {part} '{value}' in cell address '{input}'")]
    InvalidPart {
        input: String,
        part: &'static str,
        value: String,
    },
}

impl AddressError {
    /// The raw text that failed to parse (empty for [`AddressError::Empty`]).
    pub fn input(&self) -> &str {
        match self {
            AddressError::Empty => "",
            AddressError::Unrecognized { input } => input,
            AddressError::InvalidPart { input, .. } => input,
        }
    }
}

// =============================================================================
// Ingestion Error
// =============================================================================

/// The row sequence handed to the normalizer is unusable as a whole.
///
/// Unlike row errors, this aborts the ingestion call and no partial report is
/// produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestionError {
    /// Input was not a sequence of rows.
    #[error("expected a sequence of rows, got {found}")]
    NotARowSequence { found: String },

    /// Input could not be decoded at all.
    #[error("row data could not be decoded: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for IngestionError {
    fn from(err: serde_json::Error) -> Self {
        IngestionError::Malformed(err.to_string())
    }
}

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Cell address failed to parse.
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// Ingestion was aborted.
    #[error("Ingestion error: {0}")]
    Ingestion(#[from] IngestionError),

    /// Status text did not name a known cell status.
    #[error("Unknown cell status: {0}")]
    UnknownStatus(String),

    /// Input validation failed.
    #[error("Validation error: {field}: {reason}")]
    Invalid { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
