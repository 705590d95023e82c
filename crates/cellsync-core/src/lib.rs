//! # cellsync-core: Pure Domain Logic for Cell Inspection
//!
//! Everything in this crate is deterministic and free of I/O. It knows how
//! to read warehouse addresses, how to turn spreadsheet rows into cell
//! records, how to compare what a cell should hold with what was counted,
//! and how a change is merged into a cell's inspection state.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        cellsync Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              UI (external: scanner app, supervisor view)        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ queue_change / ingest / events         │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              cellsync-sync (queue, engine, event bus)           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ cellsync-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐  ┌──────────┐  ┌───────────┐  ┌─────────────┐   │   │
//! │  │   │ address  │  │  ingest  │  │validation │  │   merge     │   │   │
//! │  │   │CellAddr. │  │Normalizer│  │ compare() │  │MergePolicy  │   │   │
//! │  │   └──────────┘  └──────────┘  └───────────┘  └─────────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                  cellsync-db (Database Layer)                   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`address`] - CellAddress and its input dialects
//! - [`types`] - Manifests, records, inspection state, patches
//! - [`validation`] - Expected vs. actual manifest comparison
//! - [`ingest`] - Spreadsheet row normalization
//! - [`merge`] - Applying patches under a merge policy
//! - [`monitoring`] - Display classification for the supervisor overview
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use cellsync_core::{compare, ArticleManifest, ValidationKind};
//!
//! let expected = ArticleManifest::new().with("SKU-1", 5);
//! let counted = ArticleManifest::new().with("SKU-1", 3);
//!
//! let result = compare(&expected, Some(&counted));
//! assert_eq!(result.kind, ValidationKind::CountMismatch);
//! assert_eq!(result.actual_count, Some(3));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod address;
pub mod error;
pub mod ingest;
pub mod merge;
pub mod monitoring;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use address::CellAddress;
pub use error::{AddressError, CoreError, CoreResult, IngestionError};
pub use ingest::{
    normalize, normalize_json, Anomaly, IngestionReport, IngestionSummary, IngestionWarning,
    RawRow, RawValue, RowError, SpreadsheetNormalizer,
};
pub use merge::{FieldStamp, MergeOutcome, MergePolicy};
pub use types::*;
pub use validation::{compare, Severity, ValidationKind, ValidationResult};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Retry limit for a queued change before it is terminally failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
