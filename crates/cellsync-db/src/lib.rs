//! # cellsync-db: Database Layer for cellsync
//!
//! SQLite storage for a device: the durable slot the change queue persists
//! into, and the shared inspection store changes are applied to.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        cellsync Data Flow                               │
//! │                                                                         │
//! │  SyncEngine (cellsync-sync)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   cellsync-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐   │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │   │   │
//! │  │   │   (pool.rs)   │    │                │   │  (embedded)  │   │   │
//! │  │   │               │    │ KvSlotRepo     │   │ 001_initial  │   │   │
//! │  │   │ SqlitePool    │◄───│ InspectionRepo │   │   _schema    │   │   │
//! │  │   └───────────────┘    └────────────────┘   └──────────────┘   │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database file (path from SyncConfig [storage])                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cellsync_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("cellsync.db")).await?;
//! let state = db.inspections().get(&address).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::inspection::InspectionRepository;
pub use repository::kv::KvSlotRepository;
