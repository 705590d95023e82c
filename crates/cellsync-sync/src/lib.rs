//! # cellsync-sync: Change Queue and Sync Engine for cellsync
//!
//! Every edit an inspector makes on a device becomes a queued change. The
//! engine applies queued changes to the shared inspection store, one flush
//! at a time, and tells the UI what happened through an event bus.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  UI (scanner app, supervisor view)                                     │
//! │     │ queue_change / ingest / subscribe                                 │
//! │     ▼                                                                   │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      SyncEngine (engine.rs)                      │  │
//! │  │                                                                  │  │
//! │  │  Shared via Arc, single-flight flush                             │  │
//! │  └───────┬───────────────────────┬──────────────────────┬───────────┘  │
//! │          ▼                       ▼                      ▼              │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌─────────────────────┐  │
//! │  │  ChangeQueue   │  │  InspectionStore   │  │     EventBus        │  │
//! │  │                │  │                    │  │                     │  │
//! │  │ Append-only    │  │ Memory or SQLite   │  │ sync-complete       │  │
//! │  │ persisted on   │  │ merge policy       │  │ sync-error          │  │
//! │  │ every change   │  │ LWW / FieldClock   │  │ remote-update ...   │  │
//! │  └───────┬────────┘  └────────────────────┘  └─────────────────────┘  │
//! │          ▼                                                             │
//! │  QueueStorage (memory or SQLite kv slot)                               │
//! │                                                                         │
//! │  SyncWorker: periodic + triggered flush                                │
//! │  StoreWatcher: revision polling → StoreChanged                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - Sync configuration (device identity, retries, storage)
//! - [`devices`] - Registry of devices seen by the engine
//! - [`engine`] - `SyncEngine` and flush outcomes
//! - [`error`] - Sync and store error types
//! - [`events`] - Typed event bus
//! - [`queue`] - Durable change queue
//! - [`retry`] - Retry limit and backoff
//! - [`storage`] - Queue storage and inspection store traits plus adapters
//! - [`worker`] - Background flush and store watch loops
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cellsync_sync::{EventBus, EventKind, SyncConfig, SyncEngine, SyncWorker};
//! use cellsync_db::{Database, DbConfig};
//!
//! let config = SyncConfig::load_or_default(None);
//! let db = Database::new(DbConfig::new("cellsync.db")).await?;
//! let engine = Arc::new(SyncEngine::with_database(config, &db, EventBus::new()).await?);
//!
//! engine.events().subscribe(EventKind::RemoteUpdate, |event| {
//!     println!("{event:?}");
//!     Ok(())
//! });
//!
//! let (worker, handle) = SyncWorker::new(engine.clone());
//! tokio::spawn(worker.run());
//!
//! engine.queue_change(address, InspectionPatch::checked_by("olga", Utc::now())).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod devices;
pub mod engine;
pub mod error;
pub mod events;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod worker;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{DeviceConfig, StorageSettings, SyncConfig, SyncSettings};
pub use devices::{DeviceInfo, DeviceRegistry};
pub use engine::{FlushOutcome, FlushReport, QueueStatus, SkipReason, SyncEngine};
pub use error::{StoreError, SyncError, SyncResult};
pub use events::{Delivery, EventBus, EventKind, HandlerError, Subscription, SyncEvent};
pub use queue::{ChangeQueue, ChangeRecord, ChangeStatus, QueueCounts, QueueIdentity};
pub use retry::RetryPolicy;
pub use storage::{
    InspectionStore, MemoryInspectionStore, MemoryQueueStorage, QueueStorage,
    SqliteInspectionStore, SqliteQueueStorage,
};
pub use worker::{StoreWatcher, StoreWatcherHandle, SyncTrigger, SyncWorker, SyncWorkerHandle};
