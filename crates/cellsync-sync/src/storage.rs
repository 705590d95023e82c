//! # Storage Collaborators
//!
//! The two things the engine talks to besides its own memory:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ChangeQueue ──► QueueStorage        opaque key → string slot          │
//! │                  ├── MemoryQueueStorage                                │
//! │                  └── SqliteQueueStorage   (kv_slots table)             │
//! │                                                                         │
//! │  SyncEngine  ──► InspectionStore     shared per-cell inspection state  │
//! │                  ├── MemoryInspectionStore                             │
//! │                  └── SqliteInspectionStore (cell_inspections table)    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both traits are object safe so the engine holds them as `Arc<dyn ...>`
//! and tests can plug in stores that fail or block on purpose.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::debug;

use cellsync_core::{CellAddress, CellRecord, FieldStamp, InspectionState, MergePolicy};
use cellsync_db::{Database, InspectionRepository, KvSlotRepository};

use crate::error::{StoreError, SyncError, SyncResult};
use crate::queue::ChangeRecord;

// =============================================================================
// Traits
// =============================================================================

/// Durable slot the change queue snapshot is written to.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Reads the slot. `None` if it was never written.
    async fn load(&self, key: &str) -> SyncResult<Option<String>>;

    /// Replaces the slot content.
    async fn save(&self, key: &str, value: &str) -> SyncResult<()>;
}

/// The shared, authoritative inspection store.
#[async_trait]
pub trait InspectionStore: Send + Sync {
    /// Merges one queued change into its cell and returns the new state.
    ///
    /// A cell the store has never seen is created.
    async fn apply(
        &self,
        record: &ChangeRecord,
        policy: MergePolicy,
    ) -> Result<InspectionState, StoreError>;

    /// Current state of one cell.
    async fn get(&self, address: &CellAddress) -> Result<Option<InspectionState>, StoreError>;

    /// Bulk import of ingested records. Returns how many were written.
    async fn import(&self, records: &[CellRecord]) -> Result<usize, StoreError>;

    /// Store-wide revision, bumped by every write.
    async fn revision(&self) -> Result<i64, StoreError>;
}

/// Merges `record` into `current` the way every store does it.
pub fn merge_change(
    current: Option<InspectionState>,
    record: &ChangeRecord,
    policy: MergePolicy,
) -> InspectionState {
    let mut state = current.unwrap_or_default();
    let stamp = FieldStamp::new(record.created_at, record.device_id.clone());
    let outcome = state.apply_patch(&record.payload, &stamp, policy);

    if outcome.has_conflicts() {
        debug!(
            id = %record.id,
            address = %record.cell_address,
            conflicts = ?outcome.conflicts,
            "Concurrent edit kept newer values"
        );
    }

    state.synced_at = Some(Utc::now());
    state.synced_by = Some(record.device_id.clone());
    state
}

/// New state for an imported record given what the store already holds.
fn import_into(current: Option<InspectionState>, record: &CellRecord) -> InspectionState {
    match current {
        Some(mut existing) => {
            existing.system_status = record.system_status;
            existing.expected_manifest = record.expected_manifest.clone();
            existing.revalidate();
            existing
        }
        None => InspectionState::from_record(record),
    }
}

// =============================================================================
// In-Memory Implementations
// =============================================================================

/// Queue slots held in process memory.
#[derive(Debug, Default)]
pub struct MemoryQueueStorage {
    slots: Mutex<HashMap<String, String>>,
}

impl MemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current content of a slot.
    pub fn snapshot(&self, key: &str) -> Option<String> {
        self.slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(key).cloned())
    }
}

#[async_trait]
impl QueueStorage for MemoryQueueStorage {
    async fn load(&self, key: &str) -> SyncResult<Option<String>> {
        let slots = self
            .slots
            .lock()
            .map_err(|_| SyncError::Internal("queue slot lock poisoned".into()))?;
        Ok(slots.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> SyncResult<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| SyncError::Internal("queue slot lock poisoned".into()))?;
        slots.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Inspection store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryInspectionStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    cells: BTreeMap<CellAddress, InspectionState>,
    revision: i64,
}

impl MemoryInspectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every cell, ordered by address.
    pub async fn cells(&self) -> BTreeMap<CellAddress, InspectionState> {
        self.inner.read().await.cells.clone()
    }
}

#[async_trait]
impl InspectionStore for MemoryInspectionStore {
    async fn apply(
        &self,
        record: &ChangeRecord,
        policy: MergePolicy,
    ) -> Result<InspectionState, StoreError> {
        let mut inner = self.inner.write().await;
        let current = inner.cells.get(&record.cell_address).cloned();
        let state = merge_change(current, record, policy);

        inner.cells.insert(record.cell_address.clone(), state.clone());
        inner.revision += 1;
        Ok(state)
    }

    async fn get(&self, address: &CellAddress) -> Result<Option<InspectionState>, StoreError> {
        Ok(self.inner.read().await.cells.get(address).cloned())
    }

    async fn import(&self, records: &[CellRecord]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        for record in records {
            let current = inner.cells.get(&record.address).cloned();
            let state = import_into(current, record);
            inner.cells.insert(record.address.clone(), state);
            inner.revision += 1;
        }
        Ok(records.len())
    }

    async fn revision(&self) -> Result<i64, StoreError> {
        Ok(self.inner.read().await.revision)
    }
}

// =============================================================================
// SQLite Implementations
// =============================================================================

/// Queue slots in the `kv_slots` table.
#[derive(Debug, Clone)]
pub struct SqliteQueueStorage {
    slots: KvSlotRepository,
}

impl SqliteQueueStorage {
    pub fn new(db: &Database) -> Self {
        SqliteQueueStorage {
            slots: db.kv_slots(),
        }
    }
}

#[async_trait]
impl QueueStorage for SqliteQueueStorage {
    async fn load(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.slots.load(key).await?)
    }

    async fn save(&self, key: &str, value: &str) -> SyncResult<()> {
        self.slots
            .save(key, value)
            .await
            .map_err(|e| SyncError::QueuePersistFailed(e.to_string()))
    }
}

/// Inspection store in the `cell_inspections` table.
#[derive(Debug, Clone)]
pub struct SqliteInspectionStore {
    inspections: InspectionRepository,
}

impl SqliteInspectionStore {
    pub fn new(db: &Database) -> Self {
        SqliteInspectionStore {
            inspections: db.inspections(),
        }
    }
}

#[async_trait]
impl InspectionStore for SqliteInspectionStore {
    async fn apply(
        &self,
        record: &ChangeRecord,
        policy: MergePolicy,
    ) -> Result<InspectionState, StoreError> {
        let (state, _revision) = self
            .inspections
            .update_with(&record.cell_address, |current| {
                merge_change(current, record, policy)
            })
            .await?;
        Ok(state)
    }

    async fn get(&self, address: &CellAddress) -> Result<Option<InspectionState>, StoreError> {
        Ok(self.inspections.get(address).await?)
    }

    async fn import(&self, records: &[CellRecord]) -> Result<usize, StoreError> {
        Ok(self.inspections.import(records).await?)
    }

    async fn revision(&self) -> Result<i64, StoreError> {
        Ok(self.inspections.revision().await?)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
