//! # Change Queue
//!
//! Durable, append-only list of local inspection edits waiting to reach the
//! shared store.
//!
//! ## Record Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       ChangeRecord Lifecycle                            │
//! │                                                                         │
//! │  enqueue()                                                             │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  PENDING ──── applied ────────────────────────────►  SYNCED            │
//! │     │  ▲                                             (kept for audit,  │
//! │     │  │ retry_count <= max_retries                   pruned later)    │
//! │     │  │                                                                │
//! │  rejected ── retry_count > max_retries ──────────►  FAILED             │
//! │                                                      (needs an operator│
//! │                                                       via retry_failed)│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutating call writes the whole record vector to the
//! [`QueueStorage`] slot before it returns. A process killed right after
//! `enqueue` therefore finds the change again on the next [`ChangeQueue::load`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cellsync_core::{CellAddress, DeviceType, InspectionPatch};

use crate::error::{SyncError, SyncResult};
use crate::storage::QueueStorage;

// =============================================================================
// Change Record
// =============================================================================

/// Status of a queued change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    Synced,
    Failed,
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeStatus::Pending => write!(f, "pending"),
            ChangeStatus::Synced => write!(f, "synced"),
            ChangeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One local edit of one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Unique change id (UUID v4).
    pub id: String,
    pub cell_address: CellAddress,
    /// Device that made the edit.
    pub device_id: String,
    pub device_type: DeviceType,
    pub created_at: DateTime<Utc>,
    /// Fields of the inspection state this edit sets.
    pub payload: InspectionPatch,
    pub status: ChangeStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Not attempted before this time. `None` means on the next flush.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synced_by: Option<String>,
}

impl ChangeRecord {
    pub fn is_pending(&self) -> bool {
        self.status == ChangeStatus::Pending
    }

    /// Pending and not deferred past `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Who stamps new records, and with which retry limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueIdentity {
    pub device_id: String,
    pub device_type: DeviceType,
    pub max_retries: u32,
}

/// Record counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub total: usize,
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
}

// =============================================================================
// Change Queue
// =============================================================================

/// Ordered change records of one device, mirrored into a durable slot.
pub struct ChangeQueue {
    records: Vec<ChangeRecord>,
    storage: Arc<dyn QueueStorage>,
    key: String,
    identity: QueueIdentity,
}

impl std::fmt::Debug for ChangeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeQueue")
            .field("key", &self.key)
            .field("identity", &self.identity)
            .field("records", &self.records.len())
            .finish()
    }
}

impl ChangeQueue {
    /// Restores the queue stored under `key`, or starts an empty one.
    pub async fn load(
        storage: Arc<dyn QueueStorage>,
        key: impl Into<String>,
        identity: QueueIdentity,
    ) -> SyncResult<Self> {
        let key = key.into();
        let records = match storage.load(&key).await? {
            Some(json) => serde_json::from_str::<Vec<ChangeRecord>>(&json)
                .map_err(|e| SyncError::QueueCorrupt(e.to_string()))?,
            None => Vec::new(),
        };

        info!(
            key = %key,
            records = records.len(),
            pending = records.iter().filter(|r| r.is_pending()).count(),
            "Change queue loaded"
        );

        Ok(ChangeQueue {
            records,
            storage,
            key,
            identity,
        })
    }

    /// Writes the whole record vector to the storage slot.
    pub async fn persist(&self) -> SyncResult<()> {
        let json = serde_json::to_string(&self.records)?;
        self.storage.save(&self.key, &json).await
    }

    /// Appends a change and persists it. Returns the new record id.
    ///
    /// Never merges with an earlier pending change of the same cell.
    /// If the snapshot cannot be written the record is dropped again and
    /// the error returned.
    pub async fn enqueue(
        &mut self,
        address: CellAddress,
        payload: InspectionPatch,
    ) -> SyncResult<String> {
        let record = ChangeRecord {
            id: Uuid::new_v4().to_string(),
            cell_address: address,
            device_id: self.identity.device_id.clone(),
            device_type: self.identity.device_type,
            created_at: Utc::now(),
            payload,
            status: ChangeStatus::Pending,
            retry_count: 0,
            max_retries: self.identity.max_retries,
            last_error: None,
            next_attempt_at: None,
            synced_at: None,
            synced_by: None,
        };
        let id = record.id.clone();

        debug!(id = %id, address = %record.cell_address, "Enqueuing change");
        self.records.push(record);

        if let Err(e) = self.persist().await {
            self.records.pop();
            return Err(e);
        }
        Ok(id)
    }

    /// Pending records in queue order.
    pub fn pending_records(&self) -> Vec<&ChangeRecord> {
        self.records.iter().filter(|r| r.is_pending()).collect()
    }

    /// Snapshot of the records a flush at `now` should apply, in queue order.
    ///
    /// Once a cell has a pending record that is deferred, its later records
    /// are held back too, so one cell's changes never overtake each other.
    pub fn due_records(&self, now: DateTime<Utc>) -> Vec<ChangeRecord> {
        let mut held: BTreeSet<&CellAddress> = BTreeSet::new();
        let mut due = Vec::new();

        for record in self.records.iter().filter(|r| r.is_pending()) {
            if held.contains(&record.cell_address) {
                continue;
            }
            if record.is_due(now) {
                due.push(record.clone());
            } else {
                held.insert(&record.cell_address);
            }
        }
        due
    }

    /// Marks a pending record as applied by `by`.
    ///
    /// Returns `false` without touching anything when the record is no
    /// longer pending, so a second call for the same id changes nothing.
    pub async fn mark_synced(
        &mut self,
        id: &str,
        by: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<bool> {
        let index = self.position(id)?;
        let record = &mut self.records[index];
        if record.status != ChangeStatus::Pending {
            debug!(id = %id, status = %record.status, "Record already settled");
            return Ok(false);
        }

        let previous = record.clone();
        record.status = ChangeStatus::Synced;
        record.synced_at = Some(at);
        record.synced_by = Some(by.to_string());
        record.next_attempt_at = None;

        self.persist_or_restore(index, previous).await?;
        Ok(true)
    }

    /// Records a rejected application attempt.
    ///
    /// The retry count goes up; past the record's `max_retries` it becomes
    /// [`ChangeStatus::Failed`], otherwise it stays pending until
    /// `next_attempt_at`. Returns the resulting status.
    pub async fn mark_failed(
        &mut self,
        id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> SyncResult<ChangeStatus> {
        let index = self.position(id)?;
        let record = &mut self.records[index];
        if record.status != ChangeStatus::Pending {
            return Ok(record.status);
        }

        let previous = record.clone();
        record.retry_count += 1;
        record.last_error = Some(error.to_string());

        if record.retry_count > record.max_retries {
            warn!(
                id = %id,
                address = %record.cell_address,
                retries = record.retry_count,
                error = %error,
                "Change failed permanently"
            );
            record.status = ChangeStatus::Failed;
            record.next_attempt_at = None;
        } else {
            debug!(id = %id, retries = record.retry_count, "Change will be retried");
            record.next_attempt_at = next_attempt_at;
        }

        let status = record.status;
        self.persist_or_restore(index, previous).await?;
        Ok(status)
    }

    /// Puts a terminally failed record back to pending with a fresh retry
    /// budget. Returns `false` if the record had not failed.
    pub async fn retry_failed(&mut self, id: &str) -> SyncResult<bool> {
        let index = self.position(id)?;
        let record = &mut self.records[index];
        if record.status != ChangeStatus::Failed {
            return Ok(false);
        }

        info!(id = %id, address = %record.cell_address, "Re-queuing failed change");
        let previous = record.clone();
        record.status = ChangeStatus::Pending;
        record.retry_count = 0;
        record.next_attempt_at = None;

        self.persist_or_restore(index, previous).await?;
        Ok(true)
    }

    /// Drops every record.
    pub async fn clear(&mut self) -> SyncResult<()> {
        let removed = std::mem::take(&mut self.records);
        if let Err(e) = self.persist().await {
            self.records = removed;
            return Err(e);
        }
        info!(removed = removed.len(), "Change queue cleared");
        Ok(())
    }

    /// Drops synced records applied before `older_than`. Returns how many.
    pub async fn prune_synced(&mut self, older_than: DateTime<Utc>) -> SyncResult<usize> {
        let expired = |r: &ChangeRecord| {
            r.status == ChangeStatus::Synced && r.synced_at.map_or(false, |at| at < older_than)
        };
        if !self.records.iter().any(expired) {
            return Ok(0);
        }

        let previous = self.records.clone();
        self.records.retain(|r| !expired(r));
        let pruned = previous.len() - self.records.len();

        if let Err(e) = self.persist().await {
            self.records = previous;
            return Err(e);
        }
        info!(pruned, "Pruned synced changes");
        Ok(pruned)
    }

    /// Record counts by status.
    pub fn status(&self) -> QueueCounts {
        let mut counts = QueueCounts {
            total: self.records.len(),
            ..Default::default()
        };
        for record in &self.records {
            match record.status {
                ChangeStatus::Pending => counts.pending += 1,
                ChangeStatus::Synced => counts.synced += 1,
                ChangeStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// All records in queue order.
    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&ChangeRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn identity(&self) -> &QueueIdentity {
        &self.identity
    }

    fn position(&self, id: &str) -> SyncResult<usize> {
        self.records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| SyncError::RecordNotFound { id: id.to_string() })
    }

    /// Persists after a change to `records[index]`, putting `previous` back
    /// if the snapshot cannot be written, so memory never runs ahead of
    /// storage.
    async fn persist_or_restore(&mut self, index: usize, previous: ChangeRecord) -> SyncResult<()> {
        if let Err(e) = self.persist().await {
            self.records[index] = previous;
            return Err(e);
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryQueueStorage;
    use cellsync_core::CellStatus;

    fn identity() -> QueueIdentity {
        QueueIdentity {
            device_id: "scanner-1".to_string(),
            device_type: DeviceType::Mobile,
            max_retries: 2,
        }
    }

    fn addr(s: &str) -> CellAddress {
        CellAddress::parse(s).unwrap()
    }

    fn occupied() -> InspectionPatch {
        InspectionPatch {
            system_status: Some(CellStatus::Occupied),
            ..Default::default()
        }
    }

    async fn queue(storage: &Arc<MemoryQueueStorage>) -> ChangeQueue {
        ChangeQueue::load(storage.clone(), "q", identity())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_appends_and_persists() {
        let storage = Arc::new(MemoryQueueStorage::new());
        let mut q = queue(&storage).await;

        let first = q.enqueue(addr("A01-01-01-A"), occupied()).await.unwrap();
        let second = q.enqueue(addr("A01-01-01-A"), occupied()).await.unwrap();
        assert_ne!(first, second);

        let pending = q.pending_records();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[0].device_id, "scanner-1");
        assert_eq!(pending[0].max_retries, 2);

        let stored = storage.snapshot("q").unwrap();
        let decoded: Vec<ChangeRecord> = serde_json::from_str(&stored).unwrap();
        assert_eq!(decoded, q.records());
    }

    #[tokio::test]
    async fn test_failed_after_max_retries() {
        let storage = Arc::new(MemoryQueueStorage::new());
        let mut q = queue(&storage).await;
        let id = q.enqueue(addr("A01-01-01-A"), occupied()).await.unwrap();

        assert_eq!(q.mark_failed(&id, "nope", None).await.unwrap(), ChangeStatus::Pending);
        assert_eq!(q.mark_failed(&id, "nope", None).await.unwrap(), ChangeStatus::Pending);
        assert_eq!(q.mark_failed(&id, "nope", None).await.unwrap(), ChangeStatus::Failed);

        assert!(q.pending_records().is_empty());
        assert_eq!(q.get(&id).unwrap().retry_count, 3);
        assert_eq!(q.get(&id).unwrap().last_error.as_deref(), Some("nope"));
        assert_eq!(q.status().failed, 1);

        assert!(q.retry_failed(&id).await.unwrap());
        assert_eq!(q.pending_records().len(), 1);
        assert_eq!(q.get(&id).unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_mark_synced_is_idempotent() {
        let storage = Arc::new(MemoryQueueStorage::new());
        let mut q = queue(&storage).await;
        let id = q.enqueue(addr("A01-01-01-A"), occupied()).await.unwrap();

        assert!(q.mark_synced(&id, "scanner-1", Utc::now()).await.unwrap());
        assert!(!q.mark_synced(&id, "scanner-1", Utc::now()).await.unwrap());

        let counts = q.status();
        assert_eq!(counts.synced, 1);
        assert_eq!(counts.total, 1);
        assert_eq!(counts.pending, 0);

        // A synced record is not turned back by a late failure report.
        assert_eq!(q.mark_failed(&id, "late", None).await.unwrap(), ChangeStatus::Synced);
    }

    /// Memory slots whose writes can be switched off.
    #[derive(Default)]
    struct SwitchableStorage {
        inner: MemoryQueueStorage,
        broken: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl QueueStorage for SwitchableStorage {
        async fn load(&self, key: &str) -> SyncResult<Option<String>> {
            self.inner.load(key).await
        }

        async fn save(&self, key: &str, value: &str) -> SyncResult<()> {
            if self.broken.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(SyncError::QueuePersistFailed("disk full".into()));
            }
            self.inner.save(key, value).await
        }
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_as_stored() {
        let storage = Arc::new(SwitchableStorage::default());
        let mut q = ChangeQueue::load(storage.clone(), "q", identity())
            .await
            .unwrap();
        let pending = q.enqueue(addr("A01-01-01-A"), occupied()).await.unwrap();
        let failed = q.enqueue(addr("A01-01-02-A"), occupied()).await.unwrap();
        for _ in 0..3 {
            q.mark_failed(&failed, "nope", None).await.unwrap();
        }
        let before = q.records().to_vec();

        storage.broken.store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(q.mark_synced(&pending, "scanner-1", Utc::now()).await.is_err());
        assert!(q.mark_failed(&pending, "nope", None).await.is_err());
        assert!(q.retry_failed(&failed).await.is_err());
        assert!(q.enqueue(addr("A01-01-03-A"), occupied()).await.is_err());
        assert_eq!(q.records(), before.as_slice());

        let stored = storage.inner.snapshot("q").unwrap();
        let decoded: Vec<ChangeRecord> = serde_json::from_str(&stored).unwrap();
        assert_eq!(decoded, before);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let storage = Arc::new(MemoryQueueStorage::new());
        let mut q = queue(&storage).await;
        let err = q.mark_synced("missing", "x", Utc::now()).await.unwrap_err();
        assert!(matches!(err, SyncError::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn test_deferred_record_holds_back_later_changes_of_its_cell() {
        let storage = Arc::new(MemoryQueueStorage::new());
        let mut q = queue(&storage).await;
        let now = Utc::now();

        let a1 = q.enqueue(addr("A01-01-01-A"), occupied()).await.unwrap();
        let b1 = q.enqueue(addr("B01-01-01-A"), occupied()).await.unwrap();
        let _a2 = q.enqueue(addr("A01-01-01-A"), occupied()).await.unwrap();

        q.mark_failed(&a1, "busy", Some(now + chrono::Duration::seconds(30)))
            .await
            .unwrap();

        let due: Vec<String> = q.due_records(now).into_iter().map(|r| r.id).collect();
        assert_eq!(due, vec![b1.clone()]);

        let later = now + chrono::Duration::seconds(31);
        assert_eq!(q.due_records(later).len(), 3);
    }

    #[tokio::test]
    async fn test_prune_and_clear() {
        let storage = Arc::new(MemoryQueueStorage::new());
        let mut q = queue(&storage).await;
        let now = Utc::now();

        let old = q.enqueue(addr("A01-01-01-A"), occupied()).await.unwrap();
        let fresh = q.enqueue(addr("A01-01-02-A"), occupied()).await.unwrap();
        q.enqueue(addr("A01-01-03-A"), occupied()).await.unwrap();

        q.mark_synced(&old, "d", now - chrono::Duration::days(10))
            .await
            .unwrap();
        q.mark_synced(&fresh, "d", now).await.unwrap();

        let pruned = q
            .prune_synced(now - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(q.status().total, 2);

        q.clear().await.unwrap();
        assert_eq!(q.status(), QueueCounts::default());
        assert_eq!(storage.snapshot("q").as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot() {
        let storage = Arc::new(MemoryQueueStorage::new());
        storage.save("q", "{not json").await.unwrap();

        let err = ChangeQueue::load(storage.clone(), "q", identity())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::QueueCorrupt(_)));
    }
}
