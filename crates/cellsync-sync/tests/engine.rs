//! End-to-end behaviour of the sync engine against real and scripted stores.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

use cellsync_core::{
    ArticleManifest, CellAddress, CellRecord, CellStatus, DeviceType, InspectionPatch,
    InspectionState, MergePolicy, ValidationKind,
};
use cellsync_db::{Database, DbConfig};
use cellsync_sync::storage::merge_change;
use cellsync_sync::{
    ChangeRecord, ChangeStatus, EventBus, EventKind, FlushOutcome, FlushReport,
    InspectionStore, MemoryInspectionStore, MemoryQueueStorage, QueueStorage, SkipReason,
    StoreError, SyncConfig, SyncEngine, SyncError, SyncEvent, SyncResult,
};

// =============================================================================
// Helpers
// =============================================================================

fn addr(s: &str) -> CellAddress {
    CellAddress::parse(s).unwrap()
}

fn checked(operator: &str) -> InspectionPatch {
    InspectionPatch::checked_by(operator, Utc::now())
}

fn counted(sku: &str, quantity: u32) -> InspectionPatch {
    InspectionPatch {
        checked: Some(true),
        actual_manifest: Some(ArticleManifest::new().with(sku, quantity)),
        ..Default::default()
    }
}

fn config(device: &str) -> SyncConfig {
    SyncConfig::for_device(device, DeviceType::Mobile)
}

async fn engine_with(
    config: SyncConfig,
    storage: Arc<MemoryQueueStorage>,
    store: Arc<dyn InspectionStore>,
) -> Arc<SyncEngine> {
    Arc::new(
        SyncEngine::new(config, storage, store, EventBus::new())
            .await
            .unwrap(),
    )
}

/// Collects every event of the given kinds.
fn record_events(engine: &SyncEngine, kinds: &[EventKind]) -> Arc<Mutex<Vec<SyncEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in kinds {
        let sink = seen.clone();
        engine.events().subscribe(*kind, move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
    }
    seen
}

/// Store that answers according to a script before delegating to memory.
#[derive(Default)]
struct ScriptedStore {
    inner: MemoryInspectionStore,
    applies: AtomicUsize,
    /// Calls after this many successful applies report `Unavailable`.
    available_for: Option<usize>,
    /// Changes to this cell are rejected.
    reject: Option<CellAddress>,
}

#[async_trait]
impl InspectionStore for ScriptedStore {
    async fn apply(
        &self,
        record: &ChangeRecord,
        policy: MergePolicy,
    ) -> Result<InspectionState, StoreError> {
        if self.reject.as_ref() == Some(&record.cell_address) {
            return Err(StoreError::Rejected("cell is locked".into()));
        }
        let done = self.applies.load(Ordering::SeqCst);
        if self.available_for.is_some_and(|limit| done >= limit) {
            return Err(StoreError::Unavailable("connection lost".into()));
        }
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.inner.apply(record, policy).await
    }

    async fn get(&self, address: &CellAddress) -> Result<Option<InspectionState>, StoreError> {
        self.inner.get(address).await
    }

    async fn import(&self, records: &[CellRecord]) -> Result<usize, StoreError> {
        self.inner.import(records).await
    }

    async fn revision(&self) -> Result<i64, StoreError> {
        self.inner.revision().await
    }
}

/// Queue slots that refuse every write after the first `writable` saves.
struct FlakyStorage {
    inner: MemoryQueueStorage,
    saves: AtomicUsize,
    writable: AtomicUsize,
}

impl FlakyStorage {
    fn new(writable: usize) -> Self {
        FlakyStorage {
            inner: MemoryQueueStorage::new(),
            saves: AtomicUsize::new(0),
            writable: AtomicUsize::new(writable),
        }
    }

    fn heal(&self) {
        self.writable.store(usize::MAX, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueStorage for FlakyStorage {
    async fn load(&self, key: &str) -> SyncResult<Option<String>> {
        self.inner.load(key).await
    }

    async fn save(&self, key: &str, value: &str) -> SyncResult<()> {
        let attempt = self.saves.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.writable.load(Ordering::SeqCst) {
            return Err(SyncError::QueuePersistFailed("disk full".into()));
        }
        self.inner.save(key, value).await
    }
}

/// Store whose `apply` waits until the test opens the gate.
struct GatedStore {
    entered: Notify,
    gate: Semaphore,
    applies: AtomicUsize,
    state: Mutex<Option<InspectionState>>,
}

impl GatedStore {
    fn new() -> Self {
        GatedStore {
            entered: Notify::new(),
            gate: Semaphore::new(0),
            applies: AtomicUsize::new(0),
            state: Mutex::new(None),
        }
    }
}

#[async_trait]
impl InspectionStore for GatedStore {
    async fn apply(
        &self,
        record: &ChangeRecord,
        policy: MergePolicy,
    ) -> Result<InspectionState, StoreError> {
        self.entered.notify_one();
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        self.applies.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let merged = merge_change(state.take(), record, policy);
        *state = Some(merged.clone());
        Ok(merged)
    }

    async fn get(&self, _address: &CellAddress) -> Result<Option<InspectionState>, StoreError> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn import(&self, _records: &[CellRecord]) -> Result<usize, StoreError> {
        Ok(0)
    }

    async fn revision(&self) -> Result<i64, StoreError> {
        Ok(self.applies.load(Ordering::SeqCst) as i64)
    }
}

// =============================================================================
// Durability
// =============================================================================

#[tokio::test]
async fn restart_restores_pending_records_in_order() {
    let storage = Arc::new(MemoryQueueStorage::new());
    let store: Arc<dyn InspectionStore> = Arc::new(MemoryInspectionStore::new());

    let first = engine_with(config("scanner-1"), storage.clone(), store.clone()).await;
    let mut ids = Vec::new();
    for cell in ["A01-01-01-A", "A01-01-02-A", "A01-01-01-A"] {
        ids.push(first.enqueue(addr(cell), checked("olga")).await.unwrap());
    }
    let before = first.pending_records().await;
    drop(first);

    let restarted = engine_with(config("scanner-1"), storage, store).await;
    let after = restarted.pending_records().await;

    assert_eq!(after, before);
    assert_eq!(after.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), ids);
    assert!(after.iter().all(|r| r.status == ChangeStatus::Pending));
}

#[tokio::test]
async fn sqlite_engine_survives_restart() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();

    let engine = SyncEngine::with_database(config("scanner-1"), &db, EventBus::new())
        .await
        .unwrap();
    let id = engine
        .queue_change(addr("B03-02-11-C"), counted("SKU-9", 4))
        .await
        .unwrap();
    drop(engine);

    let restarted = SyncEngine::with_database(config("scanner-1"), &db, EventBus::new())
        .await
        .unwrap();
    let record = restarted.record(&id).await.unwrap();
    assert_eq!(record.status, ChangeStatus::Synced);
    assert_eq!(record.synced_by.as_deref(), Some("scanner-1"));

    let state = restarted
        .store()
        .get(&addr("B03-02-11-C"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        state.actual_manifest.unwrap().quantity_of("SKU-9"),
        Some(4)
    );
}

#[tokio::test]
async fn ingested_cells_are_validated_against_counts() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let engine = SyncEngine::with_database(config("desk-1"), &db, EventBus::new())
        .await
        .unwrap();
    let anomalies = record_events(&engine, &[EventKind::AnomalyDetected]);

    let rows = serde_json::json!([
        {"A": "A01-01-01-A", "B": "occupied", "C": "2", "D": "SKU-7"},
        {"A": "A01-01-02-A", "B": "occupied", "D": "SKU-1; SKU-2"},
        {"A": "A01-01-03-A", "B": "empty"},
    ]);
    let report = engine.ingest_json(&rows).unwrap();
    assert_eq!(report.records.len(), 3);
    assert_eq!(anomalies.lock().unwrap().len(), 1);

    let records: Vec<CellRecord> = report.records.values().cloned().collect();
    assert_eq!(engine.import_records(&records).await.unwrap(), 3);

    engine
        .queue_change(addr("A01-01-01-A"), counted("SKU-7", 1))
        .await
        .unwrap();

    let state = engine
        .store()
        .get(&addr("A01-01-01-A"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.system_status, CellStatus::Occupied);
    let validation = state.article_validation.unwrap();
    assert_eq!(validation.kind, ValidationKind::CountMismatch);
    assert_eq!(validation.expected_count, 2);
    assert_eq!(validation.actual_count, Some(1));
}

// =============================================================================
// Single Flight
// =============================================================================

#[tokio::test]
async fn concurrent_flush_is_skipped() {
    let store = Arc::new(GatedStore::new());
    let engine = engine_with(
        config("scanner-1"),
        Arc::new(MemoryQueueStorage::new()),
        store.clone(),
    )
    .await;
    engine
        .enqueue(addr("A01-01-01-A"), checked("olga"))
        .await
        .unwrap();

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.flush().await })
    };
    store.entered.notified().await;

    assert!(engine.is_flushing());
    assert_eq!(engine.flush().await, FlushOutcome::Skipped(SkipReason::InFlight));

    // Enqueue is not blocked by the running flush.
    engine
        .enqueue(addr("A01-01-02-A"), checked("olga"))
        .await
        .unwrap();

    store.gate.add_permits(10);
    let outcome = running.await.unwrap();
    assert_eq!(outcome.report().unwrap().applied, 1);
    assert_eq!(store.applies.load(Ordering::SeqCst), 1);
    assert!(!engine.is_flushing());

    // The record queued mid-flush is picked up by the next one.
    let next = engine.flush().await;
    assert_eq!(next.report().unwrap().applied, 1);
    assert_eq!(engine.queue_status().await.counts.pending, 0);
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn rejected_change_fails_after_max_retries() {
    let mut cfg = config("scanner-1");
    cfg.sync.max_retries = 2;
    let cell = addr("A01-01-01-A");
    let store = Arc::new(ScriptedStore {
        reject: Some(cell.clone()),
        ..Default::default()
    });
    let engine = engine_with(cfg, Arc::new(MemoryQueueStorage::new()), store).await;
    let events = record_events(&engine, &[EventKind::SyncComplete]);

    let id = engine.enqueue(cell, checked("olga")).await.unwrap();

    for _ in 0..2 {
        let outcome = engine.flush().await;
        assert_eq!(outcome.report().unwrap().retried, 1);
    }
    let last = engine.flush().await;
    assert_eq!(last.report().unwrap().failed, 1);

    let record = engine.record(&id).await.unwrap();
    assert_eq!(record.status, ChangeStatus::Failed);
    assert_eq!(record.retry_count, 3);
    assert_eq!(record.last_error.as_deref(), Some("cell is locked"));
    assert!(engine.pending_records().await.is_empty());

    assert_eq!(engine.flush().await, FlushOutcome::Skipped(SkipReason::NothingDue));
    assert_eq!(events.lock().unwrap().len(), 3);

    // An operator can put it back.
    assert!(engine.retry_failed(&id).await.unwrap());
    assert_eq!(engine.pending_records().await.len(), 1);
}

#[tokio::test]
async fn rejected_cell_holds_back_its_later_changes_only() {
    let blocked = addr("A01-01-01-A");
    let store = Arc::new(ScriptedStore {
        reject: Some(blocked.clone()),
        ..Default::default()
    });
    let engine = engine_with(
        config("scanner-1"),
        Arc::new(MemoryQueueStorage::new()),
        store,
    )
    .await;

    engine.enqueue(blocked.clone(), checked("a")).await.unwrap();
    engine.enqueue(addr("B01-01-01-A"), checked("b")).await.unwrap();
    let later = engine.enqueue(blocked, checked("c")).await.unwrap();

    let outcome = engine.flush().await;
    assert_eq!(
        outcome,
        FlushOutcome::Completed(FlushReport {
            applied: 1,
            retried: 1,
            failed: 0,
            held_back: 1,
        })
    );
    let held = engine.record(&later).await.unwrap();
    assert_eq!(held.retry_count, 0);
    assert!(held.is_pending());
}

#[tokio::test]
async fn backoff_defers_retries() {
    let mut cfg = config("scanner-1");
    cfg.sync.retry_initial_delay_ms = 60_000;
    let cell = addr("A01-01-01-A");
    let store = Arc::new(ScriptedStore {
        reject: Some(cell.clone()),
        ..Default::default()
    });
    let engine = engine_with(cfg, Arc::new(MemoryQueueStorage::new()), store).await;

    let id = engine.enqueue(cell, checked("olga")).await.unwrap();
    assert_eq!(engine.flush().await.report().unwrap().retried, 1);

    let record = engine.record(&id).await.unwrap();
    assert!(record.next_attempt_at.unwrap() > Utc::now());
    assert_eq!(engine.flush().await, FlushOutcome::Skipped(SkipReason::NothingDue));
}

// =============================================================================
// Aborted Cycles
// =============================================================================

#[tokio::test]
async fn unavailable_store_aborts_cycle_and_keeps_applied_records() {
    let store = Arc::new(ScriptedStore {
        available_for: Some(1),
        ..Default::default()
    });
    let engine = engine_with(
        config("scanner-1"),
        Arc::new(MemoryQueueStorage::new()),
        store,
    )
    .await;
    let events = record_events(
        &engine,
        &[
            EventKind::RemoteUpdate,
            EventKind::SyncError,
            EventKind::SyncComplete,
        ],
    );

    let first = engine.enqueue(addr("A01-01-01-A"), checked("a")).await.unwrap();
    let second = engine.enqueue(addr("A01-01-02-A"), checked("b")).await.unwrap();
    let third = engine.enqueue(addr("A01-01-03-A"), checked("c")).await.unwrap();

    let outcome = engine.flush().await;
    match &outcome {
        FlushOutcome::Aborted { report, error } => {
            assert_eq!(report.applied, 1);
            assert!(error.contains("connection lost"));
        }
        other => panic!("expected aborted flush, got {other:?}"),
    }

    assert_eq!(engine.record(&first).await.unwrap().status, ChangeStatus::Synced);
    for id in [&second, &third] {
        let record = engine.record(id).await.unwrap();
        assert_eq!(record.status, ChangeStatus::Pending);
        assert_eq!(record.retry_count, 0);
    }
    assert!(engine.last_sync_at().is_none());

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    match &events[0] {
        SyncEvent::RemoteUpdate { records } => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].id, first);
            assert_eq!(records[0].status, ChangeStatus::Synced);
        }
        other => panic!("expected remote update, got {other:?}"),
    }
    assert!(matches!(events[1], SyncEvent::SyncError { .. }));
}

#[tokio::test]
async fn unsaved_sync_mark_still_reports_the_applied_change() {
    let mut cfg = config("scanner-1");
    cfg.sync.merge_policy = MergePolicy::FieldClock;
    let storage = Arc::new(FlakyStorage::new(1));
    let store: Arc<dyn InspectionStore> = Arc::new(MemoryInspectionStore::new());
    let engine = Arc::new(
        SyncEngine::new(cfg, storage.clone(), store.clone(), EventBus::new())
            .await
            .unwrap(),
    );
    let events = record_events(&engine, &[EventKind::RemoteUpdate, EventKind::SyncError]);

    let cell = addr("A01-01-01-A");
    let id = engine.enqueue(cell.clone(), counted("SKU-1", 2)).await.unwrap();

    match engine.flush().await {
        FlushOutcome::Aborted { report, error } => {
            assert_eq!(report.applied, 1);
            assert!(error.contains("disk full"));
        }
        other => panic!("expected aborted flush, got {other:?}"),
    }
    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SyncEvent::RemoteUpdate { records } if records[0].id == id));
        assert!(matches!(events[1], SyncEvent::SyncError { .. }));
    }

    // Memory agrees with what was stored: still pending.
    assert!(engine.record(&id).await.unwrap().is_pending());
    assert!(store.get(&cell).await.unwrap().is_some());

    // Replaying the same change is a no-op for the cell.
    storage.heal();
    assert_eq!(engine.flush().await.report().unwrap().applied, 1);
    assert_eq!(engine.record(&id).await.unwrap().status, ChangeStatus::Synced);
    let state = store.get(&cell).await.unwrap().unwrap();
    assert_eq!(state.actual_manifest.unwrap().quantity_of("SKU-1"), Some(2));
    assert!(!state.discrepancy);
}

// =============================================================================
// Events
// =============================================================================

#[tokio::test]
async fn failing_handlers_do_not_disturb_sync() {
    let engine = engine_with(
        config("scanner-1"),
        Arc::new(MemoryQueueStorage::new()),
        Arc::new(MemoryInspectionStore::new()),
    )
    .await;

    engine
        .events()
        .subscribe(EventKind::RemoteUpdate, |_| Err("ui not ready".into()));
    engine
        .events()
        .subscribe(EventKind::RemoteUpdate, |_| panic!("render bug"));
    let events = record_events(&engine, &[EventKind::RemoteUpdate, EventKind::SyncComplete]);

    let id = engine
        .queue_change(addr("A01-01-01-A"), checked("olga"))
        .await
        .unwrap();

    assert_eq!(engine.record(&id).await.unwrap().status, ChangeStatus::Synced);
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], SyncEvent::RemoteUpdate { records } if records[0].id == id));
    assert_eq!(events[1], SyncEvent::SyncComplete { records_count: 1 });
}

#[tokio::test]
async fn registered_devices_are_announced() {
    let engine = engine_with(
        config("desk-1"),
        Arc::new(MemoryQueueStorage::new()),
        Arc::new(MemoryInspectionStore::new()),
    )
    .await;
    let events = record_events(&engine, &[EventKind::DeviceRegistered]);

    let phone = cellsync_sync::DeviceInfo::from_user_agent(
        "tsd-4",
        "Mozilla/5.0 (Linux; Android 11) Mobile Safari/537.36",
    );
    engine.register_device(phone);

    let devices = engine.connected_devices();
    assert_eq!(devices.len(), 2);
    assert!(devices
        .iter()
        .any(|d| d.device_id == "tsd-4" && d.device_type == DeviceType::Mobile));
    assert_eq!(events.lock().unwrap().len(), 1);
}

// =============================================================================
// Merge Policy
// =============================================================================

async fn concurrent_count(policy: MergePolicy) -> InspectionState {
    let storage_a = Arc::new(MemoryQueueStorage::new());
    let storage_b = Arc::new(MemoryQueueStorage::new());
    let store: Arc<dyn InspectionStore> = Arc::new(MemoryInspectionStore::new());

    let mut cfg_a = config("scanner-a");
    cfg_a.sync.merge_policy = policy;
    let mut cfg_b = config("scanner-b");
    cfg_b.sync.merge_policy = policy;

    let a = engine_with(cfg_a, storage_a, store.clone()).await;
    let b = engine_with(cfg_b, storage_b, store.clone()).await;
    let cell = addr("C02-05-03-B");

    // Scanner A counts first but is offline; scanner B counts later and syncs.
    a.enqueue(cell.clone(), counted("SKU-1", 3)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    b.queue_change(cell.clone(), counted("SKU-1", 5)).await.unwrap();

    a.flush().await;
    store.get(&cell).await.unwrap().unwrap()
}

#[tokio::test]
async fn last_write_wins_takes_the_last_applied_change() {
    let state = concurrent_count(MergePolicy::LastWriteWins).await;
    assert_eq!(state.actual_manifest.unwrap().quantity_of("SKU-1"), Some(3));
    assert!(!state.discrepancy);
}

#[tokio::test]
async fn field_clock_keeps_newer_edit_and_flags_discrepancy() {
    let state = concurrent_count(MergePolicy::FieldClock).await;
    assert_eq!(state.actual_manifest.unwrap().quantity_of("SKU-1"), Some(5));
    assert!(state.discrepancy);
}

// =============================================================================
// Queue Housekeeping
// =============================================================================

#[tokio::test]
async fn clear_queue_drops_everything() {
    let storage = Arc::new(MemoryQueueStorage::new());
    let engine = engine_with(
        config("scanner-1"),
        storage.clone(),
        Arc::new(MemoryInspectionStore::new()),
    )
    .await;

    engine.enqueue(addr("A01-01-01-A"), checked("a")).await.unwrap();
    engine.queue_change(addr("A01-01-02-A"), checked("b")).await.unwrap();
    assert_eq!(engine.queue_status().await.counts.total, 2);

    engine.clear_queue().await.unwrap();
    let status = engine.queue_status().await;
    assert_eq!(status.counts.total, 0);
    assert_eq!(status.device_id, "scanner-1");
    assert_eq!(storage.snapshot("change_queue").as_deref(), Some("[]"));
}
