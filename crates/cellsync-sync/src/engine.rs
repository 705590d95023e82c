//! # Sync Engine
//!
//! Drains the change queue into the shared inspection store and tells
//! subscribers what happened.
//!
//! ## Flush Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncEngine::flush()                             │
//! │                                                                         │
//! │  IDLE ──► already flushing? ──yes──► Skipped(InFlight)                 │
//! │              │ no                                                       │
//! │              ▼                                                          │
//! │  FLUSHING   snapshot due records ──empty──► Skipped(NothingDue)        │
//! │              │                                                          │
//! │              ▼  for each record, in queue order                         │
//! │           store.apply(record)                                          │
//! │              ├── Ok            ──► mark_synced(synced_at, synced_by)   │
//! │              ├── Rejected      ──► mark_failed (retry or terminal)     │
//! │              └── Unavailable   ──► stop: RemoteUpdate(applied so far), │
//! │                                        SyncError, Aborted              │
//! │              │                                                          │
//! │              ▼                                                          │
//! │           persist queue ──► RemoteUpdate(applied) ──► SyncComplete     │
//! │              │                                                          │
//! │  IDLE  ◄─────┘  (flight guard released on drop, even on early return)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The queue lock is taken only around queue operations. Store calls run
//! without it, so `enqueue` from the UI never waits for the store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use cellsync_core::{
    CellAddress, CellRecord, DeviceType, IngestionReport, InspectionPatch, RawRow,
    SpreadsheetNormalizer,
};
use cellsync_db::Database;

use crate::config::SyncConfig;
use crate::devices::{DeviceInfo, DeviceRegistry};
use crate::error::{StoreError, SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::queue::{ChangeQueue, ChangeRecord, ChangeStatus, QueueCounts, QueueIdentity};
use crate::retry::RetryPolicy;
use crate::storage::{InspectionStore, QueueStorage, SqliteInspectionStore, SqliteQueueStorage};

// =============================================================================
// Flush Outcome
// =============================================================================

/// Why a flush did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another flush is running.
    InFlight,
    /// No pending record is due.
    NothingDue,
}

/// Per-record results of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Applied to the store and marked synced.
    pub applied: usize,
    /// Rejected, still pending.
    pub retried: usize,
    /// Rejected for the last time.
    pub failed: usize,
    /// Not attempted because an earlier change of the same cell was
    /// rejected in this flush.
    pub held_back: usize,
}

impl FlushReport {
    /// Records the store was asked to apply.
    pub fn processed(&self) -> usize {
        self.applied + self.retried + self.failed
    }
}

/// What a call to [`SyncEngine::flush`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Skipped(SkipReason),
    Completed(FlushReport),
    /// The store became unavailable or the queue could not be persisted.
    /// Records applied before that stay synced.
    Aborted { report: FlushReport, error: String },
}

impl FlushOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, FlushOutcome::Skipped(_))
    }

    pub fn report(&self) -> Option<&FlushReport> {
        match self {
            FlushOutcome::Skipped(_) => None,
            FlushOutcome::Completed(report) | FlushOutcome::Aborted { report, .. } => Some(report),
        }
    }
}

/// Snapshot of the queue for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    #[serde(flatten)]
    pub counts: QueueCounts,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub is_flushing: bool,
    pub device_id: String,
    pub device_type: DeviceType,
}

/// Holds the single-flight flag for as long as it lives.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Change queue, store and event bus of one device.
///
/// ## Usage
/// ```rust,ignore
/// let engine = Arc::new(
///     SyncEngine::new(config, queue_storage, store, EventBus::new()).await?,
/// );
/// engine.events().subscribe(EventKind::RemoteUpdate, |event| { ...; Ok(()) });
///
/// let id = engine
///     .queue_change(address, InspectionPatch::checked_by("olga", Utc::now()))
///     .await?;
/// ```
pub struct SyncEngine {
    config: SyncConfig,
    queue: Mutex<ChangeQueue>,
    store: Arc<dyn InspectionStore>,
    events: EventBus,
    normalizer: SpreadsheetNormalizer,
    retry: RetryPolicy,
    devices: DeviceRegistry,
    flushing: AtomicBool,
    last_sync_at: RwLock<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("device_id", &self.config.device_id())
            .field("flushing", &self.is_flushing())
            .finish()
    }
}

impl SyncEngine {
    /// Builds the engine and restores the persisted queue.
    ///
    /// The engine's own device is registered right away.
    pub async fn new(
        config: SyncConfig,
        queue_storage: Arc<dyn QueueStorage>,
        store: Arc<dyn InspectionStore>,
        events: EventBus,
    ) -> SyncResult<Self> {
        config.validate()?;

        let retry = config.retry_policy();
        let identity = QueueIdentity {
            device_id: config.device_id().to_string(),
            device_type: config.device_type(),
            max_retries: retry.max_retries,
        };
        let queue = ChangeQueue::load(queue_storage, config.storage.queue_key.clone(), identity)
            .await?;

        let engine = SyncEngine {
            config,
            queue: Mutex::new(queue),
            store,
            events,
            normalizer: SpreadsheetNormalizer::default(),
            retry,
            devices: DeviceRegistry::new(),
            flushing: AtomicBool::new(false),
            last_sync_at: RwLock::new(None),
        };

        engine.register_device(
            DeviceInfo::new(engine.config.device_id(), engine.config.device_type())
                .with_name(engine.config.device.name.clone()),
        );

        info!(
            device_id = %engine.config.device_id(),
            device_type = %engine.config.device_type(),
            policy = ?engine.config.merge_policy(),
            "Sync engine ready"
        );
        Ok(engine)
    }

    /// Engine whose queue slot and store both live in `db`.
    pub async fn with_database(
        config: SyncConfig,
        db: &Database,
        events: EventBus,
    ) -> SyncResult<Self> {
        Self::new(
            config,
            Arc::new(SqliteQueueStorage::new(db)),
            Arc::new(SqliteInspectionStore::new(db)),
            events,
        )
        .await
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> Arc<dyn InspectionStore> {
        self.store.clone()
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_at.read().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Queue Operations
    // =========================================================================

    /// Appends a change to the queue without flushing.
    pub async fn enqueue(
        &self,
        address: CellAddress,
        payload: InspectionPatch,
    ) -> SyncResult<String> {
        if payload.is_empty() {
            warn!(address = %address, "Queuing change without fields");
        }
        self.queue.lock().await.enqueue(address, payload).await
    }

    /// Appends a change and flushes right away.
    ///
    /// Returns once the change is durably queued and the flush attempt is
    /// over. If another flush is running the change waits for the next one.
    pub async fn queue_change(
        &self,
        address: CellAddress,
        payload: InspectionPatch,
    ) -> SyncResult<String> {
        let id = self.enqueue(address, payload).await?;
        let outcome = self.flush().await;
        debug!(id = %id, ?outcome, "Flush after enqueue");
        Ok(id)
    }

    /// Copies of the pending records, in queue order.
    pub async fn pending_records(&self) -> Vec<ChangeRecord> {
        self.queue
            .lock()
            .await
            .pending_records()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Copy of one record.
    pub async fn record(&self, id: &str) -> Option<ChangeRecord> {
        self.queue.lock().await.get(id).cloned()
    }

    pub async fn queue_status(&self) -> QueueStatus {
        let counts = self.queue.lock().await.status();
        QueueStatus {
            counts,
            last_sync_at: self.last_sync_at(),
            is_flushing: self.is_flushing(),
            device_id: self.config.device_id().to_string(),
            device_type: self.config.device_type(),
        }
    }

    /// Drops every queued record, pending ones included.
    pub async fn clear_queue(&self) -> SyncResult<()> {
        self.queue.lock().await.clear().await
    }

    /// Drops synced records older than the configured retention.
    pub async fn prune_synced(&self) -> SyncResult<usize> {
        match self.config.retention() {
            Some(retention) => {
                let cutoff = Utc::now() - retention;
                self.queue.lock().await.prune_synced(cutoff).await
            }
            None => Ok(0),
        }
    }

    /// Gives a terminally failed record a fresh retry budget.
    pub async fn retry_failed(&self, id: &str) -> SyncResult<bool> {
        self.queue.lock().await.retry_failed(id).await
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Applies every due pending record to the store.
    ///
    /// Only one flush runs at a time; a call made while one is running
    /// returns [`FlushOutcome::Skipped`] immediately.
    pub async fn flush(&self) -> FlushOutcome {
        let Some(_guard) = FlightGuard::acquire(&self.flushing) else {
            debug!("Flush already in progress, skipping");
            return FlushOutcome::Skipped(SkipReason::InFlight);
        };

        let due = self.queue.lock().await.due_records(Utc::now());
        if due.is_empty() {
            return FlushOutcome::Skipped(SkipReason::NothingDue);
        }

        info!(count = due.len(), "Flushing change queue");

        let policy = self.config.merge_policy();
        let device_id = self.config.device_id();
        let mut report = FlushReport::default();
        let mut applied: Vec<ChangeRecord> = Vec::new();
        let mut rejected_cells: BTreeSet<CellAddress> = BTreeSet::new();

        for mut record in due {
            if rejected_cells.contains(&record.cell_address) {
                report.held_back += 1;
                continue;
            }

            match self.store.apply(&record, policy).await {
                Ok(_) => {
                    let synced_at = Utc::now();
                    let marked = self
                        .queue
                        .lock()
                        .await
                        .mark_synced(&record.id, device_id, synced_at)
                        .await;

                    debug!(id = %record.id, address = %record.cell_address, "Change applied");
                    report.applied += 1;

                    match marked {
                        Ok(_) => {}
                        Err(SyncError::RecordNotFound { id }) => {
                            debug!(id = %id, "Record left the queue during flush");
                        }
                        Err(e) => {
                            // The store already holds the change; the queue
                            // keeps it pending and re-applies it later.
                            applied.push(record);
                            return self.abort(applied, report, e.to_string());
                        }
                    }

                    record.status = ChangeStatus::Synced;
                    record.synced_at = Some(synced_at);
                    record.synced_by = Some(device_id.to_string());
                    applied.push(record);
                }

                Err(StoreError::Rejected(reason)) => {
                    warn!(
                        id = %record.id,
                        address = %record.cell_address,
                        reason = %reason,
                        "Store rejected change"
                    );
                    rejected_cells.insert(record.cell_address.clone());

                    let next_attempt = self
                        .retry
                        .next_attempt_at(record.retry_count + 1, Utc::now());
                    let marked = self
                        .queue
                        .lock()
                        .await
                        .mark_failed(&record.id, &reason, next_attempt)
                        .await;

                    match marked {
                        Ok(ChangeStatus::Failed) => report.failed += 1,
                        Ok(_) => report.retried += 1,
                        Err(SyncError::RecordNotFound { .. }) => {}
                        Err(e) => return self.abort(applied, report, e.to_string()),
                    }
                }

                Err(StoreError::Unavailable(reason)) => {
                    return self.abort(applied, report, reason);
                }
            }
        }

        if let Err(e) = self.queue.lock().await.persist().await {
            return self.abort(applied, report, e.to_string());
        }

        let finished_at = Utc::now();
        *self.last_sync_at.write().unwrap_or_else(|e| e.into_inner()) = Some(finished_at);
        self.devices.touch(device_id, finished_at);

        self.publish_applied(applied);
        self.events.publish(SyncEvent::SyncComplete {
            records_count: report.processed(),
        });

        info!(
            applied = report.applied,
            retried = report.retried,
            failed = report.failed,
            held_back = report.held_back,
            "Flush complete"
        );
        FlushOutcome::Completed(report)
    }

    fn abort(&self, applied: Vec<ChangeRecord>, report: FlushReport, error: String) -> FlushOutcome {
        error!(error = %error, applied = report.applied, "Flush aborted");
        self.publish_applied(applied);
        self.events.publish(SyncEvent::SyncError {
            error: error.clone(),
        });
        FlushOutcome::Aborted { report, error }
    }

    fn publish_applied(&self, records: Vec<ChangeRecord>) {
        if !records.is_empty() {
            self.events.publish(SyncEvent::RemoteUpdate { records });
        }
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Normalizes spreadsheet rows and announces every anomaly.
    pub fn ingest(&self, rows: &[RawRow]) -> IngestionReport {
        let report = self.normalizer.normalize(rows);
        self.announce(&report);
        report
    }

    /// Like [`ingest`](Self::ingest) for a JSON array of row objects.
    pub fn ingest_json(&self, value: &serde_json::Value) -> SyncResult<IngestionReport> {
        let report = self.normalizer.normalize_json(value)?;
        self.announce(&report);
        Ok(report)
    }

    fn announce(&self, report: &IngestionReport) {
        let summary = &report.summary;
        info!(
            rows = summary.total_rows,
            records = summary.records_created,
            errors = summary.errors,
            warnings = summary.warnings,
            anomalies = report.anomalies.len(),
            "Spreadsheet ingested"
        );

        for anomaly in &report.anomalies {
            self.events
                .publish(SyncEvent::AnomalyDetected(anomaly.clone()));
        }
    }

    /// Writes ingested records into the shared store.
    pub async fn import_records(&self, records: &[CellRecord]) -> SyncResult<usize> {
        let imported = self.store.import(records).await?;
        info!(count = imported, "Records imported into store");
        Ok(imported)
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Adds or refreshes a device and publishes `DeviceRegistered`.
    pub fn register_device(&self, info: DeviceInfo) -> DeviceInfo {
        let stored = self.devices.register(info);
        debug!(device_id = %stored.device_id, device_type = %stored.device_type, "Device registered");
        self.events
            .publish(SyncEvent::DeviceRegistered(stored.clone()));
        stored
    }

    pub fn connected_devices(&self) -> Vec<DeviceInfo> {
        self.devices.list()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
