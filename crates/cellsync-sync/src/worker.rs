//! # Background Workers
//!
//! Two loops that keep the engine moving without the UI having to call
//! `flush()` itself.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SyncWorker                                                            │
//! │  ──────────                                                            │
//! │  interval tick ───┐                                                    │
//! │                   ├──► engine.flush()   (+ retention pruning on ticks) │
//! │  SyncTrigger ─────┘     coalesced: many notify() calls, one flush      │
//! │                                                                         │
//! │  StoreWatcher                                                          │
//! │  ────────────                                                          │
//! │  interval tick ──► store.revision() changed? ──► StoreChanged event    │
//! │                                               └─► SyncTrigger (opt.)   │
//! │                                                                         │
//! │  Both stop on handle.shutdown() or when every handle is dropped.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::storage::InspectionStore;

// =============================================================================
// Sync Trigger
// =============================================================================

/// Asks a running [`SyncWorker`] to flush soon.
#[derive(Debug, Clone)]
pub struct SyncTrigger {
    tx: mpsc::Sender<()>,
}

impl SyncTrigger {
    /// Requests a flush. Requests made while one is already waiting are
    /// folded into it.
    pub fn notify(&self) -> SyncResult<()> {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => Ok(()),
            Err(TrySendError::Closed(())) => {
                Err(SyncError::ChannelError("Sync worker stopped".into()))
            }
        }
    }
}

// =============================================================================
// Sync Worker
// =============================================================================

/// Flushes the engine periodically and on demand.
pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    interval: Duration,
    trigger_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for controlling the sync worker.
#[derive(Debug, Clone)]
pub struct SyncWorkerHandle {
    trigger: SyncTrigger,
    shutdown_tx: mpsc::Sender<()>,
}

impl SyncWorkerHandle {
    pub fn trigger(&self) -> SyncTrigger {
        self.trigger.clone()
    }

    /// Requests a flush.
    pub fn notify(&self) -> SyncResult<()> {
        self.trigger.notify()
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Shutdown channel closed".into()))
    }
}

impl SyncWorker {
    /// Creates a worker flushing every `config.flush_interval()`.
    pub fn new(engine: Arc<SyncEngine>) -> (Self, SyncWorkerHandle) {
        let interval = engine.config().flush_interval();
        Self::with_interval(engine, interval)
    }

    pub fn with_interval(engine: Arc<SyncEngine>, interval: Duration) -> (Self, SyncWorkerHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let worker = SyncWorker {
            engine,
            interval,
            trigger_rx,
            shutdown_rx,
        };
        let handle = SyncWorkerHandle {
            trigger: SyncTrigger { tx: trigger_tx },
            shutdown_tx,
        };

        (worker, handle)
    }

    /// Runs the worker loop. The first tick fires at once, so records left
    /// pending by a previous run are flushed on startup.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!(interval = ?self.interval, "Sync worker starting");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.engine.flush().await;
                    match self.engine.prune_synced().await {
                        Ok(0) => {}
                        Ok(pruned) => debug!(pruned, "Retention pruning"),
                        Err(e) => error!(?e, "Failed to prune synced changes"),
                    }
                }

                Some(()) = self.trigger_rx.recv() => {
                    debug!("Flush requested");
                    self.engine.flush().await;
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Sync worker shutting down");
                    break;
                }
            }
        }

        info!("Sync worker stopped");
    }
}

// =============================================================================
// Store Watcher
// =============================================================================

/// Polls the store revision and publishes [`SyncEvent::StoreChanged`].
pub struct StoreWatcher {
    store: Arc<dyn InspectionStore>,
    events: EventBus,
    interval: Duration,
    trigger: Option<SyncTrigger>,
    last_revision: Option<i64>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping the store watcher.
#[derive(Debug, Clone)]
pub struct StoreWatcherHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl StoreWatcherHandle {
    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Shutdown channel closed".into()))
    }
}

impl StoreWatcher {
    pub fn new(
        store: Arc<dyn InspectionStore>,
        events: EventBus,
        interval: Duration,
    ) -> (Self, StoreWatcherHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let watcher = StoreWatcher {
            store,
            events,
            interval,
            trigger: None,
            last_revision: None,
            shutdown_rx,
        };
        (watcher, StoreWatcherHandle { shutdown_tx })
    }

    /// Also asks a sync worker to flush whenever the store changes.
    pub fn with_trigger(mut self, trigger: SyncTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Reads the revision once. Returns it if it differs from the previous
    /// poll; the first poll only records a baseline.
    pub async fn poll(&mut self) -> Option<i64> {
        let revision = match self.store.revision().await {
            Ok(revision) => revision,
            Err(e) => {
                warn!(error = %e, "Could not read store revision");
                return None;
            }
        };

        let previous = self.last_revision.replace(revision);
        match previous {
            Some(previous) if previous != revision => {
                debug!(previous, revision, "Store changed");
                self.events.publish(SyncEvent::StoreChanged { revision });
                if let Some(trigger) = &self.trigger {
                    if let Err(e) = trigger.notify() {
                        warn!(error = %e, "Could not request flush");
                    }
                }
                Some(revision)
            }
            _ => None,
        }
    }

    /// Runs the polling loop.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!(interval = ?self.interval, "Store watcher starting");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll().await;
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Store watcher shutting down");
                    break;
                }
            }
        }

        info!("Store watcher stopped");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::events::EventKind;
    use crate::storage::{MemoryInspectionStore, MemoryQueueStorage};
    use cellsync_core::{CellAddress, DeviceType, InspectionPatch};
    use chrono::Utc;

    fn addr(s: &str) -> CellAddress {
        CellAddress::parse(s).unwrap()
    }

    async fn engine(store: Arc<MemoryInspectionStore>) -> Arc<SyncEngine> {
        Arc::new(
            SyncEngine::new(
                SyncConfig::for_device("desk-1", DeviceType::Desktop),
                Arc::new(MemoryQueueStorage::new()),
                store,
                EventBus::new(),
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_worker_flushes_on_start_and_on_trigger() {
        let store = Arc::new(MemoryInspectionStore::new());
        let engine = engine(store.clone()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.events().subscribe(EventKind::SyncComplete, move |event| {
            tx.send(event.clone()).map_err(|e| e.to_string().into())
        });

        engine
            .enqueue(addr("A01-01-01-A"), InspectionPatch::checked_by("olga", Utc::now()))
            .await
            .unwrap();

        let (worker, handle) = SyncWorker::with_interval(engine.clone(), Duration::from_secs(3600));
        let task = tokio::spawn(worker.run());

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, SyncEvent::SyncComplete { records_count: 1 });

        engine
            .enqueue(addr("A01-01-02-A"), InspectionPatch::checked_by("olga", Utc::now()))
            .await
            .unwrap();
        handle.notify().unwrap();

        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, SyncEvent::SyncComplete { records_count: 1 });
        assert_eq!(store.cells().await.len(), 2);

        handle.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.notify().is_err());
    }

    #[tokio::test]
    async fn test_watcher_reports_revision_changes() {
        let store = Arc::new(MemoryInspectionStore::new());
        let engine = engine(store.clone()).await;
        // Not running: the trigger only needs a live receiver.
        let (_worker, trigger_handle) =
            SyncWorker::with_interval(engine.clone(), Duration::from_secs(3600));

        let (mut watcher, _handle) =
            StoreWatcher::new(store.clone(), engine.events().clone(), Duration::from_millis(10));
        watcher = watcher.with_trigger(trigger_handle.trigger());

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.events().subscribe(EventKind::StoreChanged, move |event| {
            tx.send(event.clone()).map_err(|e| e.to_string().into())
        });

        // Baseline only.
        assert_eq!(watcher.poll().await, None);

        engine
            .queue_change(addr("A01-01-01-A"), InspectionPatch::checked_by("olga", Utc::now()))
            .await
            .unwrap();

        assert_eq!(watcher.poll().await, Some(1));
        assert_eq!(watcher.poll().await, None);
        assert_eq!(rx.try_recv().unwrap(), SyncEvent::StoreChanged { revision: 1 });
    }
}
