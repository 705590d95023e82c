//! # Event Bus
//!
//! Typed, in-process publish/subscribe between the engine and its consumers.
//!
//! ## Delivery
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  engine.flush()                                                        │
//! │     │                                                                   │
//! │     └──► bus.publish(SyncEvent::SyncComplete { records_count: 3 })     │
//! │              │                                                          │
//! │              ├──► handler #1   Ok(())                                  │
//! │              ├──► handler #2   Err(HandlerError)  ──► logged           │
//! │              ├──► handler #3   panics             ──► caught, logged   │
//! │              └──► handler #4   Ok(())             still delivered      │
//! │                                                                         │
//! │  publish() itself never fails.                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Handlers run synchronously on the publishing task, outside the bus lock,
//! so a handler may subscribe or unsubscribe while being called. They should
//! return quickly; a handler that needs to do async work forwards the event
//! into a channel.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tracing::{debug, error, warn};

use cellsync_core::Anomaly;

use crate::devices::DeviceInfo;
use crate::queue::ChangeRecord;

// =============================================================================
// Events
// =============================================================================

/// Kind of event a handler subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    SyncComplete,
    SyncError,
    RemoteUpdate,
    AnomalyDetected,
    DeviceRegistered,
    StoreChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SyncComplete => "sync-complete",
            EventKind::SyncError => "sync-error",
            EventKind::RemoteUpdate => "remote-update",
            EventKind::AnomalyDetected => "anomaly-detected",
            EventKind::DeviceRegistered => "device-registered",
            EventKind::StoreChanged => "store-changed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event published by the engine and its helpers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SyncEvent {
    /// A flush went through every due record.
    SyncComplete { records_count: usize },

    /// A flush was aborted.
    SyncError { error: String },

    /// Records that were just applied to the shared store.
    RemoteUpdate { records: Vec<ChangeRecord> },

    /// Ingestion found a cell that needs a physical check.
    AnomalyDetected(Anomaly),

    /// A device announced itself.
    DeviceRegistered(DeviceInfo),

    /// The shared store was written by someone.
    StoreChanged { revision: i64 },
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::SyncComplete { .. } => EventKind::SyncComplete,
            SyncEvent::SyncError { .. } => EventKind::SyncError,
            SyncEvent::RemoteUpdate { .. } => EventKind::RemoteUpdate,
            SyncEvent::AnomalyDetected(_) => EventKind::AnomalyDetected,
            SyncEvent::DeviceRegistered(_) => EventKind::DeviceRegistered,
            SyncEvent::StoreChanged { .. } => EventKind::StoreChanged,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Failure reported by an event handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError(message.to_string())
    }
}

type Handler = Arc<dyn Fn(&SyncEvent) -> Result<(), HandlerError> + Send + Sync>;

struct Registration {
    id: u64,
    kind: EventKind,
    handler: Handler,
}

/// Result of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

// =============================================================================
// Event Bus
// =============================================================================

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    handlers: Mutex<Vec<Registration>>,
}

impl BusInner {
    fn handlers(&self) -> MutexGuard<'_, Vec<Registration>> {
        // Handlers never run under this lock, so poisoning cannot leave the
        // list half-updated.
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: u64) -> bool {
        let mut handlers = self.handlers();
        let before = handlers.len();
        handlers.retain(|r| r.id != id);
        handlers.len() != before
    }
}

/// Cheaply cloneable handle to a shared set of subscriptions.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.inner.handlers().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers().push(Registration {
            id,
            kind,
            handler: Arc::new(handler),
        });
        debug!(kind = %kind, id, "Handler subscribed");

        Subscription {
            id,
            kind,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `event` to every handler subscribed to its kind, in
    /// subscription order.
    pub fn publish(&self, event: SyncEvent) -> Delivery {
        let kind = event.kind();
        let handlers: Vec<(u64, Handler)> = self
            .inner
            .handlers()
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| (r.id, r.handler.clone()))
            .collect();

        let mut delivery = Delivery::default();
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivery.delivered += 1,
                Ok(Err(e)) => {
                    warn!(kind = %kind, handler = id, error = %e, "Event handler failed");
                    delivery.failed += 1;
                }
                Err(payload) => {
                    error!(
                        kind = %kind,
                        handler = id,
                        panic = %panic_message(payload.as_ref()),
                        "Event handler panicked"
                    );
                    delivery.failed += 1;
                }
            }
        }
        delivery
    }

    /// Number of handlers currently subscribed to `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner.handlers().iter().filter(|r| r.kind == kind).count()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    kind: EventKind,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Removes the handler. Returns `false` if the bus is gone.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(self.id),
            None => false,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
