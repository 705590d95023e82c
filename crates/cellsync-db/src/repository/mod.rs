//! # Repository Module
//!
//! Database repository implementations for cellsync.
//!
//! ## Repositories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  db.kv_slots()                        db.inspections()                 │
//! │  ├── load(key)                        ├── get(address)                 │
//! │  ├── save(key, value)                 ├── upsert(address, state)       │
//! │  └── delete(key)                      ├── list / list_alley            │
//! │       │                               ├── import(records)              │
//! │       │                               └── revision()                   │
//! │       ▼                                    │                            │
//! │  kv_slots table                       cell_inspections table           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`KvSlotRepository`](kv::KvSlotRepository) - Opaque durable slots
//! - [`InspectionRepository`](inspection::InspectionRepository) - Per-cell inspection state

pub mod inspection;
pub mod kv;
