//! # Inspection Merge
//!
//! Applies an [`InspectionPatch`] onto an [`InspectionState`].
//!
//! ## Policies
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  LastWriteWins   every present field overwrites the stored value        │
//! │                  (apply order decides, no timestamps compared)          │
//! │                                                                         │
//! │  FieldClock      each field remembers the stamp of its last writer;     │
//! │                  a write with an older stamp is dropped and, when its   │
//! │                  value disagrees with the stored one, the cell is       │
//! │                  flagged with `discrepancy = true`                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stamps order by time first and device id second, so two devices writing
//! in the same instant still resolve the same way everywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;
use crate::types::{InspectionPatch, InspectionState};

/// Conflict-resolution strategy used when applying changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    #[default]
    LastWriteWins,
    FieldClock,
}

impl std::str::FromStr for MergePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "last_write_wins" | "lww" => Ok(MergePolicy::LastWriteWins),
            "field_clock" => Ok(MergePolicy::FieldClock),
            other => Err(CoreError::Invalid {
                field: "merge_policy".to_string(),
                reason: format!("unknown merge policy '{other}'"),
            }),
        }
    }
}

/// Logical timestamp of one field write.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldStamp {
    pub at: DateTime<Utc>,
    pub device_id: String,
}

impl FieldStamp {
    pub fn new(at: DateTime<Utc>, device_id: impl Into<String>) -> Self {
        FieldStamp {
            at,
            device_id: device_id.into(),
        }
    }
}

/// What happened to each field of a patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Fields written.
    pub applied: Vec<&'static str>,
    /// Fields dropped as stale whose value disagreed with the stored one.
    pub conflicts: Vec<&'static str>,
}

impl MergeOutcome {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

struct Merger<'a> {
    clocks: &'a mut std::collections::BTreeMap<String, FieldStamp>,
    stamp: &'a FieldStamp,
    policy: MergePolicy,
    outcome: MergeOutcome,
}

impl Merger<'_> {
    fn field<T: PartialEq>(&mut self, name: &'static str, slot: &mut T, incoming: Option<T>) {
        let Some(value) = incoming else {
            return;
        };

        if self.policy == MergePolicy::FieldClock {
            if let Some(existing) = self.clocks.get(name) {
                if self.stamp <= existing {
                    if self.stamp != existing && *slot != value {
                        self.outcome.conflicts.push(name);
                    }
                    return;
                }
            }
        }

        *slot = value;
        self.clocks.insert(name.to_string(), self.stamp.clone());
        self.outcome.applied.push(name);
    }
}

impl InspectionState {
    /// Applies the present fields of `patch` written by `stamp`.
    ///
    /// The article validation is recomputed afterwards.
    pub fn apply_patch(
        &mut self,
        patch: &InspectionPatch,
        stamp: &FieldStamp,
        policy: MergePolicy,
    ) -> MergeOutcome {
        let mut merger = Merger {
            clocks: &mut self.field_clocks,
            stamp,
            policy,
            outcome: MergeOutcome::default(),
        };

        merger.field("system_status", &mut self.system_status, patch.system_status);
        merger.field("actual_status", &mut self.actual_status, patch.actual_status.map(Some));
        merger.field(
            "actual_manifest",
            &mut self.actual_manifest,
            patch.actual_manifest.clone().map(Some),
        );
        merger.field("checked", &mut self.checked, patch.checked);
        merger.field("checked_at", &mut self.checked_at, patch.checked_at.map(Some));
        merger.field("operator", &mut self.operator, patch.operator.clone().map(Some));
        merger.field("discrepancy", &mut self.discrepancy, patch.discrepancy);

        let outcome = merger.outcome;
        if outcome.has_conflicts() {
            self.discrepancy = true;
        }
        self.revalidate();
        outcome
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
