//! # Domain Types
//!
//! Core domain types used throughout cellsync.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────────┐   │
//! │  │   CellRecord    │   │ ArticleManifest │   │  InspectionState    │   │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────────  │   │
//! │  │  address        │──▶│  sku → quantity │◀──│  actual_manifest    │   │
//! │  │  system_status  │   │  declared_count │   │  checked / operator │   │
//! │  │  expected       │   └─────────────────┘   │  discrepancy        │   │
//! │  │  source_row     │                         │  field_clocks       │   │
//! │  └─────────────────┘                         └─────────────────────┘   │
//! │        ▲ produced by ingestion                   ▲ owned by the store  │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────────┐   │
//! │  │   CellStatus    │   │  ActualStatus   │   │   InspectionPatch   │   │
//! │  │  Empty          │   │  Empty          │   │  every field        │   │
//! │  │  Occupied       │   │  Occupied       │   │  optional           │   │
//! │  │  Unknown        │   │  Problem        │   │  (change payload)   │   │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::address::CellAddress;
use crate::ingest::RawRow;
use crate::merge::FieldStamp;
use crate::validation::{compare, ValidationResult};

// =============================================================================
// Cell Status
// =============================================================================

/// Occupancy status a cell has according to the warehouse system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    /// No stock expected.
    #[default]
    Empty,
    /// Stock expected.
    Occupied,
    /// Status text was not recognized.
    Unknown,
}

impl std::fmt::Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellStatus::Empty => write!(f, "empty"),
            CellStatus::Occupied => write!(f, "occupied"),
            CellStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Status an operator observed on the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ActualStatus {
    Empty,
    Occupied,
    /// Damaged pallet, blocked location, etc.
    Problem,
}

// =============================================================================
// Articles
// =============================================================================

/// One SKU with its quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Article {
    /// Stock Keeping Unit.
    pub sku: String,
    /// Number of units (never negative).
    pub quantity: u32,
}

impl Article {
    pub fn new(sku: impl Into<String>, quantity: u32) -> Self {
        Article {
            sku: sku.into(),
            quantity,
        }
    }
}

/// The set of articles attributed to one cell.
///
/// SKUs are unique: inserting a SKU that is already present adds to its
/// quantity. A manifest may also be *count-only* (a declared number of items
/// without SKUs), which is what a quick floor count produces.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ArticleManifest {
    /// SKU → quantity.
    #[serde(default)]
    articles: BTreeMap<String, u32>,

    /// Item count declared without SKUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    declared_count: Option<u32>,
}

impl ArticleManifest {
    /// Creates an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manifest carrying only an item count.
    pub fn count_only(count: u32) -> Self {
        ArticleManifest {
            articles: BTreeMap::new(),
            declared_count: Some(count),
        }
    }

    /// Builds a manifest from articles, merging duplicate SKUs.
    pub fn from_articles(articles: impl IntoIterator<Item = Article>) -> Self {
        let mut manifest = Self::new();
        for article in articles {
            manifest.insert(article.sku, article.quantity);
        }
        manifest
    }

    /// Adds `quantity` units of `sku`.
    pub fn insert(&mut self, sku: impl Into<String>, quantity: u32) {
        let entry = self.articles.entry(sku.into()).or_insert(0);
        *entry = entry.saturating_add(quantity);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, sku: impl Into<String>, quantity: u32) -> Self {
        self.insert(sku, quantity);
        self
    }

    /// Articles in SKU order.
    pub fn articles(&self) -> Vec<Article> {
        self.articles
            .iter()
            .map(|(sku, qty)| Article::new(sku.clone(), *qty))
            .collect()
    }

    /// Quantity recorded for `sku`.
    pub fn quantity_of(&self, sku: &str) -> Option<u32> {
        self.articles.get(sku).copied()
    }

    /// Distinct SKUs.
    pub fn skus(&self) -> BTreeSet<&str> {
        self.articles.keys().map(String::as_str).collect()
    }

    /// Number of distinct SKUs.
    pub fn sku_count(&self) -> usize {
        self.articles.len()
    }

    /// True when at least one SKU is listed.
    pub fn has_skus(&self) -> bool {
        !self.articles.is_empty()
    }

    /// Total item count: the declared count if any, else the quantity sum.
    pub fn count(&self) -> u32 {
        self.declared_count.unwrap_or_else(|| {
            self.articles
                .values()
                .fold(0u32, |acc, q| acc.saturating_add(*q))
        })
    }

    /// True when the manifest holds no items.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

// =============================================================================
// Cell Record
// =============================================================================

/// Where a [`CellRecord`] came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    /// 1-based row number in the ingested sequence.
    pub row: usize,
    /// The row exactly as received.
    pub raw: RawRow,
}

/// Canonical unit produced by ingestion from one spreadsheet row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub address: CellAddress,
    pub system_status: CellStatus,
    pub expected_manifest: ArticleManifest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source_row: SourceRow,
}

impl CellRecord {
    /// True when more than one distinct SKU is expected in the cell.
    pub fn has_multiple_skus(&self) -> bool {
        self.expected_manifest.sku_count() > 1
    }
}

// =============================================================================
// Device Type
// =============================================================================

/// Kind of client device producing changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Mobile,
    Desktop,
    #[default]
    Web,
}

impl DeviceType {
    /// Classifies a browser user-agent string.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_lowercase();
        if ["mobile", "android", "iphone", "ipad", "phone"]
            .iter()
            .any(|needle| ua.contains(needle))
        {
            DeviceType::Mobile
        } else {
            DeviceType::Desktop
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Mobile => write!(f, "mobile"),
            DeviceType::Desktop => write!(f, "desktop"),
            DeviceType::Web => write!(f, "web"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mobile" => Ok(DeviceType::Mobile),
            "desktop" => Ok(DeviceType::Desktop),
            "web" => Ok(DeviceType::Web),
            other => Err(crate::error::CoreError::Invalid {
                field: "device_type".to_string(),
                reason: format!("unknown device type '{other}'"),
            }),
        }
    }
}

// =============================================================================
// Inspection State
// =============================================================================

/// Per-cell inspection state held by the shared store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InspectionState {
    #[serde(default)]
    pub system_status: CellStatus,
    #[serde(default)]
    pub expected_manifest: ArticleManifest,
    #[serde(default)]
    pub actual_status: Option<ActualStatus>,
    #[serde(default)]
    pub actual_manifest: Option<ArticleManifest>,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub discrepancy: bool,
    /// Result of comparing expected and actual manifests after the last change.
    #[serde(default)]
    pub article_validation: Option<ValidationResult>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synced_by: Option<String>,
    /// Last writer per field, used by [`crate::MergePolicy::FieldClock`].
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_clocks: BTreeMap<String, FieldStamp>,
}

impl InspectionState {
    /// Seeds a state from an imported record.
    pub fn from_record(record: &CellRecord) -> Self {
        InspectionState {
            system_status: record.system_status,
            expected_manifest: record.expected_manifest.clone(),
            ..Default::default()
        }
    }

    /// Recomputes [`article_validation`](Self::article_validation).
    ///
    /// Nothing is recorded until the cell has been checked.
    pub fn revalidate(&mut self) {
        self.article_validation = if self.checked {
            Some(compare(&self.expected_manifest, self.actual_manifest.as_ref()))
        } else {
            None
        };
    }
}

/// Partial [`InspectionState`]: the payload of a queued change.
///
/// Only fields that are `Some` are applied.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InspectionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub system_status: Option<CellStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub actual_status: Option<ActualStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub actual_manifest: Option<ArticleManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub checked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(as = "Option<String>", optional)]
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub discrepancy: Option<bool>,
}

impl InspectionPatch {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == InspectionPatch::default()
    }

    /// Patch recording a completed check by `operator`.
    pub fn checked_by(operator: impl Into<String>, at: DateTime<Utc>) -> Self {
        InspectionPatch {
            checked: Some(true),
            checked_at: Some(at),
            operator: Some(operator.into()),
            ..Default::default()
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
