//! Monitoring classification: how an inspected cell should be shown on the
//! supervisor's alley overview, plus per-section roll-ups and filters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::address::CellAddress;
use crate::types::{ActualStatus, InspectionState};

/// Display status of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "kebab-case")]
pub enum CellDisplayStatus {
    Unchecked,
    Discrepancy,
    ArticleError,
    Error,
    CheckedOk,
}

impl CellDisplayStatus {
    /// Classifies a cell. Earlier conditions take precedence.
    pub fn of(state: &InspectionState) -> Self {
        if !state.checked {
            CellDisplayStatus::Unchecked
        } else if state.discrepancy {
            CellDisplayStatus::Discrepancy
        } else if state
            .article_validation
            .as_ref()
            .is_some_and(|v| v.has_error())
        {
            CellDisplayStatus::ArticleError
        } else if state.actual_status == Some(ActualStatus::Problem) {
            CellDisplayStatus::Error
        } else {
            CellDisplayStatus::CheckedOk
        }
    }
}

/// Rack level band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// Tiers 2 and 3, reachable from the floor.
    Picking,
    Middle,
    /// Tiers 10 to 15.
    Upper,
}

impl TierKind {
    pub fn of(tier: u8) -> Self {
        match tier {
            2 | 3 => TierKind::Picking,
            10..=15 => TierKind::Upper,
            _ => TierKind::Middle,
        }
    }
}

/// One cell as shown on the overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellView {
    pub address: CellAddress,
    pub status: CellDisplayStatus,
    pub tier_kind: TierKind,
    pub checked: bool,
    pub checked_at: Option<DateTime<Utc>>,
    pub operator: Option<String>,
    pub discrepancy: bool,
}

impl CellView {
    pub fn new(address: &CellAddress, state: &InspectionState) -> Self {
        CellView {
            address: address.clone(),
            status: CellDisplayStatus::of(state),
            tier_kind: TierKind::of(address.tier_number()),
            checked: state.checked,
            checked_at: state.checked_at,
            operator: state.operator.clone(),
            discrepancy: state.discrepancy,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SectionStats {
    pub total: usize,
    pub checked: usize,
    pub discrepancy: usize,
    pub error: usize,
}

impl SectionStats {
    fn count(&mut self, status: CellDisplayStatus) {
        self.total += 1;
        match status {
            CellDisplayStatus::CheckedOk => self.checked += 1,
            CellDisplayStatus::Discrepancy => self.discrepancy += 1,
            CellDisplayStatus::Error | CellDisplayStatus::ArticleError => self.error += 1,
            CellDisplayStatus::Unchecked => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSummary {
    pub section: String,
    pub cells: Vec<CellView>,
    pub stats: SectionStats,
}

/// Overview of one alley, sections in ascending order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlleyTopology {
    pub alley: String,
    pub totals: SectionStats,
    pub sections: Vec<SectionSummary>,
}

impl AlleyTopology {
    /// Builds the overview of `alley` from the cells that belong to it.
    /// Cells of other alleys are ignored.
    pub fn build<'a>(
        alley: &str,
        cells: impl IntoIterator<Item = (&'a CellAddress, &'a InspectionState)>,
    ) -> Self {
        let mut by_section: BTreeMap<String, Vec<CellView>> = BTreeMap::new();
        for (address, state) in cells {
            if address.alley() != alley {
                continue;
            }
            by_section
                .entry(address.section().to_string())
                .or_default()
                .push(CellView::new(address, state));
        }

        let mut totals = SectionStats::default();
        let sections = by_section
            .into_iter()
            .map(|(section, mut cells)| {
                cells.sort_by(|a, b| a.address.cmp(&b.address));
                let mut stats = SectionStats::default();
                for cell in &cells {
                    stats.count(cell.status);
                    totals.count(cell.status);
                }
                SectionSummary {
                    section,
                    cells,
                    stats,
                }
            })
            .collect();

        AlleyTopology {
            alley: alley.to_string(),
            totals,
            sections,
        }
    }

    /// Cells matching `filter`, in section order.
    pub fn filtered<'a>(&'a self, filter: &'a MonitorFilter) -> impl Iterator<Item = &'a CellView> {
        self.sections
            .iter()
            .flat_map(|s| s.cells.iter())
            .filter(move |cell| filter.matches(cell))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    #[default]
    All,
    Unchecked,
    Checked,
    Discrepancy,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TierFilter {
    #[default]
    All,
    Picking,
    Upper,
}

/// Overview filter. The search text matches the canonical address,
/// case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MonitorFilter {
    #[serde(default)]
    pub status: StatusFilter,
    #[serde(default)]
    pub tier: TierFilter,
    #[serde(default)]
    pub search: Option<String>,
}

impl MonitorFilter {
    pub fn matches(&self, cell: &CellView) -> bool {
        let status_ok = match self.status {
            StatusFilter::All => true,
            StatusFilter::Unchecked => cell.status == CellDisplayStatus::Unchecked,
            StatusFilter::Checked => cell.checked,
            StatusFilter::Discrepancy => cell.status == CellDisplayStatus::Discrepancy,
            StatusFilter::Error => matches!(
                cell.status,
                CellDisplayStatus::Error | CellDisplayStatus::ArticleError
            ),
        };
        let tier_ok = match self.tier {
            TierFilter::All => true,
            TierFilter::Picking => cell.tier_kind == TierKind::Picking,
            TierFilter::Upper => cell.tier_kind == TierKind::Upper,
        };
        let search_ok = self.search.as_deref().map_or(true, |needle| {
            cell.address
                .to_string()
                .to_lowercase()
                .contains(&needle.trim().to_lowercase())
        });
        status_ok && tier_ok && search_ok
    }
}
