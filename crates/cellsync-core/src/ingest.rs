//! # Spreadsheet Ingestion
//!
//! Turns loosely structured spreadsheet rows into canonical [`CellRecord`]s.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Row Normalization                                │
//! │                                                                         │
//! │   RawRow ──▶ resolve columns ──▶ parse address ──▶ normalize status     │
//! │                (aliases)            │                     │              │
//! │                                     ▼                     ▼              │
//! │                                 RowError            IngestionWarning    │
//! │                                                                         │
//! │          ──▶ parse article lists ──▶ CellRecord ──▶ IngestionReport     │
//! │                      │                                                  │
//! │                      ▼                                                  │
//! │            Anomaly (> 1 SKU in one cell)                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Row-level problems are collected and never abort the batch. Errors,
//! warnings and anomalies are kept in separate typed vectors.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::address::CellAddress;
use crate::error::IngestionError;
use crate::types::{ArticleManifest, CellRecord, CellStatus, SourceRow};
use crate::validation::validate_sku;

/// Separators accepted inside SKU and quantity lists.
const LIST_SEPARATORS: [char; 3] = [';', '|', ','];

const OCCUPIED_WORDS: [&str; 3] = ["occu", "заня", "заполн"];
const OCCUPIED_FLAGS: [&str; 2] = ["1", "true"];
const EMPTY_WORDS: [&str; 3] = ["empt", "пуст", "свобод"];
const EMPTY_FLAGS: [&str; 2] = ["0", "false"];

// =============================================================================
// Raw Input
// =============================================================================

/// One spreadsheet value as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Blank,
}

impl RawValue {
    /// Trimmed text form, `None` when the value is blank.
    pub fn as_text(&self) -> Option<String> {
        let text = match self {
            RawValue::Blank => return None,
            RawValue::Bool(b) => b.to_string(),
            RawValue::Number(n) if n.fract() == 0.0 && n.is_finite() => format!("{}", *n as i64),
            RawValue::Number(n) => n.to_string(),
            RawValue::Text(s) => s.trim().to_string(),
        };
        (!text.is_empty()).then_some(text)
    }
}

impl From<&serde_json::Value> for RawValue {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RawValue::Blank,
            serde_json::Value::Bool(b) => RawValue::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(RawValue::Number)
                .unwrap_or_else(|| RawValue::Text(n.to_string())),
            serde_json::Value::String(s) => RawValue::Text(s.clone()),
            nested => RawValue::Text(nested.to_string()),
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

/// Column name → value.
pub type RawRow = BTreeMap<String, RawValue>;

// =============================================================================
// Column Aliases
// =============================================================================

/// Header aliases per logical field, tried in order.
#[derive(Debug, Clone)]
pub struct ColumnAliases {
    pub cell_name: Vec<String>,
    pub status: Vec<String>,
    pub quantity: Vec<String>,
    pub sku: Vec<String>,
    pub description: Vec<String>,
}

impl Default for ColumnAliases {
    fn default() -> Self {
        let owned = |names: &[&str]| -> Vec<String> { names.iter().map(|s| s.to_string()).collect() };
        ColumnAliases {
            cell_name: owned(&["Название Ячейки", "Cell Name", "Ячейка", "Адрес", "Address", "A"]),
            status: owned(&["Статус", "Status", "Статус ячейки", "B"]),
            quantity: owned(&["Кол-во", "Quantity", "Кол-во артикулов", "Qty", "C"]),
            sku: owned(&["Артикул", "SKU", "Артикулы", "Articles", "D"]),
            description: owned(&["Описание", "Description", "Комментарий", "Comment", "E"]),
        }
    }
}

fn first_present(row: &RawRow, aliases: &[String]) -> Option<String> {
    aliases
        .iter()
        .filter_map(|alias| row.get(alias))
        .find_map(RawValue::as_text)
}

// =============================================================================
// Report Types
// =============================================================================

/// A row whose cell name could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    /// 1-based row number.
    pub row: usize,
    /// Offending cell-name text.
    pub text: String,
    pub message: String,
}

/// Non-fatal data inconsistency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestionWarning {
    /// Status text matched no known token; stored as empty.
    UnknownStatus {
        row: usize,
        address: CellAddress,
        status: String,
    },
    /// A quantity was given but no SKU.
    QuantityWithoutSkus {
        row: usize,
        address: CellAddress,
        quantity: String,
    },
    /// The address already appeared earlier; the later row wins.
    DuplicateAddress {
        row: usize,
        address: CellAddress,
        previous_row: usize,
    },
    /// A SKU token looks malformed.
    SuspiciousSku {
        row: usize,
        address: CellAddress,
        sku: String,
        reason: String,
    },
}

impl IngestionWarning {
    pub fn row(&self) -> usize {
        match self {
            IngestionWarning::UnknownStatus { row, .. }
            | IngestionWarning::QuantityWithoutSkus { row, .. }
            | IngestionWarning::DuplicateAddress { row, .. }
            | IngestionWarning::SuspiciousSku { row, .. } => *row,
        }
    }

    pub fn message(&self) -> String {
        match self {
            IngestionWarning::UnknownStatus { address, status, .. } => {
                format!("{address}: unclear status \"{status}\", stored as empty")
            }
            IngestionWarning::QuantityWithoutSkus {
                address, quantity, ..
            } => format!("{address}: quantity \"{quantity}\" given without any SKU"),
            IngestionWarning::DuplicateAddress {
                address,
                previous_row,
                ..
            } => format!("{address}: duplicate of row {previous_row}, later row kept"),
            IngestionWarning::SuspiciousSku {
                address, sku, reason, ..
            } => format!("{address}: suspicious SKU \"{sku}\": {reason}"),
        }
    }
}

/// More than one distinct SKU in a single cell. Needs a physical check but
/// does not block import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub row: usize,
    pub address: CellAddress,
    pub skus: Vec<String>,
    /// Number of distinct SKUs.
    pub count: usize,
    pub message: String,
}

/// Aggregate counters for one ingestion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IngestionSummary {
    pub total_rows: usize,
    pub records_created: usize,
    pub rows_without_anomalies: usize,
    pub rows_with_multi_sku: usize,
    pub occupied: usize,
    pub empty: usize,
    pub errors: usize,
    pub warnings: usize,
}

/// Everything produced by one ingestion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionReport {
    pub records: BTreeMap<CellAddress, CellRecord>,
    pub errors: Vec<RowError>,
    pub warnings: Vec<IngestionWarning>,
    pub anomalies: Vec<Anomaly>,
    pub summary: IngestionSummary,
    pub generated_at: DateTime<Utc>,
}

impl IngestionReport {
    fn empty() -> Self {
        IngestionReport {
            records: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            anomalies: Vec::new(),
            summary: IngestionSummary::default(),
            generated_at: Utc::now(),
        }
    }

    /// Takes back what a record that is about to be replaced added to the
    /// anomalies and counters. Row-level warnings stay.
    fn retract(&mut self, replaced: &CellRecord) {
        let summary = &mut self.summary;
        if replaced.has_multiple_skus() {
            summary.rows_with_multi_sku -= 1;
            self.anomalies.retain(|a| a.address != replaced.address);
        } else {
            summary.rows_without_anomalies -= 1;
        }
        match replaced.system_status {
            CellStatus::Occupied => summary.occupied -= 1,
            _ => summary.empty -= 1,
        }
        summary.records_created -= 1;
    }

    /// Anomalies recorded for `address`.
    pub fn anomalies_for<'a>(&'a self, address: &'a CellAddress) -> impl Iterator<Item = &'a Anomaly> {
        self.anomalies.iter().filter(move |a| &a.address == address)
    }
}

// =============================================================================
// Normalizer
// =============================================================================

/// Normalizes spreadsheet rows using a set of column aliases.
#[derive(Debug, Clone, Default)]
pub struct SpreadsheetNormalizer {
    aliases: ColumnAliases,
}

impl SpreadsheetNormalizer {
    pub fn new(aliases: ColumnAliases) -> Self {
        SpreadsheetNormalizer { aliases }
    }

    /// Normalizes a row sequence.
    pub fn normalize(&self, rows: &[RawRow]) -> IngestionReport {
        let mut report = IngestionReport::empty();
        let mut first_seen: BTreeMap<CellAddress, usize> = BTreeMap::new();
        report.summary.total_rows = rows.len();

        for (index, row) in rows.iter().enumerate() {
            let row_number = index + 1;

            let Some(name) = first_present(row, &self.aliases.cell_name) else {
                debug!(row = row_number, "skipping row without cell name");
                continue;
            };

            let address = match CellAddress::parse(&name) {
                Ok(address) => address,
                Err(e) => {
                    debug!(row = row_number, text = %name, "unparsable cell name");
                    report.errors.push(RowError {
                        row: row_number,
                        text: name,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let status_text = first_present(row, &self.aliases.status);
            let system_status = match normalize_status(status_text.as_deref()) {
                CellStatus::Unknown => {
                    report.warnings.push(IngestionWarning::UnknownStatus {
                        row: row_number,
                        address: address.clone(),
                        status: status_text.unwrap_or_default(),
                    });
                    CellStatus::Empty
                }
                known => known,
            };

            let sku_text = first_present(row, &self.aliases.sku);
            let quantity_text = first_present(row, &self.aliases.quantity);
            let skus = split_list(sku_text.as_deref());
            let quantities = split_list(quantity_text.as_deref());

            if skus.is_empty() {
                if let Some(quantity) = quantity_text {
                    report.warnings.push(IngestionWarning::QuantityWithoutSkus {
                        row: row_number,
                        address: address.clone(),
                        quantity,
                    });
                }
            }

            let mut manifest = ArticleManifest::new();
            for (i, sku) in skus.iter().enumerate() {
                if let Err(e) = validate_sku(sku) {
                    report.warnings.push(IngestionWarning::SuspiciousSku {
                        row: row_number,
                        address: address.clone(),
                        sku: sku.clone(),
                        reason: e.to_string(),
                    });
                }
                let quantity = quantities.get(i).and_then(|q| parse_quantity(q)).unwrap_or(1);
                manifest.insert(sku.clone(), quantity);
            }

            if let Some(previous_row) = first_seen.insert(address.clone(), row_number) {
                report.warnings.push(IngestionWarning::DuplicateAddress {
                    row: row_number,
                    address: address.clone(),
                    previous_row,
                });
                if let Some(replaced) = report.records.remove(&address) {
                    report.retract(&replaced);
                }
            }

            if manifest.sku_count() > 1 {
                let skus: Vec<String> = manifest.skus().into_iter().map(str::to_string).collect();
                report.anomalies.push(Anomaly {
                    row: row_number,
                    address: address.clone(),
                    count: skus.len(),
                    message: format!(
                        "cell {address} holds {} different SKUs ({}), verify physically",
                        skus.len(),
                        skus.join(", ")
                    ),
                    skus,
                });
                report.summary.rows_with_multi_sku += 1;
            } else {
                report.summary.rows_without_anomalies += 1;
            }

            match system_status {
                CellStatus::Occupied => report.summary.occupied += 1,
                _ => report.summary.empty += 1,
            }

            report.summary.records_created += 1;
            report.records.insert(
                address.clone(),
                CellRecord {
                    address,
                    system_status,
                    expected_manifest: manifest,
                    description: first_present(row, &self.aliases.description),
                    source_row: SourceRow {
                        row: row_number,
                        raw: row.clone(),
                    },
                },
            );
        }

        report.summary.errors = report.errors.len();
        report.summary.warnings = report.warnings.len();

        info!(
            total_rows = report.summary.total_rows,
            records = report.records.len(),
            errors = report.summary.errors,
            warnings = report.summary.warnings,
            anomalies = report.anomalies.len(),
            "ingestion finished"
        );

        report
    }

    /// Normalizes a JSON array of row objects.
    ///
    /// Fails when the value is not an array. Elements that are not objects
    /// are skipped like blank rows but still count toward `total_rows`.
    pub fn normalize_json(&self, value: &serde_json::Value) -> Result<IngestionReport, IngestionError> {
        let serde_json::Value::Array(items) = value else {
            return Err(IngestionError::NotARowSequence {
                found: json_kind(value).to_string(),
            });
        };

        let rows: Vec<RawRow> = items
            .iter()
            .map(|item| match item {
                serde_json::Value::Object(map) => map
                    .iter()
                    .map(|(k, v)| (k.clone(), RawValue::from(v)))
                    .collect(),
                _ => RawRow::new(),
            })
            .collect();

        Ok(self.normalize(&rows))
    }
}

/// Normalizes rows with the default column aliases.
pub fn normalize(rows: &[RawRow]) -> IngestionReport {
    SpreadsheetNormalizer::default().normalize(rows)
}

/// Normalizes a JSON row array with the default column aliases.
pub fn normalize_json(value: &serde_json::Value) -> Result<IngestionReport, IngestionError> {
    SpreadsheetNormalizer::default().normalize_json(value)
}

/// Maps free-form status text to a [`CellStatus`]. Blank means empty.
pub fn normalize_status(text: Option<&str>) -> CellStatus {
    let status = text.unwrap_or_default().trim().to_lowercase();
    if status.is_empty() {
        return CellStatus::Empty;
    }
    if OCCUPIED_FLAGS.contains(&status.as_str()) || OCCUPIED_WORDS.iter().any(|w| status.contains(w)) {
        CellStatus::Occupied
    } else if EMPTY_FLAGS.contains(&status.as_str()) || EMPTY_WORDS.iter().any(|w| status.contains(w)) {
        CellStatus::Empty
    } else {
        CellStatus::Unknown
    }
}

fn split_list(text: Option<&str>) -> Vec<String> {
    text.map(|t| {
        t.split(LIST_SEPARATORS)
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Leading-digit integer parse: `"3 pcs"` is 3, `"x"` is `None`.
fn parse_quantity(token: &str) -> Option<u32> {
    let digits: String = token.trim().chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(cells: &[(&str, &str)]) -> RawRow {
        cells
            .iter()
            .map(|(k, v)| (k.to_string(), RawValue::from(*v)))
            .collect()
    }

    fn addr(s: &str) -> CellAddress {
        CellAddress::parse(s).unwrap()
    }

    #[test]
    fn test_multi_sku_row_is_an_anomaly() {
        let report = normalize(&[row(&[
            ("Название Ячейки", "A01-01-01-A"),
            ("Статус", "Занята"),
            ("Артикул", "SKU-1;SKU-2"),
            ("Кол-во", "1;1"),
        ])]);

        assert_eq!(report.records.len(), 1);
        let record = &report.records[&addr("A01-01-01-A")];
        assert_eq!(record.system_status, CellStatus::Occupied);
        assert_eq!(record.expected_manifest.sku_count(), 2);
        assert!(record.has_multiple_skus());

        assert_eq!(report.anomalies_for(&addr("A01-01-01-A")).count(), 1);
        assert_eq!(report.anomalies[0].skus, vec!["SKU-1", "SKU-2"]);
        assert_eq!(report.anomalies[0].count, 2);
        assert!(report.errors.is_empty());
        assert_eq!(report.summary.rows_with_multi_sku, 1);
    }

    #[test]
    fn test_single_sku_row_has_no_anomaly() {
        let report = normalize(&[row(&[
            ("Название Ячейки", "A01-01-01-A"),
            ("Статус", "Занята"),
            ("Артикул", "SKU-1"),
        ])]);
        assert!(report.anomalies.is_empty());
        assert_eq!(report.summary.rows_without_anomalies, 1);
        let record = &report.records[&addr("A01-01-01-A")];
        assert_eq!(record.expected_manifest.quantity_of("SKU-1"), Some(1));
    }

    #[test]
    fn test_bad_name_is_row_error_and_processing_continues() {
        let report = normalize(&[
            row(&[("Cell Name", "garbage"), ("Status", "occupied")]),
            row(&[("Cell Name", "A01 01 02 B"), ("Status", "empty")]),
        ]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].row, 1);
        assert_eq!(report.errors[0].text, "garbage");
        assert!(report.records.contains_key(&addr("A01-01-02-B")));
        assert_eq!(report.summary.total_rows, 2);
        assert_eq!(report.summary.records_created, 1);
    }

    #[test]
    fn test_blank_name_is_skipped_silently() {
        let report = normalize(&[row(&[("Статус", "Занята")]), row(&[("A", "   ")])]);
        assert!(report.records.is_empty());
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
        assert_eq!(report.summary.total_rows, 2);
    }

    #[test]
    fn test_unknown_status_warns_and_stores_empty() {
        let report = normalize(&[row(&[("A", "A01-01-01-A"), ("B", "maybe")])]);
        assert_eq!(report.records[&addr("A01-01-01-A")].system_status, CellStatus::Empty);
        assert!(matches!(
            report.warnings.as_slice(),
            [IngestionWarning::UnknownStatus { status, .. }] if status == "maybe"
        ));
        assert_eq!(report.summary.empty, 1);
    }

    #[test]
    fn test_status_tokens() {
        assert_eq!(normalize_status(Some("Свободна")), CellStatus::Empty);
        assert_eq!(normalize_status(Some("ЗАПОЛНЕНА")), CellStatus::Occupied);
        assert_eq!(normalize_status(Some("Occupied")), CellStatus::Occupied);
        assert_eq!(normalize_status(Some("1")), CellStatus::Occupied);
        assert_eq!(normalize_status(Some("false")), CellStatus::Empty);
        assert_eq!(normalize_status(None), CellStatus::Empty);
        assert_eq!(normalize_status(Some("??")), CellStatus::Unknown);
    }

    #[test]
    fn test_quantities_are_positional_with_default() {
        let report = normalize(&[row(&[
            ("A", "A01-01-01-A"),
            ("D", "X | Y , Z"),
            ("C", "3 шт; abc"),
        ])]);
        let manifest = &report.records[&addr("A01-01-01-A")].expected_manifest;
        assert_eq!(manifest.quantity_of("X"), Some(3));
        assert_eq!(manifest.quantity_of("Y"), Some(1));
        assert_eq!(manifest.quantity_of("Z"), Some(1));
    }

    #[test]
    fn test_quantity_without_sku_warns() {
        let report = normalize(&[row(&[("A", "A01-01-01-A"), ("C", "5")])]);
        assert_eq!(report.records.len(), 1);
        assert!(matches!(
            report.warnings.as_slice(),
            [IngestionWarning::QuantityWithoutSkus { .. }]
        ));
    }

    #[test]
    fn test_duplicate_address_later_row_wins() {
        let report = normalize(&[
            row(&[("A", "A01-01-01-A"), ("D", "OLD")]),
            row(&[("A", "a01 01 01 a"), ("D", "NEW")]),
        ]);
        assert_eq!(report.records.len(), 1);
        let record = &report.records[&addr("A01-01-01-A")];
        assert!(record.expected_manifest.quantity_of("NEW").is_some());
        assert_eq!(record.source_row.row, 2);
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, IngestionWarning::DuplicateAddress { previous_row: 1, .. })));
    }

    #[test]
    fn test_replaced_row_no_longer_counts() {
        let report = normalize(&[
            row(&[("A", "A01-01-01-A"), ("B", "occupied"), ("D", "S1;S2")]),
            row(&[("A", "A01-01-02-A"), ("B", "occupied"), ("D", "S3;S4")]),
            row(&[("A", "A01-01-01-A"), ("B", "empty"), ("D", "S1")]),
        ]);

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.anomalies_for(&addr("A01-01-01-A")).count(), 0);
        assert_eq!(report.anomalies_for(&addr("A01-01-02-A")).count(), 1);
        assert_eq!(
            report.summary,
            IngestionSummary {
                total_rows: 3,
                records_created: 2,
                rows_without_anomalies: 1,
                rows_with_multi_sku: 1,
                occupied: 1,
                empty: 1,
                errors: 0,
                warnings: 1,
            }
        );
    }

    #[test]
    fn test_normalize_json_rejects_non_sequence() {
        let err = normalize_json(&json!({ "A": "A01-01-01-A" })).unwrap_err();
        assert_eq!(
            err,
            IngestionError::NotARowSequence {
                found: "object".to_string()
            }
        );
    }

    #[test]
    fn test_normalize_json_accepts_mixed_values() {
        let report = normalize_json(&json!([
            { "Cell Name": "OS NA 002 010 049", "Status": 1, "SKU": "SKU-9", "Quantity": 4 },
            "not a row",
            { "Cell Name": null }
        ]))
        .unwrap();

        assert_eq!(report.summary.total_rows, 3);
        let record = &report.records[&addr("A02-10-49-A")];
        assert_eq!(record.system_status, CellStatus::Occupied);
        assert_eq!(record.expected_manifest.quantity_of("SKU-9"), Some(4));
    }

    #[test]
    fn test_summary_counts_warnings_and_errors() {
        let report = normalize(&[
            row(&[("A", "A01-01-01-A"), ("B", "Занята"), ("D", "S1")]),
            row(&[("A", "A01-01-02-A"), ("B", "??")]),
            row(&[("A", "bad")]),
        ]);
        let summary = report.summary;
        assert_eq!(summary.occupied, 1);
        assert_eq!(summary.empty, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.warnings, 1);
    }
}
