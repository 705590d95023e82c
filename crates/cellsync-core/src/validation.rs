//! # Article Validation
//!
//! Compares the manifest a cell is expected to hold against what an operator
//! actually counted.
//!
//! ## Decision Table (first match wins)
//! ```text
//! ┌────┬────────────────────────────────────┬───────────────────┬──────────┐
//! │ #  │ Condition                          │ Kind              │ Severity │
//! ├────┼────────────────────────────────────┼───────────────────┼──────────┤
//! │ 1  │ actual missing                     │ NotInspected      │ warning  │
//! │ 2  │ both empty                         │ OkEmpty           │ -        │
//! │ 3  │ expected empty, actual not         │ UnexpectedItems   │ critical │
//! │ 4  │ expected not empty, actual empty   │ MissingItems      │ critical │
//! │ 5  │ counts differ                      │ CountMismatch     │ error    │
//! │ 6  │ SKU sets differ (both list SKUs)   │ ArticlesMismatch  │ critical │
//! │ 7  │ otherwise                          │ Ok                │ -        │
//! └────┴────────────────────────────────────┴───────────────────┴──────────┘
//! ```
//!
//! Counts are compared before SKU sets so that a count-only manifest still
//! gets a decision.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::types::ArticleManifest;

/// Longest SKU accepted by [`validate_sku`].
pub const MAX_SKU_LEN: usize = 64;

/// Outcome category of a manifest comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationKind {
    NotInspected,
    OkEmpty,
    UnexpectedItems,
    MissingItems,
    CountMismatch,
    ArticlesMismatch,
    Ok,
}

/// How urgently a finding needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// Result of [`compare`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ValidationResult {
    pub kind: ValidationKind,
    pub severity: Option<Severity>,
    pub expected_count: u32,
    pub actual_count: Option<u32>,
    /// SKUs expected but not found.
    pub missing: Vec<String>,
    /// SKUs found but not expected.
    pub extra: Vec<String>,
    pub message: String,
}

impl ValidationResult {
    fn new(
        kind: ValidationKind,
        severity: Option<Severity>,
        expected: &ArticleManifest,
        actual: Option<&ArticleManifest>,
        message: String,
    ) -> Self {
        ValidationResult {
            kind,
            severity,
            expected_count: expected.count(),
            actual_count: actual.map(ArticleManifest::count),
            missing: Vec::new(),
            extra: Vec::new(),
            message,
        }
    }

    /// True for every finding that carries a severity.
    pub fn has_error(&self) -> bool {
        self.severity.is_some()
    }

    /// True for [`Severity::Critical`] findings.
    pub fn is_critical(&self) -> bool {
        self.severity == Some(Severity::Critical)
    }
}

/// Compares an expected manifest with an observed one.
pub fn compare(expected: &ArticleManifest, actual: Option<&ArticleManifest>) -> ValidationResult {
    let Some(actual_manifest) = actual else {
        return ValidationResult::new(
            ValidationKind::NotInspected,
            Some(Severity::Warning),
            expected,
            None,
            "article count not confirmed yet".to_string(),
        );
    };

    let expected_count = expected.count();
    let actual_count = actual_manifest.count();

    match (expected.is_empty(), actual_manifest.is_empty()) {
        (true, true) => {
            return ValidationResult::new(
                ValidationKind::OkEmpty,
                None,
                expected,
                actual,
                "cell is empty as expected".to_string(),
            )
        }
        (true, false) => {
            return ValidationResult::new(
                ValidationKind::UnexpectedItems,
                Some(Severity::Critical),
                expected,
                actual,
                format!("cell should be empty but {actual_count} items were found"),
            )
        }
        (false, true) => {
            return ValidationResult::new(
                ValidationKind::MissingItems,
                Some(Severity::Critical),
                expected,
                actual,
                format!("expected {expected_count} items but the cell is empty"),
            )
        }
        (false, false) => {}
    }

    if expected_count != actual_count {
        return ValidationResult::new(
            ValidationKind::CountMismatch,
            Some(Severity::Error),
            expected,
            actual,
            format!("expected {expected_count} items, found {actual_count}"),
        );
    }

    if expected.has_skus() && actual_manifest.has_skus() {
        let expected_skus = expected.skus();
        let actual_skus = actual_manifest.skus();
        let missing = difference(&expected_skus, &actual_skus);
        let extra = difference(&actual_skus, &expected_skus);

        if !missing.is_empty() || !extra.is_empty() {
            let message = format!(
                "article mismatch: missing [{}], extra [{}]",
                missing.join(", "),
                extra.join(", ")
            );
            let mut result = ValidationResult::new(
                ValidationKind::ArticlesMismatch,
                Some(Severity::Critical),
                expected,
                actual,
                message,
            );
            result.missing = missing;
            result.extra = extra;
            return result;
        }
    }

    ValidationResult::new(
        ValidationKind::Ok,
        None,
        expected,
        actual,
        "articles match".to_string(),
    )
}

fn difference(left: &BTreeSet<&str>, right: &BTreeSet<&str>) -> Vec<String> {
    left.difference(right).map(|s| s.to_string()).collect()
}

/// Structural SKU check: non-empty, bounded length, no whitespace or
/// control characters.
pub fn validate_sku(sku: &str) -> CoreResult<()> {
    let invalid = |reason: String| CoreError::Invalid {
        field: "sku".to_string(),
        reason,
    };

    if sku.is_empty() {
        return Err(invalid("SKU is empty".to_string()));
    }
    if sku.chars().count() > MAX_SKU_LEN {
        return Err(invalid(format!("SKU '{sku}' exceeds {MAX_SKU_LEN} characters")));
    }
    if sku.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid(format!("SKU '{sku}' contains whitespace")));
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
