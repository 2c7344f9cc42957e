//! Coverage report parsing and bucketing.
//!
//! Input is the JSON report written by `coverage json`. Percentages are
//! recomputed from statement counts so that every record obeys
//! `coverage_percent = covered / statements * 100` (100.0 for empty files).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::types::ToolStatus;
use crate::error::CoverageError;

/// Coverage figures for one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub statements: u64,
    pub missed: u64,
    pub covered: u64,
    pub coverage_percent: f64,
    /// Sorted, unique line numbers.
    pub missing_lines: Vec<u64>,
}

impl CoverageRecord {
    pub fn new(statements: u64, missed: u64, missing_lines: impl IntoIterator<Item = u64>) -> Self {
        let missed = missed.min(statements);
        let covered = statements - missed;
        let missing_lines: BTreeSet<u64> = missing_lines.into_iter().collect();
        Self {
            statements,
            missed,
            covered,
            coverage_percent: percent(covered, statements),
            missing_lines: missing_lines.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageTotals {
    pub total_statements: u64,
    pub total_missed: u64,
    pub overall_coverage_percent: f64,
}

/// Parsed coverage for a whole track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub per_file: BTreeMap<String, CoverageRecord>,
    pub overall: CoverageTotals,
}

/// Reporting bucket; never used for pass/fail gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageBucket {
    Excellent,
    Good,
    Moderate,
    NeedsWork,
    Critical,
}

impl CoverageBucket {
    pub fn for_percent(percent: f64) -> Self {
        if percent >= 80.0 {
            CoverageBucket::Excellent
        } else if percent >= 60.0 {
            CoverageBucket::Good
        } else if percent >= 40.0 {
            CoverageBucket::Moderate
        } else if percent >= 20.0 {
            CoverageBucket::NeedsWork
        } else {
            CoverageBucket::Critical
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleCoverage {
    pub path: String,
    pub coverage_percent: f64,
}

/// Modules grouped by bucket, each list in path order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageCategories {
    pub excellent: Vec<ModuleCoverage>,
    pub good: Vec<ModuleCoverage>,
    pub moderate: Vec<ModuleCoverage>,
    pub needs_work: Vec<ModuleCoverage>,
    pub critical: Vec<ModuleCoverage>,
}

#[derive(Deserialize)]
struct RawReport {
    #[serde(default)]
    files: BTreeMap<String, RawFile>,
}

#[derive(Deserialize)]
struct RawFile {
    summary: RawSummary,
    #[serde(default)]
    missing_lines: Vec<u64>,
}

#[derive(Deserialize)]
struct RawSummary {
    num_statements: u64,
    missing_lines: u64,
}

/// Parse a `coverage json` report.
pub fn parse(combined_output: &str) -> Result<CoverageReport, CoverageError> {
    let raw: RawReport = serde_json::from_str(combined_output).map_err(CoverageError::Parse)?;
    let per_file: BTreeMap<String, CoverageRecord> = raw
        .files
        .into_iter()
        .map(|(path, file)| {
            let record = CoverageRecord::new(
                file.summary.num_statements,
                file.summary.missing_lines,
                file.missing_lines,
            );
            (path, record)
        })
        .collect();

    let total_statements = per_file.values().map(|r| r.statements).sum();
    let total_missed = per_file.values().map(|r| r.missed).sum();
    Ok(CoverageReport {
        overall: CoverageTotals {
            total_statements,
            total_missed,
            overall_coverage_percent: percent(total_statements - total_missed, total_statements),
        },
        per_file,
    })
}

/// Group records into the five reporting buckets.
pub fn categorize(records: &BTreeMap<String, CoverageRecord>) -> CoverageCategories {
    let mut categories = CoverageCategories::default();
    for (path, record) in records {
        let module = ModuleCoverage {
            path: path.clone(),
            coverage_percent: record.coverage_percent,
        };
        let bucket = match CoverageBucket::for_percent(record.coverage_percent) {
            CoverageBucket::Excellent => &mut categories.excellent,
            CoverageBucket::Good => &mut categories.good,
            CoverageBucket::Moderate => &mut categories.moderate,
            CoverageBucket::NeedsWork => &mut categories.needs_work,
            CoverageBucket::Critical => &mut categories.critical,
        };
        bucket.push(module);
    }
    categories
}

/// Persisted payload of the `coverage` tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub overall: CoverageTotals,
    pub categories: CoverageCategories,
}

impl CoverageSummary {
    pub fn from_report(report: &CoverageReport) -> Self {
        Self {
            overall: report.overall.clone(),
            categories: categorize(&report.per_file),
        }
    }

    /// Informational status: WARN when any module is critical, never FAIL.
    pub fn status(&self) -> ToolStatus {
        if self.categories.critical.is_empty() {
            ToolStatus::Pass
        } else {
            ToolStatus::Warn
        }
    }
}

fn percent(covered: u64, statements: u64) -> f64 {
    if statements == 0 {
        return 100.0;
    }
    covered as f64 / statements as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"{
        "meta": {"version": "7.4.0"},
        "files": {
            "pkg/a.py": {
                "executed_lines": [1, 2, 3],
                "summary": {"covered_lines": 3, "num_statements": 4, "percent_covered": 75.0, "missing_lines": 1},
                "missing_lines": [4]
            },
            "pkg/empty.py": {
                "summary": {"covered_lines": 0, "num_statements": 0, "percent_covered": 100.0, "missing_lines": 0},
                "missing_lines": []
            },
            "pkg/b.py": {
                "summary": {"covered_lines": 1, "num_statements": 10, "percent_covered": 10.0, "missing_lines": 9},
                "missing_lines": [9, 2, 3, 4, 5, 6, 7, 8, 10, 9]
            }
        },
        "totals": {"covered_lines": 4, "num_statements": 14}
    }"#;

    #[test]
    fn parses_records_and_totals() {
        let report = parse(REPORT).expect("parse");
        let a = &report.per_file["pkg/a.py"];
        assert_eq!(a.covered, 3);
        assert_eq!(a.coverage_percent, 75.0);
        assert_eq!(report.per_file["pkg/empty.py"].coverage_percent, 100.0);
        let b = &report.per_file["pkg/b.py"];
        assert_eq!(b.missing_lines, vec![2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(report.overall.total_statements, 14);
        assert_eq!(report.overall.total_missed, 10);
    }

    #[test]
    fn bucket_thresholds() {
        assert_eq!(CoverageBucket::for_percent(80.0), CoverageBucket::Excellent);
        assert_eq!(CoverageBucket::for_percent(79.9), CoverageBucket::Good);
        assert_eq!(CoverageBucket::for_percent(60.0), CoverageBucket::Good);
        assert_eq!(CoverageBucket::for_percent(59.0), CoverageBucket::Moderate);
        assert_eq!(CoverageBucket::for_percent(20.0), CoverageBucket::NeedsWork);
        assert_eq!(CoverageBucket::for_percent(19.99), CoverageBucket::Critical);
    }

    #[test]
    fn categorizes_by_bucket() {
        let report = parse(REPORT).expect("parse");
        let categories = categorize(&report.per_file);
        let excellent: Vec<&str> = categories.excellent.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(excellent, vec!["pkg/empty.py"]);
        assert_eq!(categories.good.len(), 1);
        assert_eq!(categories.critical[0].path, "pkg/b.py");
    }

    #[test]
    fn critical_modules_warn_but_never_fail() {
        let summary = CoverageSummary::from_report(&parse(REPORT).expect("parse"));
        assert_eq!(summary.status(), ToolStatus::Warn);
        assert_eq!(summary.categories.critical.len(), 1);

        let healthy = parse(r#"{"files": {"a.py": {"summary": {"num_statements": 2, "missing_lines": 0}}}}"#)
            .expect("parse");
        assert_eq!(CoverageSummary::from_report(&healthy).status(), ToolStatus::Pass);
    }

    #[test]
    fn rejects_malformed_report() {
        assert!(matches!(parse("not json"), Err(CoverageError::Parse(_))));
    }
}
