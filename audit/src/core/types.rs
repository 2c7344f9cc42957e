//! Shared deterministic types for audit results and track outcomes.
//!
//! These types define the persisted JSON contracts. Field names and enum
//! spellings are part of the on-disk format and must stay stable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Track key for the parallel-sharded run of the primary suite.
pub const PARALLEL_TRACK: &str = "parallel";
/// Track key for the serial cross-validation run of the primary suite.
pub const SERIAL_TRACK: &str = "serial";
/// Track key for the independently scheduled secondary suite.
pub const DEV_TOOLS_TRACK: &str = "dev_tools";

/// Status reported in a tool's summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ToolStatus {
    Pass,
    Warn,
    Fail,
    Clean,
}

impl ToolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolStatus::Pass => "PASS",
            ToolStatus::Warn => "WARN",
            ToolStatus::Fail => "FAIL",
            ToolStatus::Clean => "CLEAN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSummary {
    pub total_issues: u64,
    pub files_affected: u64,
    pub status: ToolStatus,
}

/// Canonical result shape produced by every analyzer and by the coordinator.
///
/// Superseded (never mutated) by the next run with the same `(tool_name, domain)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub domain: String,
    pub summary: ToolSummary,
    /// Tool-specific payload; the orchestrator never inspects it.
    #[serde(default)]
    pub details: Value,
    pub generated_at: DateTime<Utc>,
}

impl ToolResult {
    pub fn new(tool_name: &str, domain: &str, summary: ToolSummary, details: Value) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            domain: domain.to_string(),
            summary,
            details,
            generated_at: Utc::now(),
        }
    }

    /// FAIL result recorded when the tool itself could not run.
    pub fn execution_error(tool_name: &str, domain: &str, message: &str) -> Self {
        Self::new(
            tool_name,
            domain,
            ToolSummary {
                total_issues: 1,
                files_affected: 0,
                status: ToolStatus::Fail,
            },
            serde_json::json!({ "error": message }),
        )
    }
}

/// Escalating audit depth. Each tier is a strict superset of the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Quick,
    Standard,
    Full,
}

impl Tier {
    /// Whether work registered for `required` runs at this tier.
    pub fn includes(self, required: Tier) -> bool {
        self >= required
    }

    /// Only the full tier invokes test tracks and coverage.
    pub fn runs_tests(self) -> bool {
        self == Tier::Full
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Quick => "quick",
            Tier::Standard => "standard",
            Tier::Full => "full",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(Tier::Quick),
            "standard" => Ok(Tier::Standard),
            "full" => Ok(Tier::Full),
            other => Err(format!(
                "unknown tier {other:?} (expected quick, standard, or full)"
            )),
        }
    }
}

/// Fixed taxonomy for the outcome of one test track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Passed,
    TestFailures,
    Crashed,
    InfraCleanupError,
    CoverageFailed,
    Unknown,
}

impl TrackState {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackState::Passed => "passed",
            TrackState::TestFailures => "test_failures",
            TrackState::Crashed => "crashed",
            TrackState::InfraCleanupError => "infra_cleanup_error",
            TrackState::CoverageFailed => "coverage_failed",
            TrackState::Unknown => "unknown",
        }
    }
}

/// Shape of a test track; drives how the runner spawns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    /// Suite split across N worker processes, each writing a coverage shard.
    Sharded,
    /// Same suite in one process, cross-validating parallel-only failures.
    Serial,
    /// A different corpus scheduled and recorded on its own cadence.
    Secondary,
}

/// Raw counts parsed from a test run's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub skipped: u32,
}

impl TestCounts {
    pub fn add(&mut self, other: &TestCounts) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.errors += other.errors;
        self.skipped += other.skipped;
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.errors > 0
    }
}

/// Persisted outcome of one test track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTrackOutcome {
    pub state: TrackState,
    pub return_code: Option<i64>,
    pub passed_count: u32,
    pub failed_count: u32,
    pub error_count: u32,
    pub skipped_count: u32,
    /// Sorted, unique test identifiers.
    pub failed_node_ids: Vec<String>,
}

impl TestTrackOutcome {
    pub fn new(
        state: TrackState,
        return_code: Option<i64>,
        counts: TestCounts,
        failed_node_ids: Vec<String>,
    ) -> Self {
        Self {
            state,
            return_code,
            passed_count: counts.passed,
            failed_count: counts.failed,
            error_count: counts.errors,
            skipped_count: counts.skipped,
            failed_node_ids,
        }
    }
}

/// Track outcomes keyed by track name. Merged additively across runs.
pub type TrackOutcomes = BTreeMap<String, TestTrackOutcome>;

/// Reference to a persisted tool result inside an [`AuditRun`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultRef {
    pub tool_name: String,
    pub domain: String,
    pub status: ToolStatus,
    pub total_issues: u64,
    /// Where the result was written; `None` when persisting failed.
    pub path: Option<String>,
}

impl ToolResultRef {
    pub fn from_result(result: &ToolResult, path: Option<String>) -> Self {
        Self {
            tool_name: result.tool_name.clone(),
            domain: result.domain.clone(),
            status: result.summary.status,
            total_issues: result.summary.total_issues,
            path,
        }
    }
}

/// Top-level record of one audit run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRun {
    pub tier: Tier,
    pub strict: bool,
    pub tool_results: Vec<ToolResultRef>,
    /// Absent for tiers that never invoke test tracks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier3_test_outcome: Option<TrackOutcomes>,
    pub overall_pass: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered_supersets() {
        assert!(Tier::Full.includes(Tier::Standard));
        assert!(Tier::Standard.includes(Tier::Quick));
        assert!(!Tier::Quick.includes(Tier::Standard));
        assert!(Tier::Full.runs_tests());
        assert!(!Tier::Standard.runs_tests());
    }

    #[test]
    fn tier_parses_case_insensitively() {
        assert_eq!("FULL".parse::<Tier>(), Ok(Tier::Full));
        assert!("deep".parse::<Tier>().is_err());
    }

    #[test]
    fn track_state_serializes_snake_case() {
        let json = serde_json::to_string(&TrackState::InfraCleanupError).expect("json");
        assert_eq!(json, "\"infra_cleanup_error\"");
    }

    #[test]
    fn quick_audit_run_omits_track_outcomes() {
        let run = AuditRun {
            tier: Tier::Quick,
            strict: false,
            tool_results: Vec::new(),
            tier3_test_outcome: None,
            overall_pass: true,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        let value = serde_json::to_value(&run).expect("json");
        assert!(value.get("tier3_test_outcome").is_none());
    }
}
