//! Aggregate pass/fail decision for an audit run.

use serde::Serialize;

use crate::core::types::{ToolResultRef, ToolStatus, TrackOutcomes, TrackState};

/// Outcome of the gate, naming everything that caused a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub overall_pass: bool,
    /// `domain/tool` for every tool whose status is FAIL.
    pub failing_tools: Vec<String>,
    /// Tracks whose state is not `passed`. Only gating in strict mode.
    pub failing_tracks: Vec<String>,
}

/// Compute the overall decision.
///
/// Non-strict: every tool status must differ from FAIL; track states are
/// reported but do not gate. Strict: additionally every recorded track,
/// including ones carried over from independent runs, must be `passed`.
pub fn evaluate(tools: &[ToolResultRef], tracks: Option<&TrackOutcomes>, strict: bool) -> GateDecision {
    let failing_tools: Vec<String> = tools
        .iter()
        .filter(|tool| tool.status == ToolStatus::Fail)
        .map(|tool| format!("{}/{}", tool.domain, tool.tool_name))
        .collect();
    let failing_tracks: Vec<String> = tracks
        .map(|tracks| {
            tracks
                .iter()
                .filter(|(_, outcome)| outcome.state != TrackState::Passed)
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default();

    let tools_pass = failing_tools.is_empty();
    let overall_pass = if strict {
        tools_pass && failing_tracks.is_empty()
    } else {
        tools_pass
    };

    GateDecision {
        overall_pass,
        failing_tools,
        failing_tracks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{TestCounts, TestTrackOutcome};

    fn tool(name: &str, status: ToolStatus) -> ToolResultRef {
        ToolResultRef {
            tool_name: name.to_string(),
            domain: "docs".to_string(),
            status,
            total_issues: 0,
            path: None,
        }
    }

    fn tracks(state: TrackState) -> TrackOutcomes {
        let mut tracks = TrackOutcomes::new();
        tracks.insert(
            "parallel".to_string(),
            TestTrackOutcome::new(state, Some(1), TestCounts::default(), Vec::new()),
        );
        tracks
    }

    #[test]
    fn non_strict_ignores_test_failures() {
        let tools = [tool("links", ToolStatus::Warn)];
        let tracks = tracks(TrackState::TestFailures);
        let decision = evaluate(&tools, Some(&tracks), false);
        assert!(decision.overall_pass);
        assert_eq!(decision.failing_tracks, vec!["parallel"]);
    }

    #[test]
    fn strict_fails_on_any_non_passed_track() {
        let tools = [tool("links", ToolStatus::Clean)];
        for state in [
            TrackState::TestFailures,
            TrackState::Crashed,
            TrackState::InfraCleanupError,
            TrackState::CoverageFailed,
            TrackState::Unknown,
        ] {
            let tracks = tracks(state);
            assert!(!evaluate(&tools, Some(&tracks), true).overall_pass, "{state:?}");
        }
        let passed = tracks(TrackState::Passed);
        assert!(evaluate(&tools, Some(&passed), true).overall_pass);
    }

    #[test]
    fn failing_tool_fails_both_modes() {
        let tools = [tool("links", ToolStatus::Fail), tool("ascii", ToolStatus::Pass)];
        let decision = evaluate(&tools, None, false);
        assert!(!decision.overall_pass);
        assert_eq!(decision.failing_tools, vec!["docs/links"]);
        assert!(!evaluate(&tools, None, true).overall_pass);
    }
}
