//! Human-readable status documents rendered once per audit run.

use std::path::PathBuf;

use minijinja::{Environment, Value, context};
use serde::Serialize;
use tracing::info;

use crate::core::coverage::CoverageSummary;
use crate::core::gate::GateDecision;
use crate::core::types::{AuditRun, TrackOutcomes, TrackState};
use crate::error::AuditError;
use crate::io::archive::ArchiveRotator;

const STATUS_TEMPLATE: &str = include_str!("templates/status.md");
const PRIORITIES_TEMPLATE: &str = include_str!("templates/priorities.md");
const REPORT_TEMPLATE: &str = include_str!("templates/report.md");

pub const STATUS_DOCUMENT: &str = "STATUS.md";
pub const PRIORITIES_DOCUMENT: &str = "PRIORITIES.md";
pub const REPORT_DOCUMENT: &str = "REPORT.md";

const DOCUMENTS: [(&str, &str); 3] = [
    (STATUS_DOCUMENT, STATUS_TEMPLATE),
    (PRIORITIES_DOCUMENT, PRIORITIES_TEMPLATE),
    (REPORT_DOCUMENT, REPORT_TEMPLATE),
];

/// Everything a document may mention. Built only after every tool and track
/// of the run has completed.
#[derive(Debug, Clone, Copy)]
pub struct DocumentInputs<'a> {
    pub run: &'a AuditRun,
    pub decision: &'a GateDecision,
    /// All recorded track outcomes, including ones carried over from earlier runs.
    pub tracks: Option<&'a TrackOutcomes>,
    pub coverage: Option<&'a CoverageSummary>,
}

#[derive(Debug, Serialize)]
struct TrackView {
    name: String,
    state: &'static str,
    return_code: String,
    passed: u32,
    failed: u32,
    errors: u32,
    skipped: u32,
    failed_node_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ModuleView {
    path: String,
    percent: String,
}

#[derive(Debug, Serialize)]
struct BucketView {
    name: &'static str,
    count: usize,
}

#[derive(Debug, Serialize)]
struct CoverageView {
    percent: String,
    total_statements: u64,
    total_missed: u64,
    buckets: Vec<BucketView>,
}

/// Renders and writes `STATUS.md`, `PRIORITIES.md` and `REPORT.md`.
#[derive(Debug, Clone)]
pub struct DocumentWriter {
    dir: PathBuf,
    rotator: ArchiveRotator,
    max_versions: usize,
}

impl DocumentWriter {
    pub fn new(dir: impl Into<PathBuf>, rotator: ArchiveRotator, max_versions: usize) -> Self {
        Self {
            dir: dir.into(),
            rotator,
            max_versions,
        }
    }

    pub fn path(&self, document: &str) -> PathBuf {
        self.dir.join(document)
    }

    /// Render every document, then write each through the rotator.
    ///
    /// Rendering happens up front so a template error leaves the previous
    /// documents untouched.
    pub fn write_all(&self, inputs: &DocumentInputs<'_>) -> Result<Vec<PathBuf>, AuditError> {
        let rendered = render_all(inputs)?;
        let mut written = Vec::with_capacity(rendered.len());
        for (document, content) in rendered {
            let path = self.rotator.create_output_file(
                &self.path(document),
                &content,
                true,
                self.max_versions,
            )?;
            written.push(path);
        }
        info!(dir = %self.dir.display(), count = written.len(), "documents written");
        Ok(written)
    }
}

fn render_all(inputs: &DocumentInputs<'_>) -> Result<Vec<(&'static str, String)>, AuditError> {
    let mut env = Environment::new();
    for (document, template) in DOCUMENTS {
        env.add_template(document, template)
            .map_err(|source| AuditError::Render { document, source })?;
    }
    let ctx = document_context(inputs);
    let mut rendered = Vec::with_capacity(DOCUMENTS.len());
    for (document, _) in DOCUMENTS {
        let content = env
            .get_template(document)
            .and_then(|template| template.render(&ctx))
            .map_err(|source| AuditError::Render { document, source })?;
        rendered.push((document, content));
    }
    Ok(rendered)
}

fn document_context(inputs: &DocumentInputs<'_>) -> Value {
    let run = inputs.run;
    let tracks: Option<Vec<TrackView>> = inputs.tracks.map(|tracks| {
        tracks
            .iter()
            .map(|(name, outcome)| TrackView {
                name: name.clone(),
                state: outcome.state.as_str(),
                return_code: outcome
                    .return_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                passed: outcome.passed_count,
                failed: outcome.failed_count,
                errors: outcome.error_count,
                skipped: outcome.skipped_count,
                failed_node_ids: outcome.failed_node_ids.clone(),
            })
            .collect()
    });
    let tracks_needing_attention: Vec<&TrackView> = tracks
        .iter()
        .flatten()
        .filter(|track| track.state != TrackState::Passed.as_str())
        .collect();
    let critical_modules: Vec<ModuleView> = inputs
        .coverage
        .map(|coverage| {
            coverage
                .categories
                .critical
                .iter()
                .map(|module| ModuleView {
                    path: module.path.clone(),
                    percent: format_percent(module.coverage_percent),
                })
                .collect()
        })
        .unwrap_or_default();
    let coverage = inputs.coverage.map(|coverage| {
        let categories = &coverage.categories;
        CoverageView {
            percent: format_percent(coverage.overall.overall_coverage_percent),
            total_statements: coverage.overall.total_statements,
            total_missed: coverage.overall.total_missed,
            buckets: vec![
                bucket("excellent", categories.excellent.len()),
                bucket("good", categories.good.len()),
                bucket("moderate", categories.moderate.len()),
                bucket("needs_work", categories.needs_work.len()),
                bucket("critical", categories.critical.len()),
            ],
        }
    });

    context! {
        verdict => if run.overall_pass { "PASS" } else { "FAIL" },
        tier => run.tier.as_str(),
        strict => run.strict,
        started_at => run.started_at.to_rfc3339(),
        finished_at => run.finished_at.to_rfc3339(),
        tools => run.tool_results.iter().map(|tool| context! {
            domain => tool.domain.as_str(),
            tool_name => tool.tool_name.as_str(),
            status => tool.status.as_str(),
            total_issues => tool.total_issues,
            path => tool.path.as_deref(),
        }).collect::<Vec<_>>(),
        failing_tools => inputs.decision.failing_tools.as_slice(),
        failing_tracks => inputs.decision.failing_tracks.as_slice(),
        tracks_needing_attention => tracks_needing_attention,
        tracks => tracks,
        coverage => coverage,
        critical_modules => critical_modules,
    }
}

fn bucket(name: &'static str, count: usize) -> BucketView {
    BucketView { name, count }
}

fn format_percent(percent: f64) -> String {
    format!("{percent:.1}")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::Utc;

    use super::*;
    use crate::core::coverage::{CoverageCategories, CoverageTotals, ModuleCoverage};
    use crate::core::gate::evaluate;
    use crate::core::types::{
        TestCounts, TestTrackOutcome, Tier, ToolResultRef, ToolStatus, TrackState,
    };
    use crate::io::archive::archived_versions;

    fn sample_run(strict: bool) -> (AuditRun, TrackOutcomes) {
        let mut tracks = TrackOutcomes::new();
        tracks.insert(
            "parallel".to_string(),
            TestTrackOutcome::new(
                TrackState::TestFailures,
                Some(1),
                TestCounts {
                    passed: 10,
                    failed: 1,
                    ..TestCounts::default()
                },
                vec!["tests/test_x.py::test_broken".to_string()],
            ),
        );
        let tools = vec![ToolResultRef {
            tool_name: "ascii".to_string(),
            domain: "docs".to_string(),
            status: ToolStatus::Fail,
            total_issues: 3,
            path: Some("docs/jsons/ascii_results.json".to_string()),
        }];
        let decision = evaluate(&tools, Some(&tracks), strict);
        let run = AuditRun {
            tier: Tier::Full,
            strict,
            tool_results: tools,
            tier3_test_outcome: Some(tracks.clone()),
            overall_pass: decision.overall_pass,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        (run, tracks)
    }

    fn coverage() -> CoverageSummary {
        CoverageSummary {
            overall: CoverageTotals {
                total_statements: 100,
                total_missed: 50,
                overall_coverage_percent: 50.0,
            },
            categories: CoverageCategories {
                critical: vec![ModuleCoverage {
                    path: "pkg/legacy.py".to_string(),
                    coverage_percent: 5.0,
                }],
                ..CoverageCategories::default()
            },
        }
    }

    #[test]
    fn priorities_order_tools_tracks_then_coverage() {
        let (run, tracks) = sample_run(false);
        let decision = evaluate(&run.tool_results, Some(&tracks), false);
        let coverage = coverage();
        let inputs = DocumentInputs {
            run: &run,
            decision: &decision,
            tracks: Some(&tracks),
            coverage: Some(&coverage),
        };
        let rendered = render_all(&inputs).expect("render");
        let priorities = &rendered
            .iter()
            .find(|(name, _)| *name == PRIORITIES_DOCUMENT)
            .expect("priorities")
            .1;
        let tool = priorities.find("docs/ascii").expect("tool listed");
        let track = priorities
            .find("tests/test_x.py::test_broken")
            .expect("failed id listed");
        let module = priorities.find("pkg/legacy.py").expect("module listed");
        assert!(tool < track && track < module);
    }

    #[test]
    fn status_names_failures_and_verdict() {
        let (run, tracks) = sample_run(true);
        let decision = evaluate(&run.tool_results, Some(&tracks), true);
        let inputs = DocumentInputs {
            run: &run,
            decision: &decision,
            tracks: Some(&tracks),
            coverage: None,
        };
        let rendered = render_all(&inputs).expect("render");
        let status = &rendered[0].1;
        assert!(status.contains("**FAIL**"));
        assert!(status.contains("tool `docs/ascii`"));
        assert!(status.contains("track `parallel`"));
        assert!(!status.contains("## Coverage"));
    }

    #[test]
    fn write_all_rotates_previous_documents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = DocumentWriter::new(temp.path(), ArchiveRotator::new(true), 2);
        let (run, tracks) = sample_run(false);
        let decision = evaluate(&run.tool_results, Some(&tracks), false);
        let inputs = DocumentInputs {
            run: &run,
            decision: &decision,
            tracks: Some(&tracks),
            coverage: None,
        };
        for _ in 0..4 {
            writer.write_all(&inputs).expect("write");
        }
        for document in [STATUS_DOCUMENT, PRIORITIES_DOCUMENT, REPORT_DOCUMENT] {
            let path = writer.path(document);
            assert!(fs::read_to_string(&path).expect("read").contains("Audit"));
            assert_eq!(archived_versions(&path).expect("versions").len(), 2);
        }
    }
}
