//! Audit Orchestrator: sequences tools and test tracks for one tier, gates the
//! result, and writes the final documents.
//!
//! Control flow of [`Auditor::run_audit`]:
//!
//! 1. Analyzers for the tier run on a scoped thread while the main thread runs
//!    the selected test tracks one after another (full tier only).
//! 2. Both sides are joined. Nothing below this point starts earlier.
//! 3. Tool results, merged track outcomes and the [`AuditRun`] are persisted.
//! 4. The gate is evaluated and the three documents are written, once.
//!
//! Failures local to a tool or track are contained and recorded; only the gate
//! reaches the exit code.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::classifier::classify;
use crate::core::coverage::CoverageSummary;
use crate::core::gate::{GateDecision, evaluate};
use crate::core::staleness::{CacheEntry, is_stale, sources_changed};
use crate::core::types::{
    AuditRun, TestTrackOutcome, Tier, ToolResult, ToolResultRef, ToolSummary, TrackKind,
    TrackOutcomes, TrackState,
};
use crate::error::{AuditError, CoverageError};
use crate::io::archive::ArchiveRotator;
use crate::io::config::AuditConfig;
use crate::io::coverage::{CoverageAggregator, load_coverage_settings};
use crate::io::reports::{DocumentInputs, DocumentWriter};
use crate::io::store::{ArtifactStore, JSONS_DIR};
use crate::io::tracks::{ShardSet, TrackExecutor, TrackRun, TrackSpec};
use crate::tools::{Analyzer, ToolContext, ToolRegistry, collect_source_mtimes};

/// Domain holding the orchestrator's own records.
pub const AUDIT_DOMAIN: &str = "audit";
pub const AUDIT_RUN_TOOL: &str = "audit_run";
/// Domain holding test track outcomes and coverage.
pub const TESTS_DOMAIN: &str = "tests";
pub const TRACKS_TOOL: &str = "test_tracks";
pub const COVERAGE_TOOL: &str = "coverage";
/// `(tool, domain)` keys the orchestrator writes itself; analyzers may not claim them.
pub const RESERVED_RESULT_KEYS: [(&str, &str); 3] = [
    (AUDIT_RUN_TOOL, AUDIT_DOMAIN),
    (TRACKS_TOOL, TESTS_DOMAIN),
    (COVERAGE_TOOL, TESTS_DOMAIN),
];
const COVERAGE_REPORT_FILE: &str = ".coverage_report.json";

/// Knobs for one audit run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditOptions {
    pub tier: Tier,
    pub strict: bool,
    /// Restrict the full tier to these tracks; `None` runs every configured track.
    pub tracks: Option<Vec<String>>,
    /// Reuse fresh analyzer caches.
    pub use_cache: bool,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            tier: Tier::Standard,
            strict: false,
            tracks: None,
            use_cache: true,
        }
    }
}

/// Result of [`Auditor::run_audit`].
#[derive(Debug, Clone)]
pub struct AuditReport {
    pub run: AuditRun,
    pub decision: GateDecision,
    /// Documents written at the end of the run; empty when writing failed.
    pub documents: Vec<PathBuf>,
}

/// Result of [`Auditor::run_single_track`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackReport {
    pub name: String,
    pub outcome: TestTrackOutcome,
    /// Every recorded track after the additive merge.
    pub recorded: TrackOutcomes,
}

impl TrackReport {
    pub fn passed(&self) -> bool {
        self.outcome.state == TrackState::Passed
    }
}

/// Track outcomes and coverage produced by one batch of tracks.
#[derive(Debug, Default)]
struct TrackBatch {
    outcomes: TrackOutcomes,
    coverage: Option<CoverageSummary>,
}

pub fn is_reserved_result_key(name: &str, domain: &str) -> bool {
    RESERVED_RESULT_KEYS.contains(&(name, domain))
}

pub struct Auditor<E: TrackExecutor> {
    project_root: PathBuf,
    config: AuditConfig,
    store: ArtifactStore,
    documents: DocumentWriter,
    registry: ToolRegistry,
    executor: E,
    coverage: CoverageAggregator,
}

impl<E: TrackExecutor> Auditor<E> {
    /// Wire an auditor for `project_root`.
    ///
    /// `archive_enabled` is the already-resolved rotation switch (config plus
    /// environment override); every writer shares the same rotator.
    pub fn new(
        project_root: impl Into<PathBuf>,
        config: AuditConfig,
        archive_enabled: bool,
        registry: ToolRegistry,
        executor: E,
    ) -> Result<Self, AuditError> {
        let project_root = project_root.into();
        let rotator = ArchiveRotator::new(archive_enabled);
        let toolsuite_dir = config.toolsuite_dir(&project_root);
        let settings = load_coverage_settings(&project_root, &config.coverage_config)?;
        let coverage = CoverageAggregator::new(
            &project_root,
            config.coverage_command.clone(),
            settings,
            config.coverage_timeout(),
            config.output_limit_bytes,
        );
        Ok(Self {
            store: ArtifactStore::new(&toolsuite_dir, rotator, config.result_max_versions),
            documents: DocumentWriter::new(&toolsuite_dir, rotator, config.report_max_versions),
            project_root,
            config,
            registry,
            executor,
            coverage,
        })
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// The last persisted audit run, if any.
    pub fn last_run(&self) -> Option<AuditRun> {
        self.store.load_result(AUDIT_RUN_TOOL, AUDIT_DOMAIN)
    }

    /// Track outcomes recorded so far, across independent runs.
    pub fn recorded_tracks(&self) -> TrackOutcomes {
        self.store
            .load_result(TRACKS_TOOL, TESTS_DOMAIN)
            .unwrap_or_default()
    }

    #[instrument(skip_all, fields(tier = %opts.tier, strict = opts.strict))]
    pub fn run_audit(&self, opts: &AuditOptions) -> Result<AuditReport, AuditError> {
        let started_at = Utc::now();
        let specs = if opts.tier.runs_tests() {
            self.track_specs(opts.tracks.as_deref())?
        } else {
            if let Some(names) = &opts.tracks {
                self.track_specs(Some(names))?;
                info!("tier does not run test tracks, ignoring track selection");
            }
            Vec::new()
        };
        info!(tracks = specs.len(), "audit started");

        let ctx = ToolContext {
            project_root: self.project_root.clone(),
            toolsuite_root: self.config.toolsuite_dir(&self.project_root),
            tier: opts.tier,
            output_limit_bytes: self.config.output_limit_bytes,
        };
        let (mut tool_results, batch) = thread::scope(|scope| {
            let tools = scope.spawn(|| self.run_tools(&ctx, opts.use_cache));
            let batch = self.run_tracks(&specs);
            match tools.join() {
                Ok(results) => (results, batch),
                Err(payload) => panic::resume_unwind(payload),
            }
        });

        // Every tool and track has completed past this point.
        if let Some(summary) = &batch.coverage {
            tool_results.push(coverage_result(summary));
        }
        let tool_refs: Vec<ToolResultRef> = tool_results
            .iter()
            .map(|result| self.persist_tool_result(result))
            .collect();

        let tier3_test_outcome = if opts.tier.runs_tests() {
            Some(self.merge_track_outcomes(batch.outcomes))
        } else {
            None
        };
        let decision = evaluate(&tool_refs, tier3_test_outcome.as_ref(), opts.strict);
        let run = AuditRun {
            tier: opts.tier,
            strict: opts.strict,
            tool_results: tool_refs,
            tier3_test_outcome,
            overall_pass: decision.overall_pass,
            started_at,
            finished_at: Utc::now(),
        };
        if let Err(err) = self.store.save_result(AUDIT_RUN_TOOL, AUDIT_DOMAIN, &run) {
            warn!(err = %err, "failed to persist audit run");
        }

        let inputs = DocumentInputs {
            run: &run,
            decision: &decision,
            tracks: run.tier3_test_outcome.as_ref(),
            coverage: batch.coverage.as_ref(),
        };
        let documents = self.documents.write_all(&inputs).unwrap_or_else(|err| {
            warn!(err = %err, "failed to write audit documents");
            Vec::new()
        });

        info!(
            overall_pass = decision.overall_pass,
            failing_tools = decision.failing_tools.len(),
            failing_tracks = decision.failing_tracks.len(),
            "audit finished"
        );
        Ok(AuditReport {
            run,
            decision,
            documents,
        })
    }

    /// Run one configured track on its own cadence and merge its outcome into
    /// the recorded outcomes without touching the others.
    #[instrument(skip(self))]
    pub fn run_single_track(&self, name: &str) -> Result<TrackReport, AuditError> {
        let names = [name.to_string()];
        let specs = self.track_specs(Some(names.as_slice()))?;
        let batch = self.run_tracks(&specs);
        if let Some(summary) = &batch.coverage {
            self.persist_tool_result(&coverage_result(summary));
        }
        let outcome = batch
            .outcomes
            .get(name)
            .cloned()
            .ok_or_else(|| AuditError::UnknownTrack(name.to_string()))?;
        let recorded = self.merge_track_outcomes(batch.outcomes);
        Ok(TrackReport {
            name: name.to_string(),
            outcome,
            recorded,
        })
    }

    fn track_specs(&self, selection: Option<&[String]>) -> Result<Vec<TrackSpec>, AuditError> {
        let configured = self.config.tracks.configured();
        if let Some(names) = selection {
            let known: BTreeSet<&str> = configured.iter().map(|(name, _, _)| *name).collect();
            if let Some(unknown) = names.iter().find(|name| !known.contains(name.as_str())) {
                return Err(AuditError::UnknownTrack(unknown.clone()));
            }
        }
        Ok(configured
            .into_iter()
            .filter(|(name, _, _)| {
                selection.is_none_or(|names| names.iter().any(|selected| selected == name))
            })
            .map(|(name, kind, track)| {
                let sharded = kind == TrackKind::Sharded;
                TrackSpec {
                    name: name.to_string(),
                    kind,
                    command: track.command.clone(),
                    shards: if sharded { track.shards } else { 1 },
                    timeout: track.timeout(),
                    coverage_data_file: (sharded && track.coverage)
                        .then(|| self.coverage.settings().data_file.clone()),
                }
            })
            .collect())
    }

    fn run_tools(&self, ctx: &ToolContext, use_cache: bool) -> Vec<ToolResult> {
        self.registry
            .for_tier(ctx.tier)
            .into_iter()
            .map(|analyzer| self.run_analyzer(analyzer, ctx, use_cache))
            .collect()
    }

    #[instrument(skip_all, fields(tool = analyzer.name(), domain = analyzer.domain()))]
    fn run_analyzer(&self, analyzer: &dyn Analyzer, ctx: &ToolContext, use_cache: bool) -> ToolResult {
        let (name, domain) = (analyzer.name(), analyzer.domain());
        let sources = analyzer.sources();
        let mtimes = (!sources.is_empty()).then(|| collect_source_mtimes(&self.project_root, sources));

        if let Some(mtimes) = mtimes.as_ref().filter(|_| use_cache) {
            let cached: Option<CacheEntry<ToolResult>> = self.store.load_cache(name, domain);
            match cached {
                Some(entry) if !is_stale(&entry, mtimes) && !sources_changed(&entry, mtimes) => {
                    info!("cache fresh, reusing result");
                    return entry.data;
                }
                Some(_) => debug!("cache stale, recomputing"),
                None => {}
            }
        }

        let mut result = match panic::catch_unwind(AssertUnwindSafe(|| analyzer.run(ctx))) {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                error!(err = %err, "tool execution error");
                return ToolResult::execution_error(name, domain, &err.to_string());
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(panic = %message, "tool panicked");
                return ToolResult::execution_error(name, domain, &format!("panicked: {message}"));
            }
        };
        result.tool_name = name.to_string();
        result.domain = domain.to_string();

        if let Some(mtimes) = mtimes {
            let entry = CacheEntry::new(mtimes, result.clone());
            if let Err(err) = self.store.save_cache(name, domain, &entry) {
                warn!(err = %err, "failed to save cache");
            }
        }
        result
    }

    fn persist_tool_result(&self, result: &ToolResult) -> ToolResultRef {
        let path = match self
            .store
            .save_result(&result.tool_name, &result.domain, result)
        {
            Ok(path) => Some(
                path.strip_prefix(self.store.root())
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/"),
            ),
            Err(err) => {
                warn!(tool = %result.tool_name, domain = %result.domain, err = %err, "failed to persist tool result");
                None
            }
        };
        ToolResultRef::from_result(result, path)
    }

    /// Execute tracks sequentially and classify each one.
    fn run_tracks(&self, specs: &[TrackSpec]) -> TrackBatch {
        let mut batch = TrackBatch::default();
        for spec in specs {
            let (run, shards) = match self.executor.execute(spec) {
                Ok(execution) => (execution.run, execution.shards),
                Err(err) => {
                    error!(track = %spec.name, err = %err, "track failed to run");
                    (unstarted_run(&spec.name, &err.to_string()), None)
                }
            };
            let mut state = classify_run(&run);
            if let Some(shards) = shards {
                match self.aggregate_coverage(&shards) {
                    Ok(summary) => batch.coverage = Some(summary),
                    Err(err) => {
                        warn!(track = %spec.name, err = %err, "coverage aggregation failed");
                        if !matches!(
                            state,
                            TrackState::Crashed | TrackState::InfraCleanupError | TrackState::Unknown
                        ) {
                            state = TrackState::CoverageFailed;
                        }
                    }
                }
            }
            info!(track = %spec.name, state = state.as_str(), "track classified");
            let outcome = TestTrackOutcome::new(
                state,
                run.return_code,
                run.parsed.counts,
                run.parsed.failed_node_ids,
            );
            batch.outcomes.insert(spec.name.clone(), outcome);
        }
        batch
    }

    fn aggregate_coverage(&self, shards: &ShardSet) -> Result<CoverageSummary, CoverageError> {
        self.coverage.combine(shards)?;
        let report_path = self
            .store
            .root()
            .join(TESTS_DOMAIN)
            .join(JSONS_DIR)
            .join(COVERAGE_REPORT_FILE);
        let report = self.coverage.json_report(&report_path)?;
        if let Err(err) = self.coverage.html_report() {
            warn!(err = %err, "coverage html report failed");
        }
        Ok(CoverageSummary::from_report(&report))
    }

    /// Fold fresh outcomes into the recorded ones, key by key, and persist.
    fn merge_track_outcomes(&self, fresh: TrackOutcomes) -> TrackOutcomes {
        let mut merged = self.recorded_tracks();
        merged.extend(fresh);
        if let Err(err) = self.store.save_result(TRACKS_TOOL, TESTS_DOMAIN, &merged) {
            warn!(err = %err, "failed to persist track outcomes");
        }
        merged
    }
}

/// A timed-out track is a crash regardless of what its output says.
fn classify_run(run: &TrackRun) -> TrackState {
    if run.timed_out {
        return TrackState::Crashed;
    }
    classify(run.return_code, &run.parsed.counts, &run.raw_output)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn unstarted_run(name: &str, message: &str) -> TrackRun {
    TrackRun {
        name: name.to_string(),
        return_code: None,
        timed_out: false,
        raw_output: message.to_string(),
        parsed: Default::default(),
    }
}

fn coverage_result(summary: &CoverageSummary) -> ToolResult {
    let critical = summary.categories.critical.len() as u64;
    ToolResult::new(
        COVERAGE_TOOL,
        TESTS_DOMAIN,
        ToolSummary {
            total_issues: critical,
            files_affected: critical,
            status: summary.status(),
        },
        serde_json::to_value(summary).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TestCounts;
    use crate::test_support::track_run;

    #[test]
    fn timeout_classifies_as_crash() {
        let mut run = track_run("serial", Some(0), TestCounts { passed: 3, ..Default::default() });
        assert_eq!(classify_run(&run), TrackState::Passed);
        run.timed_out = true;
        assert_eq!(classify_run(&run), TrackState::Crashed);
    }

    #[test]
    fn unstarted_track_is_unknown() {
        let run = unstarted_run("serial", "failed to spawn python: not found");
        assert_eq!(classify_run(&run), TrackState::Unknown);
    }
}
