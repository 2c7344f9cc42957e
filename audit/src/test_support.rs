//! Scripted fakes for exercising the orchestrator without real processes.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use tempfile::TempDir;

use crate::core::test_output::ParsedTestOutput;
use crate::core::types::{TestCounts, Tier, ToolResult, ToolStatus, ToolSummary};
use crate::error::{ProcessError, ToolError};
use crate::io::config::CONFIG_FILE;
use crate::io::tracks::{ShardSet, TrackExecution, TrackExecutor, TrackRun, TrackSpec};
use crate::tools::{Analyzer, ToolContext};

/// Temporary project root containing `audit.toml` with `config`.
pub fn project(config: &str) -> std::io::Result<TempDir> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join(CONFIG_FILE), config)?;
    Ok(dir)
}

/// Build a raw track run with the given exit code and counts.
pub fn track_run(name: &str, return_code: Option<i64>, counts: TestCounts) -> TrackRun {
    TrackRun {
        name: name.to_string(),
        return_code,
        timed_out: false,
        raw_output: String::new(),
        parsed: ParsedTestOutput {
            counts,
            failed_node_ids: Vec::new(),
        },
    }
}

pub fn passed(count: u32) -> TestCounts {
    TestCounts {
        passed: count,
        ..TestCounts::default()
    }
}

pub fn failed(passed: u32, failed: u32) -> TestCounts {
    TestCounts {
        passed,
        failed,
        ..TestCounts::default()
    }
}

enum Script {
    Run {
        run: TrackRun,
        shard_files: Option<Vec<PathBuf>>,
    },
    SpawnError(String),
}

/// Track executor that replays scripted runs keyed by track name.
///
/// Unscripted tracks fail to spawn.
#[derive(Default)]
pub struct ScriptedTrackExecutor {
    scripts: BTreeMap<String, Script>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTrackExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run(mut self, run: TrackRun) -> Self {
        self.scripts.insert(
            run.name.clone(),
            Script::Run {
                run,
                shard_files: None,
            },
        );
        self
    }

    /// Script a sharded run whose coverage shards are `shard_files`.
    pub fn with_sharded_run(mut self, run: TrackRun, shard_files: Vec<PathBuf>) -> Self {
        self.scripts.insert(
            run.name.clone(),
            Script::Run {
                run,
                shard_files: Some(shard_files),
            },
        );
        self
    }

    pub fn with_spawn_error(mut self, name: &str, message: &str) -> Self {
        self.scripts
            .insert(name.to_string(), Script::SpawnError(message.to_string()));
        self
    }

    /// Track names in execution order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

impl TrackExecutor for ScriptedTrackExecutor {
    fn execute(&self, spec: &TrackSpec) -> Result<TrackExecution, ProcessError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.name.clone());
        }
        match self.scripts.get(&spec.name) {
            Some(Script::Run { run, shard_files }) => Ok(TrackExecution {
                run: run.clone(),
                shards: shard_files.clone().map(ShardSet::from_completed_files),
            }),
            Some(Script::SpawnError(message)) => Err(ProcessError::Spawn {
                program: spec.command.first().cloned().unwrap_or_default(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, message.clone()),
            }),
            None => Err(ProcessError::EmptyCommand),
        }
    }
}

/// Analyzer returning a fixed status, counting its invocations.
pub struct StaticAnalyzer {
    name: String,
    domain: String,
    min_tier: Tier,
    status: ToolStatus,
    sources: Vec<PathBuf>,
    error: Option<String>,
    panic: Option<String>,
    runs: Arc<AtomicUsize>,
}

impl StaticAnalyzer {
    pub fn new(name: &str, domain: &str, min_tier: Tier, status: ToolStatus) -> Self {
        Self {
            name: name.to_string(),
            domain: domain.to_string(),
            min_tier,
            status,
            sources: Vec::new(),
            error: None,
            panic: None,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_sources(mut self, sources: Vec<PathBuf>) -> Self {
        self.sources = sources;
        self
    }

    /// Make every run fail with `message`.
    pub fn failing(mut self, message: &str) -> Self {
        self.error = Some(message.to_string());
        self
    }

    /// Make every run panic with `message`.
    pub fn panicking(mut self, message: &str) -> Self {
        self.panic = Some(message.to_string());
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Shared invocation counter that stays readable after the analyzer is boxed.
    pub fn run_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.runs)
    }
}

impl Analyzer for StaticAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    fn domain(&self) -> &str {
        &self.domain
    }

    fn min_tier(&self) -> Tier {
        self.min_tier
    }

    fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    fn run(&self, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(message) = &self.panic {
            panic!("{message}");
        }
        if let Some(message) = &self.error {
            return Err(ToolError::Failed {
                name: self.name.clone(),
                message: message.clone(),
            });
        }
        let issues = u64::from(matches!(self.status, ToolStatus::Warn | ToolStatus::Fail));
        Ok(ToolResult::new(
            &self.name,
            &self.domain,
            ToolSummary {
                total_issues: issues,
                files_affected: issues,
                status: self.status,
            },
            json!({ "run": run, "tier": ctx.tier.as_str() }),
        ))
    }
}
