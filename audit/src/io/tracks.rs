//! Test Track Runner: executes one test-suite invocation per track.
//!
//! The runner spawns processes, captures their output, and parses it into raw
//! counts. It makes no pass/fail judgment; the orchestrator hands every
//! [`TrackRun`] to the classifier unchanged.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::classifier::is_abnormal_termination;
use crate::core::test_output::{ParsedTestOutput, parse_test_output};
use crate::core::types::TrackKind;
use crate::error::ProcessError;
use crate::io::process::{CommandSpec, run_command_with_timeout};

pub const SHARD_INDEX_ENV: &str = "AUDIT_SHARD_INDEX";
pub const SHARD_COUNT_ENV: &str = "AUDIT_SHARD_COUNT";
pub const COVERAGE_FILE_ENV: &str = "COVERAGE_FILE";

/// Everything needed to execute one track.
#[derive(Debug, Clone)]
pub struct TrackSpec {
    pub name: String,
    pub kind: TrackKind,
    pub command: Vec<String>,
    /// Worker processes; always 1 for serial and secondary tracks.
    pub shards: u32,
    pub timeout: Duration,
    /// Base coverage data file; shards write `<data_file>.shard<i>`.
    pub coverage_data_file: Option<PathBuf>,
}

/// Raw result of a track, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRun {
    pub name: String,
    pub return_code: Option<i64>,
    /// Any worker exceeded the wall-clock timeout and was killed.
    pub timed_out: bool,
    pub raw_output: String,
    pub parsed: ParsedTestOutput,
}

/// Coverage shard files of a track whose worker processes have all exited.
///
/// Only the track runner creates this after joining every shard, so holding one
/// is proof that the combine barrier has been reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSet {
    data_files: Vec<PathBuf>,
}

impl ShardSet {
    pub(crate) fn completed(data_files: Vec<PathBuf>) -> Self {
        Self { data_files }
    }

    /// Build a shard set for tests that stage coverage files by hand.
    #[cfg(any(test, feature = "test-support"))]
    pub fn from_completed_files(data_files: Vec<PathBuf>) -> Self {
        Self::completed(data_files)
    }

    pub fn data_files(&self) -> &[PathBuf] {
        &self.data_files
    }
}

/// A track's run plus its coverage shards (sharded tracks with coverage only).
#[derive(Debug, Clone)]
pub struct TrackExecution {
    pub run: TrackRun,
    pub shards: Option<ShardSet>,
}

/// Abstraction over track execution backends.
///
/// Tests use scripted executors that return predetermined runs without
/// spawning processes.
pub trait TrackExecutor: Sync {
    fn execute(&self, spec: &TrackSpec) -> Result<TrackExecution, ProcessError>;
}

impl<T: TrackExecutor + ?Sized> TrackExecutor for &T {
    fn execute(&self, spec: &TrackSpec) -> Result<TrackExecution, ProcessError> {
        (**self).execute(spec)
    }
}

/// Executor that spawns the configured test command as OS processes.
#[derive(Debug, Clone)]
pub struct ProcessTrackExecutor {
    project_root: PathBuf,
    output_limit_bytes: usize,
}

impl ProcessTrackExecutor {
    pub fn new(project_root: impl Into<PathBuf>, output_limit_bytes: usize) -> Self {
        Self {
            project_root: project_root.into(),
            output_limit_bytes,
        }
    }

    fn run_shard(
        &self,
        spec: &TrackSpec,
        index: u32,
        data_file: Option<&Path>,
    ) -> Result<ShardRun, ProcessError> {
        let mut env = BTreeMap::new();
        if spec.kind == TrackKind::Sharded {
            env.insert(SHARD_INDEX_ENV.to_string(), index.to_string());
            env.insert(SHARD_COUNT_ENV.to_string(), spec.shards.to_string());
        }
        if let Some(data_file) = data_file {
            env.insert(
                COVERAGE_FILE_ENV.to_string(),
                data_file.display().to_string(),
            );
        }
        let output = run_command_with_timeout(&CommandSpec {
            argv: &spec.command,
            cwd: &self.project_root,
            env,
            timeout: spec.timeout,
            output_limit_bytes: self.output_limit_bytes,
        })?;
        Ok(ShardRun {
            return_code: output.return_code(),
            timed_out: output.timed_out,
            output: output.combined_output(),
        })
    }
}

struct ShardRun {
    return_code: Option<i64>,
    timed_out: bool,
    output: String,
}

impl TrackExecutor for ProcessTrackExecutor {
    #[instrument(skip_all, fields(track = %spec.name, kind = ?spec.kind, shards = spec.shards))]
    fn execute(&self, spec: &TrackSpec) -> Result<TrackExecution, ProcessError> {
        let workers = if spec.kind == TrackKind::Sharded {
            spec.shards.max(1)
        } else {
            1
        };
        let data_files: Vec<Option<PathBuf>> = (0..workers)
            .map(|index| {
                spec.coverage_data_file
                    .as_deref()
                    .filter(|_| spec.kind == TrackKind::Sharded)
                    .map(|base| shard_data_file(base, index))
            })
            .collect();
        for data_file in data_files.iter().flatten() {
            remove_stale_shard(data_file);
        }

        info!(workers, "track started");
        // One OS process per shard; the scope joins every worker before returning.
        let results: Vec<Result<ShardRun, ProcessError>> = thread::scope(|scope| {
            let handles: Vec<_> = data_files
                .iter()
                .enumerate()
                .map(|(index, data_file)| {
                    let index = index as u32;
                    scope.spawn(move || self.run_shard(spec, index, data_file.as_deref()))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(Err(ProcessError::WorkerPanicked)))
                .collect()
        });

        let shard_runs = started_shard_runs(results)?;
        let run = merge_shard_runs(&spec.name, spec.kind, shard_runs);
        info!(return_code = ?run.return_code, timed_out = run.timed_out, "track finished");

        let shards = if spec.kind == TrackKind::Sharded && spec.coverage_data_file.is_some() {
            Some(ShardSet::completed(data_files.into_iter().flatten().collect()))
        } else {
            None
        };
        Ok(TrackExecution { run, shards })
    }
}

/// Coverage data file for shard `index` of a track whose base file is `base`.
pub fn shard_data_file(base: &Path, index: u32) -> PathBuf {
    let name = base
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".coverage".to_string());
    base.with_file_name(format!("{name}.shard{index}"))
}

fn remove_stale_shard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale coverage shard"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), err = %err, "failed to remove stale coverage shard"),
    }
}

/// Replace shards that never started with code-less runs carrying the error.
/// Fails only when no shard started at all.
fn started_shard_runs(
    results: Vec<Result<ShardRun, ProcessError>>,
) -> Result<Vec<ShardRun>, ProcessError> {
    if !results.iter().any(Result::is_ok) {
        return match results.into_iter().find_map(Result::err) {
            Some(err) => Err(err),
            None => Ok(Vec::new()),
        };
    }
    Ok(results
        .into_iter()
        .enumerate()
        .map(|(index, result)| {
            result.unwrap_or_else(|err| {
                warn!(shard = index, err = %err, "shard failed to start");
                ShardRun {
                    return_code: None,
                    timed_out: false,
                    output: format!("shard {index} failed to start: {err}\n"),
                }
            })
        })
        .collect())
}

fn merge_shard_runs(name: &str, kind: TrackKind, shard_runs: Vec<ShardRun>) -> TrackRun {
    let mut parsed = ParsedTestOutput::default();
    let mut raw_output = String::new();
    let sharded = kind == TrackKind::Sharded;
    for (index, shard) in shard_runs.iter().enumerate() {
        parsed.merge(parse_test_output(&shard.output));
        if sharded {
            raw_output.push_str(&format!("=== shard {index} ===\n"));
        }
        raw_output.push_str(&shard.output);
        if !raw_output.ends_with('\n') {
            raw_output.push('\n');
        }
    }

    TrackRun {
        name: name.to_string(),
        return_code: merge_return_codes(shard_runs.iter().map(|shard| shard.return_code)),
        timed_out: shard_runs.iter().any(|shard| shard.timed_out),
        raw_output,
        parsed,
    }
}

/// The most severe code across shards: abnormal termination, then the first
/// non-zero code, then a missing code, then success.
pub fn merge_return_codes(codes: impl IntoIterator<Item = Option<i64>>) -> Option<i64> {
    let codes: Vec<Option<i64>> = codes.into_iter().collect();
    if let Some(code) = codes.iter().flatten().find(|code| is_abnormal_termination(**code)) {
        return Some(*code);
    }
    if let Some(code) = codes.iter().flatten().find(|code| **code != 0) {
        return Some(*code);
    }
    if codes.iter().any(Option::is_none) {
        return None;
    }
    Some(0)
}
