//! Typed errors for the audit subsystems.
//!
//! Each component returns its own error enum; [`AuditError`] wraps them for
//! callers that need a single type. The orchestrator decides per call whether a
//! failure is contained (logged, default substituted) or escalated.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the artifact store and archive rotator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid artifact name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from spawning and supervising child processes.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("failed to terminate process group after timeout: {0}")]
    Kill(#[source] std::io::Error),

    #[error("{0} was not piped")]
    MissingPipe(&'static str),

    #[error("output reader failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("output reader thread panicked")]
    ReaderPanicked,

    #[error("shard worker thread panicked")]
    WorkerPanicked,
}

/// Errors from loading or validating configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors from coverage combination and report parsing.
#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("no shard coverage data files were produced")]
    NoShardData,

    #[error("only {present} of {expected} coverage shard data files were produced")]
    MissingShards { present: usize, expected: usize },

    #[error("coverage {step} exited with {return_code:?}: {output}")]
    CommandFailed {
        step: &'static str,
        return_code: Option<i64>,
        output: String,
    },

    #[error("coverage {step} timed out")]
    TimedOut { step: &'static str },

    #[error("failed to read coverage report {path}: {source}")]
    ReadReport {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse coverage report: {0}")]
    Parse(#[source] serde_json::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Errors raised by analyzers and the tool registry.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool {name} failed: {message}")]
    Failed { name: String, message: String },

    #[error("tool {name} produced an invalid result: {message}")]
    InvalidResult { name: String, message: String },

    #[error("tool {name} in domain {domain} is registered twice")]
    Duplicate { name: String, domain: String },

    #[error("tool {name} in domain {domain} would overwrite an audit record")]
    Reserved { name: String, domain: String },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Crate-level error wrapping every subsystem error.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Coverage(#[from] CoverageError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("unknown track {0:?}")]
    UnknownTrack(String),

    #[error("failed to render {document}: {source}")]
    Render {
        document: &'static str,
        #[source]
        source: minijinja::Error,
    },
}
