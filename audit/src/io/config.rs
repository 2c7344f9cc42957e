//! Audit configuration stored in `audit.toml` at the project root.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{DEV_TOOLS_TRACK, PARALLEL_TRACK, SERIAL_TRACK, Tier, TrackKind};
use crate::error::ConfigError;
use crate::io::archive::{DEFAULT_REPORT_VERSIONS, DEFAULT_RESULT_VERSIONS, env_disables_archive};
use crate::orchestrator::is_reserved_result_key;

pub const CONFIG_FILE: &str = "audit.toml";

/// Audit configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values used
/// by the suite's own repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory (relative to the project root) holding every domain's artifacts.
    pub toolsuite_root: PathBuf,

    /// Archived versions kept per tool result.
    pub result_max_versions: usize,

    /// Archived versions kept per generated document.
    pub report_max_versions: usize,

    /// Master switch for archive rotation. `AUDIT_NO_ARCHIVE` overrides it.
    pub archive: bool,

    /// Truncate captured stdout/stderr beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    /// External file supplying coverage `data_file` and HTML directory.
    pub coverage_config: PathBuf,

    /// Command prefix for the coverage tool (`combine`, `json`, `html` are appended).
    pub coverage_command: Vec<String>,

    /// Timeout for each coverage tool invocation.
    pub coverage_timeout_secs: u64,

    pub tools: Vec<ToolConfig>,

    pub tracks: TracksConfig,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            toolsuite_root: PathBuf::from("quality"),
            result_max_versions: DEFAULT_RESULT_VERSIONS,
            report_max_versions: DEFAULT_REPORT_VERSIONS,
            archive: true,
            output_limit_bytes: 1_000_000,
            coverage_config: PathBuf::from("pyproject.toml"),
            coverage_command: vec![
                "python".to_string(),
                "-m".to_string(),
                "coverage".to_string(),
            ],
            coverage_timeout_secs: 10 * 60,
            tools: Vec::new(),
            tracks: TracksConfig::default(),
        }
    }
}

/// An external analyzer registered under `[[tools]]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolConfig {
    pub name: String,
    pub domain: String,
    #[serde(default = "default_tool_tier")]
    pub tier: Tier,
    pub command: Vec<String>,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Files or directories whose mtimes key the cached result.
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    /// Opaque options handed to the tool as JSON.
    #[serde(default)]
    pub options: toml::Table,
}

fn default_tool_tier() -> Tier {
    Tier::Standard
}

fn default_tool_timeout_secs() -> u64 {
    5 * 60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TracksConfig {
    pub parallel: Option<TrackConfig>,
    pub serial: Option<TrackConfig>,
    pub dev_tools: Option<TrackConfig>,
}

impl TracksConfig {
    /// Configured tracks in execution order with their names and shapes.
    pub fn configured(&self) -> Vec<(&'static str, TrackKind, &TrackConfig)> {
        [
            (PARALLEL_TRACK, TrackKind::Sharded, self.parallel.as_ref()),
            (SERIAL_TRACK, TrackKind::Serial, self.serial.as_ref()),
            (DEV_TOOLS_TRACK, TrackKind::Secondary, self.dev_tools.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, kind, cfg)| cfg.map(|cfg| (name, kind, cfg)))
        .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackConfig {
    pub command: Vec<String>,
    /// Worker processes for the sharded track; ignored elsewhere.
    pub shards: u32,
    pub timeout_secs: u64,
    /// Collect and combine coverage shards (sharded track only).
    pub coverage: bool,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            command: vec!["python".to_string(), "-m".to_string(), "pytest".to_string()],
            shards: 4,
            timeout_secs: 30 * 60,
            coverage: true,
        }
    }
}

impl TrackConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AuditConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.result_max_versions == 0 {
            return Err(invalid("result_max_versions must be > 0"));
        }
        if self.report_max_versions == 0 {
            return Err(invalid("report_max_versions must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(invalid("output_limit_bytes must be > 0"));
        }
        if self.coverage_timeout_secs == 0 {
            return Err(invalid("coverage_timeout_secs must be > 0"));
        }
        if !is_runnable(&self.coverage_command) {
            return Err(invalid("coverage_command must be a non-empty array"));
        }
        for tool in &self.tools {
            if tool.name.trim().is_empty() || tool.domain.trim().is_empty() {
                return Err(invalid("tools entries need a name and a domain"));
            }
            if is_reserved_result_key(&tool.name, &tool.domain) {
                return Err(ConfigError::Invalid(format!(
                    "tools entry {}/{} is reserved for audit records",
                    tool.domain, tool.name
                )));
            }
            if !is_runnable(&tool.command) {
                return Err(ConfigError::Invalid(format!(
                    "tools.{}.command must be a non-empty array",
                    tool.name
                )));
            }
            if tool.timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tools.{}.timeout_secs must be > 0",
                    tool.name
                )));
            }
        }
        for (name, kind, track) in self.tracks.configured() {
            if !is_runnable(&track.command) {
                return Err(ConfigError::Invalid(format!(
                    "tracks.{name}.command must be a non-empty array"
                )));
            }
            if track.timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tracks.{name}.timeout_secs must be > 0"
                )));
            }
            if kind == TrackKind::Sharded && track.shards == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tracks.{name}.shards must be > 0"
                )));
            }
        }
        Ok(())
    }

    pub fn toolsuite_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.toolsuite_root)
    }

    pub fn coverage_timeout(&self) -> Duration {
        Duration::from_secs(self.coverage_timeout_secs)
    }

    /// Resolve the rotation switch against the `AUDIT_NO_ARCHIVE` value.
    pub fn archive_enabled(&self, no_archive_env: Option<&str>) -> bool {
        self.archive && !env_disables_archive(no_archive_env)
    }
}

fn is_runnable(command: &[String]) -> bool {
    command.first().is_some_and(|program| !program.trim().is_empty())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AuditConfig::default()`.
pub fn load_config(path: &Path) -> Result<AuditConfig, ConfigError> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = AuditConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: AuditConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}
