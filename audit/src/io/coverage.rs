//! Coverage Aggregator: combines shard data files and produces reports.
//!
//! Paths come from the project's coverage configuration, never hard-coded.
//! Combination accepts only a [`ShardSet`], which the track runner hands out
//! after every shard process of the track has exited.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::coverage::{self, CoverageReport};
use crate::error::{ConfigError, CoverageError};
use crate::io::process::{CommandSpec, run_command_with_timeout};
use crate::io::tracks::ShardSet;

pub const DEFAULT_DATA_FILE: &str = ".coverage";
pub const DEFAULT_HTML_DIR: &str = "htmlcov";

/// Where the coverage tool keeps its data and writes HTML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageSettings {
    pub data_file: PathBuf,
    pub html_dir: PathBuf,
}

impl CoverageSettings {
    pub fn defaults(project_root: &Path) -> Self {
        Self {
            data_file: project_root.join(DEFAULT_DATA_FILE),
            html_dir: project_root.join(DEFAULT_HTML_DIR),
        }
    }
}

/// Read coverage settings from `config_path`.
///
/// Understands the `pyproject.toml` layout (`[tool.coverage.run]`,
/// `[tool.coverage.html]`) and a standalone file with top-level `[run]` and
/// `[html]` tables. A missing file yields the defaults.
pub fn load_coverage_settings(
    project_root: &Path,
    config_path: &Path,
) -> Result<CoverageSettings, ConfigError> {
    let config_path = project_root.join(config_path);
    let mut settings = CoverageSettings::defaults(project_root);
    if !config_path.exists() {
        debug!(path = %config_path.display(), "coverage config missing, using defaults");
        return Ok(settings);
    }
    let contents = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    let table: toml::Table = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: config_path.clone(),
        source,
    })?;

    let section = table
        .get("tool")
        .and_then(|tool| tool.get("coverage"))
        .and_then(toml::Value::as_table)
        .unwrap_or(&table);
    let setting = |group: &str, key: &str| -> Result<Option<PathBuf>, ConfigError> {
        match section.get(group).and_then(|values| values.get(key)) {
            None => Ok(None),
            Some(toml::Value::String(value)) => Ok(Some(project_root.join(value))),
            Some(_) => Err(ConfigError::Invalid(format!(
                "coverage {group}.{key} must be a string"
            ))),
        }
    };
    if let Some(data_file) = setting("run", "data_file")? {
        settings.data_file = data_file;
    }
    if let Some(html_dir) = setting("html", "directory")? {
        settings.html_dir = html_dir;
    }
    Ok(settings)
}

/// Drives the external coverage tool (`combine`, `json`, `html`).
#[derive(Debug, Clone)]
pub struct CoverageAggregator {
    project_root: PathBuf,
    command: Vec<String>,
    settings: CoverageSettings,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CoverageAggregator {
    pub fn new(
        project_root: impl Into<PathBuf>,
        command: Vec<String>,
        settings: CoverageSettings,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            command,
            settings,
            timeout,
            output_limit_bytes,
        }
    }

    pub fn settings(&self) -> &CoverageSettings {
        &self.settings
    }

    /// Merge every shard data file into the configured data file.
    ///
    /// Every shard must have produced its file; a partial set is an error and
    /// its files are removed rather than combined. Shard files are deleted once
    /// combination succeeds.
    #[instrument(skip_all, fields(shards = shards.data_files().len()))]
    pub fn combine(&self, shards: &ShardSet) -> Result<PathBuf, CoverageError> {
        let expected = shards.data_files().len();
        let present: Vec<&PathBuf> = shards
            .data_files()
            .iter()
            .filter(|file| file.is_file())
            .collect();
        if present.is_empty() {
            return Err(CoverageError::NoShardData);
        }
        if present.len() < expected {
            warn!(present = present.len(), expected, "coverage shards missing, discarding partial data");
            remove_shard_files(&present);
            return Err(CoverageError::MissingShards {
                present: present.len(),
                expected,
            });
        }

        let mut args = vec![
            "combine".to_string(),
            format!("--data-file={}", self.settings.data_file.display()),
        ];
        args.extend(present.iter().map(|file| file.display().to_string()));
        self.run_step("combine", args)?;

        remove_shard_files(&present);
        info!(data_file = %self.settings.data_file.display(), "coverage combined");
        Ok(self.settings.data_file.clone())
    }

    /// Export the combined data as JSON to `output` and parse it.
    #[instrument(skip_all, fields(output = %output.display()))]
    pub fn json_report(&self, output: &Path) -> Result<CoverageReport, CoverageError> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(|source| CoverageError::ReadReport {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        self.run_step(
            "json",
            vec![
                "json".to_string(),
                format!("--data-file={}", self.settings.data_file.display()),
                "-o".to_string(),
                output.display().to_string(),
            ],
        )?;
        let contents = fs::read_to_string(output).map_err(|source| CoverageError::ReadReport {
            path: output.to_path_buf(),
            source,
        })?;
        coverage::parse(&contents)
    }

    /// Render the HTML report into the configured directory.
    pub fn html_report(&self) -> Result<PathBuf, CoverageError> {
        self.run_step(
            "html",
            vec![
                "html".to_string(),
                format!("--data-file={}", self.settings.data_file.display()),
                "-d".to_string(),
                self.settings.html_dir.display().to_string(),
            ],
        )?;
        Ok(self.settings.html_dir.clone())
    }

    fn run_step(&self, step: &'static str, args: Vec<String>) -> Result<(), CoverageError> {
        let mut argv = self.command.clone();
        argv.extend(args);
        debug!(step, argv = ?argv, "running coverage step");
        let output = run_command_with_timeout(&CommandSpec {
            argv: &argv,
            cwd: &self.project_root,
            env: Default::default(),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        })?;
        if output.timed_out {
            return Err(CoverageError::TimedOut { step });
        }
        if !output.status.success() {
            return Err(CoverageError::CommandFailed {
                step,
                return_code: output.return_code(),
                output: output.combined_output(),
            });
        }
        Ok(())
    }
}

fn remove_shard_files(files: &[&PathBuf]) {
    for file in files {
        match fs::remove_file(file) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %file.display(), err = %err, "failed to delete coverage shard");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_default_when_config_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings =
            load_coverage_settings(temp.path(), Path::new("pyproject.toml")).expect("settings");
        assert_eq!(settings, CoverageSettings::defaults(temp.path()));
    }

    #[test]
    fn settings_read_from_pyproject_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("pyproject.toml"),
            r#"
[project]
name = "demo"

[tool.coverage.run]
data_file = "build/.coverage"

[tool.coverage.html]
directory = "build/html"
"#,
        )
        .expect("write");
        let settings =
            load_coverage_settings(temp.path(), Path::new("pyproject.toml")).expect("settings");
        assert_eq!(settings.data_file, temp.path().join("build/.coverage"));
        assert_eq!(settings.html_dir, temp.path().join("build/html"));
    }

    #[test]
    fn settings_read_from_top_level_tables() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("coverage.toml"),
            "[run]\ndata_file = \"cov/data\"\n",
        )
        .expect("write");
        let settings =
            load_coverage_settings(temp.path(), Path::new("coverage.toml")).expect("settings");
        assert_eq!(settings.data_file, temp.path().join("cov/data"));
        assert_eq!(settings.html_dir, temp.path().join(DEFAULT_HTML_DIR));
    }

    #[test]
    fn combine_without_shard_files_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let aggregator = CoverageAggregator::new(
            temp.path(),
            vec!["true".to_string()],
            CoverageSettings::defaults(temp.path()),
            Duration::from_secs(5),
            10_000,
        );
        let shards = ShardSet::from_completed_files(vec![temp.path().join(".coverage.shard0")]);
        assert!(matches!(
            aggregator.combine(&shards),
            Err(CoverageError::NoShardData)
        ));
    }

    #[test]
    fn combine_with_a_missing_shard_fails_and_discards_the_rest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let aggregator = CoverageAggregator::new(
            temp.path(),
            vec!["true".to_string()],
            CoverageSettings::defaults(temp.path()),
            Duration::from_secs(5),
            10_000,
        );
        let present = temp.path().join(".coverage.shard0");
        fs::write(&present, b"data").expect("write shard");
        let shards = ShardSet::from_completed_files(vec![
            present.clone(),
            temp.path().join(".coverage.shard1"),
        ]);
        assert!(matches!(
            aggregator.combine(&shards),
            Err(CoverageError::MissingShards { present: 1, expected: 2 })
        ));
        assert!(!present.exists());
        assert!(!temp.path().join(DEFAULT_DATA_FILE).exists());
    }

    #[cfg(unix)]
    fn fake_coverage(dir: &Path, script: &str) -> Vec<String> {
        let path = dir.join("fake_coverage.sh");
        fs::write(&path, script).expect("write script");
        vec!["sh".to_string(), path.display().to_string()]
    }

    #[cfg(unix)]
    #[test]
    fn combine_deletes_shards_and_json_report_parses() {
        let temp = tempfile::tempdir().expect("tempdir");
        let command = fake_coverage(
            temp.path(),
            r#"case "$1" in
combine) : > "${2#--data-file=}" ;;
json) printf '%s' '{"files":{"pkg/a.py":{"summary":{"num_statements":10,"missing_lines":1},"missing_lines":[4]}}}' > "$4" ;;
*) exit 3 ;;
esac
"#,
        );
        let aggregator = CoverageAggregator::new(
            temp.path(),
            command,
            CoverageSettings::defaults(temp.path()),
            Duration::from_secs(10),
            10_000,
        );
        let shard_files: Vec<PathBuf> = (0..2)
            .map(|index| temp.path().join(format!(".coverage.shard{index}")))
            .collect();
        for file in &shard_files {
            fs::write(file, b"data").expect("write shard");
        }

        let combined = aggregator
            .combine(&ShardSet::from_completed_files(shard_files.clone()))
            .expect("combine");
        assert!(combined.exists());
        assert!(shard_files.iter().all(|file| !file.exists()));

        let report = aggregator
            .json_report(&temp.path().join("out/report.json"))
            .expect("report");
        assert_eq!(report.overall.total_statements, 10);
        assert_eq!(report.per_file["pkg/a.py"].missing_lines, vec![4]);

        assert!(matches!(
            aggregator.html_report(),
            Err(CoverageError::CommandFailed { step: "html", return_code: Some(3), .. })
        ));
    }
}
