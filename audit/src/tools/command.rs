//! Analyzers implemented as external programs.
//!
//! The program runs in the project root with `AUDIT_PROJECT_ROOT` and
//! `AUDIT_TOOL_CONFIG` (the tool's `options` as JSON) in its environment and
//! must print a single ToolResult document on stdout.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use jsonschema::Validator;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::types::{Tier, ToolResult, ToolSummary};
use crate::error::ToolError;
use crate::io::config::ToolConfig;
use crate::io::process::{CommandSpec, run_command_with_timeout};
use crate::tools::{Analyzer, ToolContext};

pub const PROJECT_ROOT_ENV: &str = "AUDIT_PROJECT_ROOT";
pub const TOOL_CONFIG_ENV: &str = "AUDIT_TOOL_CONFIG";

const TOOL_RESULT_SCHEMA: &str = include_str!("../../schemas/tool_result.schema.json");

static TOOL_RESULT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(TOOL_RESULT_SCHEMA).expect("bundled schema is valid JSON");
    jsonschema::validator_for(&schema).expect("bundled schema compiles")
});

#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    name: String,
    domain: String,
    min_tier: Tier,
    command: Vec<String>,
    timeout: Duration,
    sources: Vec<PathBuf>,
    options: Value,
}

impl CommandAnalyzer {
    pub fn from_config(cfg: &ToolConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            domain: cfg.domain.clone(),
            min_tier: cfg.tier,
            command: cfg.command.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            sources: cfg.sources.clone(),
            options: serde_json::to_value(&cfg.options).unwrap_or(Value::Null),
        }
    }

    fn failed(&self, message: impl Into<String>) -> ToolError {
        ToolError::Failed {
            name: self.name.clone(),
            message: message.into(),
        }
    }

    fn invalid(&self, message: impl Into<String>) -> ToolError {
        ToolError::InvalidResult {
            name: self.name.clone(),
            message: message.into(),
        }
    }

    /// Validate stdout against the bundled schema and pin the identity fields.
    fn parse_result(&self, stdout: &str) -> Result<ToolResult, ToolError> {
        let value: Value = serde_json::from_str(stdout.trim())
            .map_err(|err| self.invalid(format!("stdout is not JSON: {err}")))?;
        if !TOOL_RESULT_VALIDATOR.is_valid(&value) {
            let messages = TOOL_RESULT_VALIDATOR
                .iter_errors(&value)
                .map(|err| err.to_string())
                .collect::<Vec<_>>();
            return Err(self.invalid(messages.join("; ")));
        }
        let reported: ReportedResult = serde_json::from_value(value)
            .map_err(|err| self.invalid(err.to_string()))?;
        if reported.tool_name.as_deref().is_some_and(|name| name != self.name) {
            warn!(tool = %self.name, reported = ?reported.tool_name, "tool reported a different name");
        }
        Ok(ToolResult {
            tool_name: self.name.clone(),
            domain: self.domain.clone(),
            summary: reported.summary,
            details: reported.details,
            generated_at: Utc::now(),
        })
    }
}

#[derive(Deserialize)]
struct ReportedResult {
    #[serde(default)]
    tool_name: Option<String>,
    summary: ToolSummary,
    #[serde(default)]
    details: Value,
}

impl Analyzer for CommandAnalyzer {
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

    #[instrument(skip_all, fields(tool = %self.name, domain = %self.domain))]
    fn run(&self, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let mut env = BTreeMap::new();
        env.insert(
            PROJECT_ROOT_ENV.to_string(),
            ctx.project_root.display().to_string(),
        );
        env.insert(TOOL_CONFIG_ENV.to_string(), self.options.to_string());
        let output = run_command_with_timeout(&CommandSpec {
            argv: &self.command,
            cwd: &ctx.project_root,
            env,
            timeout: self.timeout,
            output_limit_bytes: ctx.output_limit_bytes,
        })?;
        if output.timed_out {
            return Err(self.failed(format!("timed out after {}s", self.timeout.as_secs())));
        }
        if output.stdout.truncated > 0 {
            return Err(self.invalid("stdout exceeded the output limit"));
        }
        let stdout = String::from_utf8_lossy(&output.stdout.bytes);
        let result = self.parse_result(&stdout).map_err(|err| {
            if output.status.success() {
                err
            } else {
                self.failed(format!(
                    "exited with {:?}: {}",
                    output.return_code(),
                    output.combined_output().trim()
                ))
            }
        })?;
        info!(status = result.summary.status.as_str(), "tool finished");
        Ok(result)
    }
}
