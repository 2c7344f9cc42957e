//! Audit CLI.
//!
//! Runs tiered audits, standalone test tracks, and inspects recorded results
//! under the configured toolsuite root.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use audit::core::types::Tier;
use audit::exit_codes;
use audit::io::archive::{NO_ARCHIVE_ENV, archived_versions};
use audit::io::config::{AuditConfig, CONFIG_FILE, load_config};
use audit::io::tracks::ProcessTrackExecutor;
use audit::logging;
use audit::orchestrator::{AuditOptions, Auditor};
use audit::tools::registry_from_config;

#[derive(Parser)]
#[command(name = "audit", version, about = "Tiered code-quality audit orchestrator")]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Configuration file, relative to the project root.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run analyzers for a tier (and, for `full`, every test track) and gate the result.
    Run {
        #[arg(long, default_value_t = Tier::Standard)]
        tier: Tier,
        /// Also fail on any track whose state is not `passed`.
        #[arg(long)]
        strict: bool,
        /// Comma-separated subset of tracks to run at the full tier.
        #[arg(long, value_delimiter = ',')]
        tracks: Option<Vec<String>>,
        /// Ignore analyzer caches.
        #[arg(long)]
        no_cache: bool,
    },
    /// Run a single test track and merge its outcome into the recorded ones.
    Track { name: String },
    /// Print the last recorded audit run.
    Status,
    /// List archived versions of an artifact, oldest first.
    History { path: PathBuf },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    match cli.command {
        Command::Run {
            tier,
            strict,
            tracks,
            no_cache,
        } => cmd_run(
            &root,
            &cli.config,
            &AuditOptions {
                tier,
                strict,
                tracks,
                use_cache: !no_cache,
            },
        ),
        Command::Track { name } => cmd_track(&root, &cli.config, &name),
        Command::Status => cmd_status(&root, &cli.config),
        Command::History { path } => cmd_history(&root, &path),
    }
}

fn load(root: &Path, config_path: &Path) -> Result<AuditConfig> {
    let path = root.join(config_path);
    load_config(&path).with_context(|| format!("load {}", path.display()))
}

fn auditor(root: &Path, config_path: &Path) -> Result<Auditor<ProcessTrackExecutor>> {
    let config = load(root, config_path)?;
    let no_archive = std::env::var(NO_ARCHIVE_ENV).ok();
    let archive_enabled = config.archive_enabled(no_archive.as_deref());
    let registry = registry_from_config(&config).context("register analyzers")?;
    let executor = ProcessTrackExecutor::new(root, config.output_limit_bytes);
    Auditor::new(root, config, archive_enabled, registry, executor).context("configure audit")
}

fn cmd_run(root: &Path, config_path: &Path, opts: &AuditOptions) -> Result<i32> {
    let auditor = auditor(root, config_path)?;
    let report = auditor.run_audit(opts).context("run audit")?;
    for tool in &report.run.tool_results {
        println!(
            "{:<5} {}/{} ({} issues)",
            tool.status.as_str(),
            tool.domain,
            tool.tool_name,
            tool.total_issues
        );
    }
    for (name, outcome) in report.run.tier3_test_outcome.iter().flatten() {
        println!("track {}: {}", name, outcome.state.as_str());
    }
    for path in &report.documents {
        println!("wrote {}", path.display());
    }
    if report.decision.overall_pass {
        println!("audit passed");
        return Ok(exit_codes::OK);
    }
    let mut failing = report.decision.failing_tools.clone();
    if report.run.strict {
        failing.extend(report.decision.failing_tracks.iter().map(|name| format!("track {name}")));
    }
    println!("audit failed: {}", failing.join(", "));
    Ok(exit_codes::FAILED)
}

fn cmd_track(root: &Path, config_path: &Path, name: &str) -> Result<i32> {
    let auditor = auditor(root, config_path)?;
    let report = auditor
        .run_single_track(name)
        .with_context(|| format!("run track {name}"))?;
    let outcome = &report.outcome;
    println!(
        "track {}: {} ({} passed, {} failed, {} errors, {} skipped)",
        report.name,
        outcome.state.as_str(),
        outcome.passed_count,
        outcome.failed_count,
        outcome.error_count,
        outcome.skipped_count
    );
    for id in &outcome.failed_node_ids {
        println!("  {id}");
    }
    Ok(if report.passed() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_status(root: &Path, config_path: &Path) -> Result<i32> {
    let auditor = auditor(root, config_path)?;
    let Some(run) = auditor.last_run() else {
        eprintln!("no audit run recorded");
        return Ok(exit_codes::FAILED);
    };
    println!(
        "{} tier={} strict={} finished={}",
        if run.overall_pass { "PASS" } else { "FAIL" },
        run.tier,
        run.strict,
        run.finished_at.to_rfc3339()
    );
    for tool in &run.tool_results {
        println!("  {:<5} {}/{}", tool.status.as_str(), tool.domain, tool.tool_name);
    }
    for (name, outcome) in run.tier3_test_outcome.iter().flatten() {
        println!("  track {}: {}", name, outcome.state.as_str());
    }
    Ok(if run.overall_pass {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_history(root: &Path, path: &Path) -> Result<i32> {
    let path = root.join(path);
    let versions = archived_versions(&path)
        .with_context(|| format!("list archive for {}", path.display()))?;
    if versions.is_empty() {
        println!("no archived versions of {}", path.display());
    }
    for version in versions {
        println!("{} {}", version.timestamp, version.path.display());
    }
    Ok(exit_codes::OK)
}
