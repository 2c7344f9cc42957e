//! Static analyzers run by the orchestrator at every tier.
//!
//! The orchestrator only sees the [`Analyzer`] trait: it reads
//! `summary.status` and persists the result, never the analyzer's internals.

pub mod command;
pub mod layout;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::staleness::SourceMtimes;
use crate::core::types::{Tier, ToolResult};
use crate::error::ToolError;
use crate::io::config::AuditConfig;
use crate::orchestrator::is_reserved_result_key;

pub use command::CommandAnalyzer;
pub use layout::ArtifactLayoutAnalyzer;

/// Inputs shared by every analyzer invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub project_root: PathBuf,
    pub toolsuite_root: PathBuf,
    pub tier: Tier,
    pub output_limit_bytes: usize,
}

pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    fn domain(&self) -> &str;

    /// Lowest tier at which the analyzer runs.
    fn min_tier(&self) -> Tier;

    /// Paths (relative to the project root) whose mtimes key the cached result.
    /// Analyzers without sources are never cached.
    fn sources(&self) -> &[PathBuf] {
        &[]
    }

    fn run(&self, ctx: &ToolContext) -> Result<ToolResult, ToolError>;
}

/// Analyzers known to one audit, unique per `(domain, name)`.
#[derive(Default)]
pub struct ToolRegistry {
    analyzers: Vec<Box<dyn Analyzer>>,
    keys: BTreeSet<(String, String)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, analyzer: Box<dyn Analyzer>) -> Result<(), ToolError> {
        let key = (analyzer.domain().to_string(), analyzer.name().to_string());
        if is_reserved_result_key(&key.1, &key.0) {
            return Err(ToolError::Reserved {
                name: key.1,
                domain: key.0,
            });
        }
        if !self.keys.insert(key.clone()) {
            return Err(ToolError::Duplicate {
                name: key.1,
                domain: key.0,
            });
        }
        debug!(domain = %key.0, tool = %key.1, "analyzer registered");
        self.analyzers.push(analyzer);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }

    /// Analyzers that run at `tier`, in registration order.
    pub fn for_tier(&self, tier: Tier) -> Vec<&dyn Analyzer> {
        self.analyzers
            .iter()
            .filter(|analyzer| tier.includes(analyzer.min_tier()))
            .map(|analyzer| analyzer.as_ref())
            .collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.keys.iter()).finish()
    }
}

/// Built-in analyzers plus every `[[tools]]` entry.
pub fn registry_from_config(cfg: &AuditConfig) -> Result<ToolRegistry, ToolError> {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(ArtifactLayoutAnalyzer))?;
    for tool in &cfg.tools {
        registry.register(Box::new(CommandAnalyzer::from_config(tool)))?;
    }
    Ok(registry)
}

/// Modification times of every file under `sources`, keyed by path relative to
/// `project_root`. Missing sources contribute nothing.
pub fn collect_source_mtimes(project_root: &Path, sources: &[PathBuf]) -> SourceMtimes {
    let mut mtimes = SourceMtimes::new();
    for source in sources {
        for entry in WalkDir::new(project_root.join(source)).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(source = %source.display(), err = %err, "skipping unreadable source");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = match entry.metadata().map(|meta| meta.modified()) {
                Ok(Ok(modified)) => modified,
                Ok(Err(err)) => {
                    warn!(path = %entry.path().display(), err = %err, "mtime unavailable");
                    continue;
                }
                Err(err) => {
                    warn!(path = %entry.path().display(), err = %err, "metadata unavailable");
                    continue;
                }
            };
            let seconds = modified
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs_f64())
                .unwrap_or(0.0);
            let key = entry
                .path()
                .strip_prefix(project_root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            mtimes.insert(key, seconds);
        }
    }
    mtimes
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::StaticAnalyzer;
    use crate::core::types::ToolStatus;

    #[test]
    fn registry_rejects_duplicates_and_filters_by_tier() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Box::new(StaticAnalyzer::new("ascii", "docs", Tier::Quick, ToolStatus::Clean)))
            .expect("register");
        registry
            .register(Box::new(StaticAnalyzer::new("lint", "code", Tier::Standard, ToolStatus::Pass)))
            .expect("register");
        let duplicate = registry.register(Box::new(StaticAnalyzer::new(
            "ascii",
            "docs",
            Tier::Full,
            ToolStatus::Pass,
        )));
        assert!(matches!(duplicate, Err(ToolError::Duplicate { .. })));

        let quick: Vec<&str> = registry.for_tier(Tier::Quick).iter().map(|a| a.name()).collect();
        assert_eq!(quick, vec!["ascii"]);
        assert_eq!(registry.for_tier(Tier::Full).len(), 2);
    }

    #[test]
    fn registry_rejects_audit_record_keys() {
        let mut registry = ToolRegistry::new();
        for (name, domain) in crate::orchestrator::RESERVED_RESULT_KEYS {
            let err = registry
                .register(Box::new(StaticAnalyzer::new(name, domain, Tier::Quick, ToolStatus::Pass)))
                .expect_err("reserved");
            assert!(matches!(err, ToolError::Reserved { .. }));
        }
        registry
            .register(Box::new(StaticAnalyzer::new("coverage", "docs", Tier::Quick, ToolStatus::Pass)))
            .expect("same name in another domain");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn config_tools_join_builtins() {
        let cfg: AuditConfig = toml::from_str(
            r#"
[[tools]]
name = "ascii"
domain = "docs"
command = ["python", "ascii.py"]
"#,
        )
        .expect("parse");
        let registry = registry_from_config(&cfg).expect("registry");
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.for_tier(Tier::Quick).len(), 1);
    }

    #[test]
    fn source_mtimes_cover_nested_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("docs/guide")).expect("mkdir");
        fs::write(temp.path().join("docs/index.md"), "x").expect("write");
        fs::write(temp.path().join("docs/guide/intro.md"), "y").expect("write");

        let mtimes = collect_source_mtimes(
            temp.path(),
            &[PathBuf::from("docs"), PathBuf::from("missing")],
        );
        let keys: Vec<&str> = mtimes.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["docs/guide/intro.md", "docs/index.md"]);
        assert!(mtimes.values().all(|mtime| *mtime > 0.0));
    }
}
