//! Built-in check that every JSON artifact lives under a `jsons/` directory.

use std::path::Path;

use serde_json::json;
use walkdir::WalkDir;

use crate::core::types::{Tier, ToolResult, ToolStatus, ToolSummary};
use crate::error::ToolError;
use crate::io::archive::ARCHIVE_DIR;
use crate::io::store::JSONS_DIR;
use crate::tools::{Analyzer, ToolContext};

pub const LAYOUT_TOOL: &str = "artifact_layout";
pub const LAYOUT_DOMAIN: &str = "audit";

#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactLayoutAnalyzer;

impl Analyzer for ArtifactLayoutAnalyzer {
    fn name(&self) -> &str {
        LAYOUT_TOOL
    }

    fn domain(&self) -> &str {
        LAYOUT_DOMAIN
    }

    fn min_tier(&self) -> Tier {
        Tier::Quick
    }

    fn run(&self, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let mut misplaced = Vec::new();
        if ctx.toolsuite_root.is_dir() {
            for entry in WalkDir::new(&ctx.toolsuite_root).sort_by_file_name() {
                let entry = entry.map_err(|err| ToolError::Failed {
                    name: LAYOUT_TOOL.to_string(),
                    message: err.to_string(),
                })?;
                let path = entry.path();
                if entry.file_type().is_file() && is_json(path) && !in_jsons_dir(path) {
                    let relative = path.strip_prefix(&ctx.toolsuite_root).unwrap_or(path);
                    misplaced.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }

        let count = misplaced.len() as u64;
        let status = if misplaced.is_empty() {
            ToolStatus::Clean
        } else {
            ToolStatus::Fail
        };
        Ok(ToolResult::new(
            LAYOUT_TOOL,
            LAYOUT_DOMAIN,
            ToolSummary {
                total_issues: count,
                files_affected: count,
                status,
            },
            json!({ "misplaced": misplaced }),
        ))
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

// `<domain>/jsons/x.json` or `<domain>/jsons/archive/x.json`.
fn in_jsons_dir(path: &Path) -> bool {
    let Some(parent) = path.parent() else {
        return false;
    };
    let parent_is = |dir: &Path, name: &str| dir.file_name().is_some_and(|n| n == name);
    if parent_is(parent, JSONS_DIR) {
        return true;
    }
    parent_is(parent, ARCHIVE_DIR) && parent.parent().is_some_and(|dir| parent_is(dir, JSONS_DIR))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn ctx(root: &Path) -> ToolContext {
        ToolContext {
            project_root: root.to_path_buf(),
            toolsuite_root: root.join("quality"),
            tier: Tier::Quick,
            output_limit_bytes: 1_000,
        }
    }

    #[test]
    fn clean_when_artifacts_follow_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let jsons = temp.path().join("quality/docs/jsons");
        fs::create_dir_all(jsons.join("archive")).expect("mkdir");
        fs::write(jsons.join("ascii_results.json"), "{}").expect("write");
        fs::write(jsons.join(".ascii_cache.json"), "{}").expect("write");
        fs::write(jsons.join("archive/ascii_results_20250101T000000_000000.json"), "{}")
            .expect("write");
        fs::write(temp.path().join("quality/STATUS.md"), "# ok").expect("write");

        let result = ArtifactLayoutAnalyzer.run(&ctx(temp.path())).expect("run");
        assert_eq!(result.summary.status, ToolStatus::Clean);
        assert_eq!(result.summary.total_issues, 0);
    }

    #[test]
    fn fails_on_stray_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let domain = temp.path().join("quality/docs");
        fs::create_dir_all(domain.join("archive")).expect("mkdir");
        fs::write(domain.join("stray.json"), "{}").expect("write");
        fs::write(domain.join("archive/old.json"), "{}").expect("write");

        let result = ArtifactLayoutAnalyzer.run(&ctx(temp.path())).expect("run");
        assert_eq!(result.summary.status, ToolStatus::Fail);
        assert_eq!(
            result.details["misplaced"],
            json!(["docs/archive/old.json", "docs/stray.json"])
        );
    }

    #[test]
    fn missing_toolsuite_is_clean() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = ArtifactLayoutAnalyzer.run(&ctx(temp.path())).expect("run");
        assert_eq!(result.summary.status, ToolStatus::Clean);
    }
}
