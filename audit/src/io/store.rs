//! Versioned, staleness-aware storage for tool results and caches.
//!
//! Layout under the toolsuite root:
//!
//! - results: `<domain>/jsons/<tool>_results.json` (rotated before overwrite)
//! - caches:  `<domain>/jsons/.<tool>_cache.json` (overwritten in place)
//! - history: `<domain>/jsons/archive/<tool>_results_<timestamp>.json`
//!
//! Loads never fail: a missing, unreadable, or corrupt file is logged and
//! reported as `None`, which callers treat as "must recompute".

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::error::StoreError;
use crate::io::archive::ArchiveRotator;
use crate::io::atomic::write_json_atomic;

pub const JSONS_DIR: &str = "jsons";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    rotator: ArchiveRotator,
    max_versions: usize,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, rotator: ArchiveRotator, max_versions: usize) -> Self {
        Self {
            root: root.into(),
            rotator,
            max_versions,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rotator(&self) -> ArchiveRotator {
        self.rotator
    }

    pub fn jsons_dir(&self, domain: &str) -> Result<PathBuf, StoreError> {
        validate_segment(domain)?;
        Ok(self.root.join(domain).join(JSONS_DIR))
    }

    pub fn result_path(&self, tool_name: &str, domain: &str) -> Result<PathBuf, StoreError> {
        validate_segment(tool_name)?;
        Ok(self.jsons_dir(domain)?.join(format!("{tool_name}_results.json")))
    }

    pub fn cache_path(&self, tool_name: &str, domain: &str) -> Result<PathBuf, StoreError> {
        validate_segment(tool_name)?;
        Ok(self.jsons_dir(domain)?.join(format!(".{tool_name}_cache.json")))
    }

    /// Persist a result, archiving the previous version first.
    #[instrument(skip(self, data))]
    pub fn save_result<T: Serialize>(
        &self,
        tool_name: &str,
        domain: &str,
        data: &T,
    ) -> Result<PathBuf, StoreError> {
        let path = self.result_path(tool_name, domain)?;
        if path.exists() {
            self.rotator.rotate(&path, self.max_versions)?;
        }
        write_json_atomic(&path, data)?;
        debug!(path = %path.display(), "result saved");
        Ok(path)
    }

    pub fn load_result<T: DeserializeOwned>(&self, tool_name: &str, domain: &str) -> Option<T> {
        let path = self.result_path(tool_name, domain).ok()?;
        load_json(&path)
    }

    /// Persist a cache in place; caches are disposable and never archived.
    #[instrument(skip(self, data))]
    pub fn save_cache<T: Serialize>(
        &self,
        tool_name: &str,
        domain: &str,
        data: &T,
    ) -> Result<PathBuf, StoreError> {
        let path = self.cache_path(tool_name, domain)?;
        write_json_atomic(&path, data)?;
        debug!(path = %path.display(), "cache saved");
        Ok(path)
    }

    pub fn load_cache<T: DeserializeOwned>(&self, tool_name: &str, domain: &str) -> Option<T> {
        let path = self.cache_path(tool_name, domain).ok()?;
        load_json(&path)
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "artifact missing");
            return None;
        }
        Err(err) => {
            warn!(path = %path.display(), err = %err, "artifact unreadable, treating as missing");
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "artifact corrupt, treating as missing");
            None
        }
    }
}

// Names become path segments; anything that could escape `<domain>/jsons/` is rejected.
fn validate_segment(name: &str) -> Result<(), StoreError> {
    let invalid = |reason| {
        Err(StoreError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };
    if name.trim().is_empty() {
        return invalid("must not be empty");
    }
    if name.starts_with('.') {
        return invalid("must not start with a dot");
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return invalid("must be a single path segment"),
    }
    if name.contains(['/', '\\']) {
        return invalid("must be a single path segment");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::archive::archived_versions;
    use serde_json::{Value, json};

    fn store(root: &Path) -> ArtifactStore {
        ArtifactStore::new(root, ArchiveRotator::new(true), 5)
    }

    #[test]
    fn paths_follow_layout() {
        let store = store(Path::new("/q"));
        assert_eq!(
            store.result_path("links", "docs").expect("path"),
            PathBuf::from("/q/docs/jsons/links_results.json")
        );
        assert_eq!(
            store.cache_path("links", "docs").expect("path"),
            PathBuf::from("/q/docs/jsons/.links_cache.json")
        );
    }

    #[test]
    fn result_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let data = json!({"summary": {"total_issues": 2}, "details": [1, 2]});
        store.save_result("links", "docs", &data).expect("save");
        let loaded: Value = store.load_result("links", "docs").expect("load");
        assert_eq!(loaded, data);
    }

    #[test]
    fn save_result_archives_previous_versions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        for n in 0..8 {
            let path = store.save_result("links", "docs", &json!({"n": n})).expect("save");
            assert_eq!(archived_versions(&path).expect("versions").len(), n.min(5));
        }
    }

    #[test]
    fn cache_is_never_archived() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.save_cache("links", "docs", &json!(1)).expect("first");
        let path = store.save_cache("links", "docs", &json!(2)).expect("second");
        assert!(!path.parent().expect("parent").join("archive").exists());
        assert_eq!(store.load_cache::<Value>("links", "docs"), Some(json!(2)));
    }

    #[test]
    fn load_returns_none_for_missing_or_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        assert_eq!(store.load_result::<Value>("links", "docs"), None);

        let path = store.result_path("links", "docs").expect("path");
        fs::create_dir_all(path.parent().expect("parent")).expect("dir");
        fs::write(&path, "{ truncated").expect("write");
        assert_eq!(store.load_result::<Value>("links", "docs"), None);
    }

    #[test]
    fn rejects_names_that_escape_layout() {
        let store = store(Path::new("/q"));
        assert!(store.result_path("../x", "docs").is_err());
        assert!(store.result_path("x", "docs/jsons").is_err());
        assert!(store.result_path("x", "..").is_err());
        assert!(store.cache_path("", "docs").is_err());
    }
}
