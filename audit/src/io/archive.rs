//! Overwrite-with-history for artifacts and generated documents.
//!
//! Before a file is replaced, the current version is moved into an `archive/`
//! directory next to it as `<stem>_<timestamp>[_<seq>]<ext>`. Versions beyond
//! the cap are pruned oldest-first by the embedded timestamp, never by
//! filesystem mtime, so ordering survives copies and clock-adjusted hosts.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::error::StoreError;
use crate::io::atomic::write_atomic;

pub const ARCHIVE_DIR: &str = "archive";
/// Default cap for JSON tool results.
pub const DEFAULT_RESULT_VERSIONS: usize = 5;
/// Default cap for human-readable documents.
pub const DEFAULT_REPORT_VERSIONS: usize = 7;
/// Environment variable that disables rotation process-wide when truthy.
pub const NO_ARCHIVE_ENV: &str = "AUDIT_NO_ARCHIVE";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S_%6f";

/// One archived version of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedVersion {
    pub path: PathBuf,
    /// Embedded `YYYYMMDDTHHMMSS_ffffff` timestamp.
    pub timestamp: String,
    /// Disambiguates versions archived within the same microsecond.
    pub seq: u32,
}

/// Rotates files into their sibling `archive/` directory.
///
/// Constructed once from configuration; a disabled rotator turns [`rotate`]
/// into a no-op and makes [`create_output_file`] overwrite in place.
///
/// [`rotate`]: ArchiveRotator::rotate
/// [`create_output_file`]: ArchiveRotator::create_output_file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveRotator {
    enabled: bool,
}

impl ArchiveRotator {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Move the file at `path` into the archive and prune to `max_versions`.
    ///
    /// Returns the archived path, or `None` when rotation is disabled or there
    /// is nothing to rotate.
    #[instrument(skip_all, fields(path = %path.display(), max_versions))]
    pub fn rotate(&self, path: &Path, max_versions: usize) -> Result<Option<PathBuf>, StoreError> {
        if !self.enabled {
            debug!("archive rotation disabled");
            return Ok(None);
        }
        if !path.is_file() {
            return Ok(None);
        }
        let (stem, ext) = split_name(path)?;
        let archive_dir = archive_dir_for(path);
        fs::create_dir_all(&archive_dir).map_err(|err| StoreError::io(&archive_dir, err))?;

        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let existing = archived_versions(path)?;
        let seq = existing
            .iter()
            .filter(|version| version.timestamp == timestamp)
            .map(|version| version.seq + 1)
            .max()
            .unwrap_or(0);
        let archived = archive_dir.join(archive_file_name(&stem, &timestamp, seq, &ext));
        fs::rename(path, &archived).map_err(|err| StoreError::io(&archived, err))?;
        debug!(archived = %archived.display(), "archived previous version");

        prune(path, max_versions)?;
        Ok(Some(archived))
    }

    /// Write `content` to `path`, archiving the existing file first when `rotate` is set.
    #[instrument(skip_all, fields(path = %path.display(), rotate, max_versions))]
    pub fn create_output_file(
        &self,
        path: &Path,
        content: &str,
        rotate: bool,
        max_versions: usize,
    ) -> Result<PathBuf, StoreError> {
        if rotate && path.exists() {
            self.rotate(path, max_versions)?;
        }
        write_atomic(path, content.as_bytes())?;
        info!("output file written");
        Ok(path.to_path_buf())
    }
}

/// Whether an environment value asks to disable rotation.
pub fn env_disables_archive(value: Option<&str>) -> bool {
    value.is_some_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

pub fn archive_dir_for(path: &Path) -> PathBuf {
    path.parent()
        .map(|parent| parent.join(ARCHIVE_DIR))
        .unwrap_or_else(|| PathBuf::from(ARCHIVE_DIR))
}

/// Archived versions of the artifact at `path`, oldest first.
pub fn archived_versions(path: &Path) -> Result<Vec<ArchivedVersion>, StoreError> {
    let archive_dir = archive_dir_for(path);
    if !archive_dir.is_dir() {
        return Ok(Vec::new());
    }
    let (stem, ext) = split_name(path)?;
    let pattern = Regex::new(&format!(
        r"^{}_(\d{{8}}T\d{{6}}_\d{{6}})(?:_(\d+))?{}$",
        regex::escape(&stem),
        regex::escape(&ext)
    ))
    .map_err(|_| StoreError::InvalidName {
        name: stem.clone(),
        reason: "cannot build archive pattern",
    })?;

    let mut versions = Vec::new();
    for entry in fs::read_dir(&archive_dir).map_err(|err| StoreError::io(&archive_dir, err))? {
        let entry = entry.map_err(|err| StoreError::io(&archive_dir, err))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(caps) = pattern.captures(&name) else {
            continue;
        };
        let seq = caps
            .get(2)
            .and_then(|seq| seq.as_str().parse::<u32>().ok())
            .unwrap_or(0);
        versions.push(ArchivedVersion {
            path: entry.path(),
            timestamp: caps[1].to_string(),
            seq,
        });
    }
    // Fixed-width timestamps sort lexicographically in time order.
    versions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
    Ok(versions)
}

fn prune(path: &Path, max_versions: usize) -> Result<(), StoreError> {
    let versions = archived_versions(path)?;
    if versions.len() <= max_versions {
        return Ok(());
    }
    let excess = versions.len() - max_versions;
    for version in versions.into_iter().take(excess) {
        match fs::remove_file(&version.path) {
            Ok(()) => debug!(removed = %version.path.display(), "pruned archived version"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %version.path.display(), err = %err, "failed to prune archived version");
                return Err(StoreError::io(&version.path, err));
            }
        }
    }
    Ok(())
}

fn split_name(path: &Path) -> Result<(String, String), StoreError> {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| StoreError::InvalidName {
            name: path.display().to_string(),
            reason: "path has no file name",
        })?;
    let ext = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    Ok((stem, ext))
}

fn archive_file_name(stem: &str, timestamp: &str, seq: u32, ext: &str) -> String {
    if seq == 0 {
        format!("{stem}_{timestamp}{ext}")
    } else {
        format!("{stem}_{timestamp}_{seq}{ext}")
    }
}
