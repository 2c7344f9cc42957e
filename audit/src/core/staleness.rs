//! Cache entries and staleness decisions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source path → last-modified time in seconds since the Unix epoch.
pub type SourceMtimes = BTreeMap<String, f64>;

/// Disposable, recomputable artifact tagged with the mtimes of its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub source_mtimes: SourceMtimes,
    pub generated_at: DateTime<Utc>,
    pub data: T,
}

impl<T> CacheEntry<T> {
    pub fn new(source_mtimes: SourceMtimes, data: T) -> Self {
        Self {
            source_mtimes,
            generated_at: Utc::now(),
            data,
        }
    }
}

/// Whether any tracked source changed since the cache was computed.
///
/// A tracked source is stale when its current mtime exceeds the recorded one or
/// when it no longer exists. An entry with zero tracked sources is always fresh.
pub fn is_stale<T>(entry: &CacheEntry<T>, current_source_mtimes: &SourceMtimes) -> bool {
    entry
        .source_mtimes
        .iter()
        .any(|(path, recorded)| match current_source_mtimes.get(path) {
            Some(current) => current > recorded,
            None => true,
        })
}

/// Whether the set of tracked sources differs (files added or removed).
pub fn sources_changed<T>(entry: &CacheEntry<T>, current_source_mtimes: &SourceMtimes) -> bool {
    entry.source_mtimes.len() != current_source_mtimes.len()
        || entry
            .source_mtimes
            .keys()
            .any(|path| !current_source_mtimes.contains_key(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mtimes(entries: &[(&str, f64)]) -> SourceMtimes {
        entries
            .iter()
            .map(|(path, mtime)| (path.to_string(), *mtime))
            .collect()
    }

    #[test]
    fn unchanged_or_older_sources_are_fresh() {
        let entry = CacheEntry::new(mtimes(&[("a.md", 10.0), ("b.md", 20.0)]), ());
        assert!(!is_stale(&entry, &mtimes(&[("a.md", 10.0), ("b.md", 20.0)])));
        assert!(!is_stale(&entry, &mtimes(&[("a.md", 5.0), ("b.md", 20.0)])));
    }

    #[test]
    fn bumped_source_is_stale() {
        let entry = CacheEntry::new(mtimes(&[("a.md", 10.0), ("b.md", 20.0)]), ());
        assert!(is_stale(&entry, &mtimes(&[("a.md", 10.0), ("b.md", 20.5)])));
    }

    #[test]
    fn removed_source_is_stale() {
        let entry = CacheEntry::new(mtimes(&[("a.md", 10.0)]), ());
        assert!(is_stale(&entry, &SourceMtimes::new()));
    }

    #[test]
    fn empty_cache_is_always_fresh() {
        let entry = CacheEntry::new(SourceMtimes::new(), ());
        assert!(!is_stale(&entry, &mtimes(&[("new.md", 99.0)])));
    }

    #[test]
    fn detects_added_sources() {
        let entry = CacheEntry::new(mtimes(&[("a.md", 10.0)]), ());
        assert!(sources_changed(&entry, &mtimes(&[("a.md", 10.0), ("b.md", 1.0)])));
        assert!(!sources_changed(&entry, &mtimes(&[("a.md", 11.0)])));
    }
}
