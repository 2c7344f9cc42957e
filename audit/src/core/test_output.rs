//! Parsing of pytest-style console output into counts and failed test ids.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::TestCounts;

static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^=*\s*(?P<body>(?:\d+ [a-z]+(?:, )?)+)(?: in [0-9.]+s.*)?\s*=*\s*$")
        .expect("summary pattern is valid")
});

static COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) ([a-z]+)").expect("count pattern is valid"));

static FAILED_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:FAILED|ERROR) (?P<id>[^\s]+)").expect("failed id pattern is valid")
});

/// Counts and failed ids extracted from one test run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTestOutput {
    pub counts: TestCounts,
    /// Sorted and deduplicated, so reruns of the same failing set compare equal.
    pub failed_node_ids: Vec<String>,
}

impl ParsedTestOutput {
    /// Fold another shard's output into this one.
    pub fn merge(&mut self, other: ParsedTestOutput) {
        self.counts.add(&other.counts);
        self.failed_node_ids.extend(other.failed_node_ids);
        self.failed_node_ids.sort();
        self.failed_node_ids.dedup();
    }
}

/// Parse the final summary line and the short test summary of a pytest run.
///
/// Only the last summary line counts; earlier lines that happen to look like a
/// summary (e.g. captured output) are ignored. Missing summaries yield zero counts.
pub fn parse_test_output(raw: &str) -> ParsedTestOutput {
    let counts = SUMMARY_RE
        .captures_iter(raw)
        .filter(|caps| is_summary(&caps["body"]))
        .last()
        .map(|caps| parse_counts(&caps["body"]))
        .unwrap_or_default();

    let mut failed_node_ids: Vec<String> = FAILED_ID_RE
        .captures_iter(raw)
        .map(|caps| caps["id"].to_string())
        .collect();
    failed_node_ids.sort();
    failed_node_ids.dedup();

    ParsedTestOutput {
        counts,
        failed_node_ids,
    }
}

fn is_summary(body: &str) -> bool {
    COUNT_RE
        .captures_iter(body)
        .any(|caps| count_kind(&caps[2]).is_some())
}

#[derive(Debug, Clone, Copy)]
enum CountKind {
    Passed,
    Failed,
    Errors,
    Skipped,
}

fn count_kind(word: &str) -> Option<CountKind> {
    match word {
        "passed" | "xpassed" => Some(CountKind::Passed),
        "failed" => Some(CountKind::Failed),
        "error" | "errors" => Some(CountKind::Errors),
        "skipped" | "xfailed" => Some(CountKind::Skipped),
        _ => None,
    }
}

fn parse_counts(body: &str) -> TestCounts {
    let mut counts = TestCounts::default();
    for caps in COUNT_RE.captures_iter(body) {
        let Ok(n) = caps[1].parse::<u32>() else {
            continue;
        };
        match count_kind(&caps[2]) {
            Some(CountKind::Passed) => counts.passed += n,
            Some(CountKind::Failed) => counts.failed += n,
            Some(CountKind::Errors) => counts.errors += n,
            Some(CountKind::Skipped) => counts.skipped += n,
            None => {}
        }
    }
    counts
}
