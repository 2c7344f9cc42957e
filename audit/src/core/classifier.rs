//! Deterministic classification of test track outcomes.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{TestCounts, TrackState};

/// Windows NTSTATUS exit codes that signal abnormal termination.
///
/// Access violation, stack overflow, heap corruption, and fast-fail
/// (stack buffer overrun).
pub const WINDOWS_ABNORMAL_EXIT_CODES: [i64; 4] = [0xC000_0005, 0xC000_00FD, 0xC000_0374, 0xC000_0409];

/// Pytest section headers (`____ test_x ____`, `==== short test summary ====`)
/// and the per-shard separators the track runner inserts.
static SECTION_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:_{3,}|={3,}) .+ (?:_{3,}|={3,})\s*$").expect("section header pattern is valid")
});

static TEARDOWN_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\berror at teardown of\b").expect("teardown header pattern is valid")
});

static CLEANUP_CONTEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:rmtree|rm_rf|cleanup|clean up|teardown)\b").expect("cleanup context pattern is valid")
});

/// Whether `return_code` denotes OS-level abnormal termination.
///
/// Negative codes are POSIX signal terminations (`-N` for signal `N`), and a
/// Windows NTSTATUS code reported as a signed 32-bit value is negative too.
/// Unsigned NTSTATUS values are matched against [`WINDOWS_ABNORMAL_EXIT_CODES`].
pub fn is_abnormal_termination(return_code: i64) -> bool {
    if return_code < 0 {
        return true;
    }
    WINDOWS_ABNORMAL_EXIT_CODES.contains(&return_code)
}

/// Whether `raw_output` carries a permission failure during test-artifact teardown.
///
/// Output is split into sections at pytest headers. A section counts when it
/// contains `PermissionError` and is either an `ERROR at teardown of` section
/// or names a cleanup step (`rmtree`, `rm_rf`, `cleanup`, `teardown`) in its
/// body. A permission error in one test never pairs with context from another.
pub fn is_infra_cleanup_failure(raw_output: &str) -> bool {
    let mut teardown_section = false;
    let mut permission_error = false;
    let mut cleanup_context = false;
    for line in raw_output.lines() {
        if SECTION_HEADER_RE.is_match(line) {
            if permission_error && (teardown_section || cleanup_context) {
                return true;
            }
            teardown_section = TEARDOWN_HEADER_RE.is_match(line);
            permission_error = false;
            cleanup_context = false;
            continue;
        }
        permission_error |= line.contains("PermissionError");
        cleanup_context |= CLEANUP_CONTEXT_RE.is_match(line);
    }
    permission_error && (teardown_section || cleanup_context)
}

/// Map process exit state and parsed counts onto the track taxonomy.
///
/// First match wins:
/// 1. abnormal termination code → `crashed`
/// 2. cleanup permission failure in output → `infra_cleanup_error`
/// 3. any failed or errored test → `test_failures`
/// 4. exit code 0 with no failures → `passed`
/// 5. anything else → `unknown`
pub fn classify(return_code: Option<i64>, counts: &TestCounts, raw_output: &str) -> TrackState {
    if return_code.is_some_and(is_abnormal_termination) {
        return TrackState::Crashed;
    }
    if is_infra_cleanup_failure(raw_output) {
        return TrackState::InfraCleanupError;
    }
    if counts.has_failures() {
        return TrackState::TestFailures;
    }
    if return_code == Some(0) {
        return TrackState::Passed;
    }
    TrackState::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(failed: u32, errors: u32) -> TestCounts {
        TestCounts {
            passed: 10,
            failed,
            errors,
            skipped: 0,
        }
    }

    #[test]
    fn access_violation_is_crashed() {
        let state = classify(Some(3_221_225_477), &TestCounts::default(), "");
        assert_eq!(state, TrackState::Crashed);
    }

    #[test]
    fn crash_wins_over_failures() {
        let state = classify(Some(-11), &counts(4, 0), "4 failed");
        assert_eq!(state, TrackState::Crashed);
    }

    #[test]
    fn cleanup_permission_error_is_infra() {
        let output = "E   PermissionError: [WinError 32] file in use\nerror during cleanup of tmp dir";
        assert_eq!(
            classify(Some(1), &counts(1, 0), output),
            TrackState::InfraCleanupError
        );
    }

    #[test]
    fn permission_error_without_cleanup_context_is_not_infra() {
        let output = "PermissionError: denied opening config.ini";
        assert_eq!(
            classify(Some(1), &counts(2, 0), output),
            TrackState::TestFailures
        );
    }

    #[test]
    fn permission_error_in_teardown_section_is_infra() {
        let output = "\
________________ ERROR at teardown of test_export ________________
E   PermissionError: [WinError 5] Access is denied: 'C:\\tmp\\export0'
=================== 1 passed, 1 error in 0.40s ===================
";
        assert_eq!(
            classify(Some(1), &counts(0, 1), output),
            TrackState::InfraCleanupError
        );
    }

    #[test]
    fn permission_error_next_to_another_tests_tmp_path_is_a_failure() {
        let output = "\
________________________ test_write_config ________________________
    def test_write_config():
>       save_config(\"/etc/app.ini\")
E       PermissionError: [Errno 13] Permission denied: '/etc/app.ini'
app/config.py:12: PermissionError
________________________ test_export ________________________
tmp_path = PosixPath('/tmp/pytest-of-ci/pytest-3/test_export0')
    def test_export(tmp_path):
>       assert export(tmp_path) == 3
E       assert 2 == 3
=================== short test summary info ===================
FAILED tests/test_config.py::test_write_config - PermissionError
FAILED tests/test_export.py::test_export - assert 2 == 3
=================== 2 failed, 10 passed in 0.50s ===================
";
        assert!(!is_infra_cleanup_failure(output));
        assert_eq!(
            classify(Some(1), &counts(2, 0), output),
            TrackState::TestFailures
        );
    }

    #[test]
    fn rmtree_in_the_same_traceback_is_infra() {
        let output = "\
E   PermissionError: [Errno 13] Permission denied: 'build/cache'
/usr/lib/python3.12/shutil.py:710: in rmtree
";
        assert!(is_infra_cleanup_failure(output));
    }

    #[test]
    fn failures_and_errors_are_test_failures() {
        assert_eq!(classify(Some(1), &counts(2, 0), ""), TrackState::TestFailures);
        assert_eq!(classify(Some(1), &counts(0, 1), ""), TrackState::TestFailures);
    }

    #[test]
    fn clean_exit_is_passed() {
        assert_eq!(classify(Some(0), &counts(0, 0), ""), TrackState::Passed);
    }

    #[test]
    fn nonzero_without_failures_is_unknown() {
        assert_eq!(classify(Some(2), &counts(0, 0), ""), TrackState::Unknown);
        assert_eq!(classify(None, &counts(0, 0), ""), TrackState::Unknown);
    }
}
