//! Audit orchestration and artifact lifecycle for a code-quality tool suite.
//!
//! An audit runs a set of analyzers, optionally executes the project's test
//! suite across several tracks, aggregates coverage from parallel shards, and
//! persists every result through a versioned store. The crate keeps the same
//! separation throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, parsing, gating,
//!   staleness). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, archive rotation, child
//!   processes, coverage tooling, document rendering).
//! - **[`tools`]**: The static analyzer registry and built-in analyzers.
//!
//! [`orchestrator`] composes all of the above into a single audit run.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
