//! Diagnostic tracing for the `audit` binary.
//!
//! Spans and events go to stderr only and are filtered by `RUST_LOG`. They
//! describe how a run progressed (which tracks spawned, which caches were
//! reused, why coverage failed) and are never read back by the audit itself.
//!
//! What an audit *decides* lives elsewhere: tool results and track outcomes are
//! JSON under `<toolsuite>/<domain>/jsons/` (see `io/store`), and the verdict is
//! rendered into `STATUS.md`, `PRIORITIES.md` and `REPORT.md` (see
//! `io/reports`). Those are written on every run regardless of the log filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to `warn` so contained
/// failures (storage errors, tool errors, coverage failures) stay visible.
///
/// ```bash
/// RUST_LOG=audit::io::tracks=debug audit run --tier full
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
