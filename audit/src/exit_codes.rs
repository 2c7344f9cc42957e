//! Stable exit codes for audit CLI commands.

/// The audit (or track) passed its gate.
pub const OK: i32 = 0;
/// The audit ran but `overall_pass` is false, or a standalone track did not pass.
pub const FAILED: i32 = 1;
/// Invalid configuration, arguments, or an unrecoverable orchestration error.
pub const INVALID: i32 = 2;
