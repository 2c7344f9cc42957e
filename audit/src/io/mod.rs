//! I/O helpers for audit commands.

pub mod archive;
pub mod atomic;
pub mod config;
pub mod coverage;
pub mod process;
pub mod reports;
pub mod store;
pub mod tracks;
