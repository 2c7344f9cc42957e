//! Deterministic, pure logic shared by the audit components.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod coverage;
pub mod gate;
pub mod staleness;
pub mod test_output;
pub mod types;
