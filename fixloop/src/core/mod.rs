//! Deterministic, pure logic shared by the runtime.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod classifier;
pub mod followup;
pub mod parse;
pub mod repair;
pub mod types;
