//! Stable exit codes for fixloop CLI commands.

/// Command succeeded; for `run` and `stream` the execution produced output.
pub const OK: i32 = 0;
/// Invalid usage, configuration, input file or other I/O errors.
pub const INVALID: i32 = 1;
/// The execution finished with a typed failure (transport or parse).
pub const EXECUTION_FAILED: i32 = 2;
