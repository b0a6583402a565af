//! Stable exit codes for incubator CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config, arguments or run directory.
pub const INVALID: i32 = 1;
/// The pipeline ran but halted (a stage produced no results).
pub const FAILED: i32 = 2;
