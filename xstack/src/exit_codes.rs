//! Stable exit codes for xstack CLI commands.

/// Every runner passed (or the command had nothing to gate).
pub const OK: i32 = 0;
/// One or more runners failed, or the run was interrupted.
pub const FAILED: i32 = 1;
/// Structural refusal: unresolved repo root, malformed plan inputs, unsupported platform.
pub const REFUSED: i32 = 2;
