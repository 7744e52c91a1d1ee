//! Stable exit codes for phaseloop CLI commands.

/// Command succeeded, or the session is still running.
pub const OK: i32 = 0;
/// Invalid input, invalid-for-resume session, or any other error.
pub const INVALID: i32 = 1;
/// The session completed every phase.
pub const COMPLETE: i32 = 2;
/// The session is halted (circuit breaker open or aborted).
pub const HALTED: i32 = 3;
/// The session is paused (hourly limit, shutdown, or operator pause).
pub const PAUSED: i32 = 4;
