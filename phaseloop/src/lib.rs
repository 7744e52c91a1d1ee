//! Autonomous multi-phase loop supervisor.
//!
//! A session walks a target through a fixed sequence of phases
//! (`generate_tests`, `implement`, `improve`, `document`, `validate`),
//! invoking an external phase worker once per tick. Each tick is guarded by
//! an hourly call budget and a provider-overload cooldown, fed to a
//! progress-based circuit breaker, and allowed to leave its phase only when
//! both exit gates agree.
//!
//! - **[`core`]**: pure state machines and records. No I/O, fully testable in
//!   isolation.
//! - **[`io`]**: storage, the status log, configuration, worker processes,
//!   time and signals.
//!
//! [`orchestrator`] runs a single tick; [`looping`] repeats it; [`start`] and
//! [`control`] implement the session lifecycle commands.

pub mod control;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod orchestrator;
pub mod start;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
