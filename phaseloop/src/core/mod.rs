//! Deterministic, pure logic for the phase loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! records and explicit timestamps, and return deterministic outputs suitable
//! for tests. Persistence, clocks and worker processes live in [`crate::io`].

pub mod circuit_breaker;
pub mod gate;
pub mod metrics;
pub mod progress;
pub mod rate_limit;
pub mod report;
pub mod session;
pub mod state;
pub mod types;
