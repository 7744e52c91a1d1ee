//! Shared deterministic types for the loop core.
//!
//! These types define stable contracts between core components and the
//! persisted records. Their serialized names are part of the on-disk format.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One ordered stage of the workflow.
///
/// The declaration order is the execution order; `validate` is last and its
/// exit completes the session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    GenerateTests,
    Implement,
    Improve,
    Document,
    Validate,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::GenerateTests,
        Phase::Implement,
        Phase::Improve,
        Phase::Document,
        Phase::Validate,
    ];

    pub fn first() -> Phase {
        Phase::ALL[0]
    }

    /// Successor in the fixed ordering, `None` after the last phase.
    pub fn next(self) -> Option<Phase> {
        Phase::ALL.get(self.index() + 1).copied()
    }

    pub fn index(self) -> usize {
        match self {
            Phase::GenerateTests => 0,
            Phase::Implement => 1,
            Phase::Improve => 2,
            Phase::Document => 3,
            Phase::Validate => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::GenerateTests => "generate_tests",
            Phase::Implement => "implement",
            Phase::Improve => "improve",
            Phase::Document => "document",
            Phase::Validate => "validate",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == normalized)
            .ok_or_else(|| format!("unknown phase '{raw}'"))
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Halted,
}

impl SessionStatus {
    /// Completed and halted sessions accept no mutation except manual reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Halted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Halted => "halted",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Warning: consecutive ticks without progress.
    HalfOpen,
    /// Halted until an explicit reset.
    Open,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
