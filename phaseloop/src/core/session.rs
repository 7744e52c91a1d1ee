//! Authoritative session record and its transition rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::circuit_breaker::CircuitBreakerState;
use crate::core::types::{Phase, SessionStatus};

/// Default retention for `error_history`.
pub const DEFAULT_ERROR_HISTORY_CAP: usize = 50;

/// Illegal mutation of a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is {status} and can no longer change")]
    Terminal { status: SessionStatus },
    #[error("session is {status}, expected running")]
    NotRunning { status: SessionStatus },
    #[error("cannot change status from {from} to {to}")]
    InvalidStatusChange {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("status {status} requires a reason")]
    MissingReason { status: SessionStatus },
}

/// Why a persisted session may not be resumed. Each condition is independent
/// and none of them expires with time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResumeRejection {
    #[error("target mismatch: session was created for '{expected}' but resume asked for '{actual}'")]
    TargetMismatch { expected: String, actual: String },
    #[error("session is {status}; start a new session")]
    Terminal { status: SessionStatus },
    #[error("circuit breaker is open: {reason}")]
    CircuitOpen { reason: String },
}

/// One bounded error history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub phase: Phase,
    pub iteration: u32,
    pub message: String,
    pub hash: String,
}

/// One phase change. `to == None` means the session completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseChange {
    pub at: DateTime<Utc>,
    pub from: Phase,
    pub to: Option<Phase>,
    pub iteration: u32,
    /// Made by an operator skip that bypassed the gates.
    pub forced: bool,
    pub reason: String,
}

/// Persisted session record (`session.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub revision: u64,
    pub session_id: String,
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub current_phase: Phase,
    pub current_iteration: u32,
    pub status: SessionStatus,
    pub halt_reason: Option<String>,
    pub pause_reason: Option<String>,
    pub phases_completed: Vec<Phase>,
    pub error_history: Vec<ErrorRecord>,
    #[serde(default)]
    pub phase_history: Vec<PhaseChange>,
    /// Total ticks across all phases.
    #[serde(default)]
    pub ticks: u64,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: String, target: String, now: DateTime<Utc>) -> Self {
        Self {
            revision: 0,
            session_id,
            target,
            created_at: now,
            current_phase: Phase::first(),
            current_iteration: 0,
            status: SessionStatus::Running,
            halt_reason: None,
            pause_reason: None,
            phases_completed: Vec::new(),
            error_history: Vec::new(),
            phase_history: Vec::new(),
            ticks: 0,
            last_activity: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Completed phases as a share of all phases.
    pub fn progress_percent(&self) -> u8 {
        let done = self.phases_completed.len().min(Phase::ALL.len());
        (done * 100 / Phase::ALL.len()) as u8
    }

    /// Count one tick that did not exit the phase.
    pub fn increment_iteration(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.current_iteration = self.current_iteration.saturating_add(1);
        self.last_activity = now;
        Ok(())
    }

    /// Advance past the current phase when `can_exit` holds.
    ///
    /// Returns the phase change, or `None` when the gates did not allow an
    /// exit. Leaving the last phase completes the session.
    pub fn transition(
        &mut self,
        can_exit: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<PhaseChange>, SessionError> {
        self.ensure_running()?;
        if !can_exit {
            return Ok(None);
        }
        Ok(Some(self.advance(false, "dual gate passed", now)))
    }

    /// Operator skip: advance without consulting the gates.
    pub fn force_skip(&mut self, reason: &str, now: DateTime<Utc>) -> Result<PhaseChange, SessionError> {
        if self.is_terminal() {
            return Err(SessionError::Terminal {
                status: self.status,
            });
        }
        Ok(self.advance(true, reason, now))
    }

    fn advance(&mut self, forced: bool, reason: &str, now: DateTime<Utc>) -> PhaseChange {
        let from = self.current_phase;
        let to = from.next();
        self.phases_completed.push(from);
        let change = PhaseChange {
            at: now,
            from,
            to,
            iteration: self.current_iteration,
            forced,
            reason: reason.to_string(),
        };
        self.phase_history.push(change.clone());
        self.current_iteration = 0;
        self.last_activity = now;
        match to {
            Some(next) => self.current_phase = next,
            None => {
                self.status = SessionStatus::Completed;
                self.pause_reason = None;
            }
        }
        change
    }

    /// Change status. Paused and halted keep every other field intact for a
    /// later resume or reset; completed and halted are terminal.
    pub fn set_status(
        &mut self,
        status: SessionStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        if self.is_terminal() {
            return Err(SessionError::Terminal {
                status: self.status,
            });
        }
        let reason = reason.filter(|r| !r.trim().is_empty());
        match status {
            SessionStatus::Running => {
                self.pause_reason = None;
            }
            SessionStatus::Paused => {
                self.pause_reason = Some(reason.ok_or(SessionError::MissingReason { status })?);
            }
            SessionStatus::Halted => {
                self.halt_reason = Some(reason.ok_or(SessionError::MissingReason { status })?);
                self.pause_reason = None;
            }
            SessionStatus::Completed => {
                if self.status != SessionStatus::Running {
                    return Err(SessionError::InvalidStatusChange {
                        from: self.status,
                        to: status,
                    });
                }
            }
        }
        self.status = status;
        self.last_activity = now;
        Ok(())
    }

    /// Manual reset of a halted session back to running at the same phase
    /// and iteration.
    pub fn reopen(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Completed => Err(SessionError::Terminal {
                status: self.status,
            }),
            SessionStatus::Halted => {
                self.status = SessionStatus::Running;
                self.halt_reason = None;
                self.last_activity = now;
                Ok(())
            }
            SessionStatus::Running | SessionStatus::Paused => Ok(()),
        }
    }

    /// Append an error, dropping the oldest entries beyond `cap`.
    pub fn record_error(&mut self, message: &str, hash: String, cap: usize, now: DateTime<Utc>) {
        self.error_history.push(ErrorRecord {
            at: now,
            phase: self.current_phase,
            iteration: self.current_iteration,
            message: message.to_string(),
            hash,
        });
        if self.error_history.len() > cap {
            let excess = self.error_history.len() - cap;
            self.error_history.drain(..excess);
        }
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.is_terminal() {
            return Err(SessionError::Terminal {
                status: self.status,
            });
        }
        if self.status != SessionStatus::Running {
            return Err(SessionError::NotRunning {
                status: self.status,
            });
        }
        Ok(())
    }
}

/// Check that a persisted session may be resumed for `target`.
pub fn validate_for_resume(
    session: &Session,
    breaker: &CircuitBreakerState,
    target: &str,
) -> Result<(), ResumeRejection> {
    if session.target != target {
        return Err(ResumeRejection::TargetMismatch {
            expected: session.target.clone(),
            actual: target.to_string(),
        });
    }
    if session.is_terminal() {
        return Err(ResumeRejection::Terminal {
            status: session.status,
        });
    }
    if breaker.is_open() {
        return Err(ResumeRejection::CircuitOpen {
            reason: breaker
                .open_reason
                .clone()
                .unwrap_or_else(|| "no reason recorded".to_string()),
        });
    }
    Ok(())
}
