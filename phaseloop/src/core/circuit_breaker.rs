//! Progress- and repeated-error-driven circuit breaker.
//!
//! The breaker is owned per session, but its thresholds come from a static
//! per-phase table so a resumed session always sees the same limits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::metrics::MetricsSnapshot;
use crate::core::types::{CircuitState, Phase};

/// Consecutive no-progress ticks before the breaker warns (HALF_OPEN).
pub const HALF_OPEN_AFTER: u32 = 2;

/// Per-phase breaker limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Consecutive no-progress ticks that open the breaker.
    pub no_progress: u32,
    /// Consecutive identical errors that open the breaker.
    pub same_error: u32,
}

/// Static threshold table. `improve` carries the highest risk of looping
/// without end and is the strictest; `implement` iterates naturally and is
/// the most lenient.
pub const fn thresholds(phase: Phase) -> Thresholds {
    match phase {
        Phase::GenerateTests => Thresholds {
            no_progress: 3,
            same_error: 5,
        },
        Phase::Implement => Thresholds {
            no_progress: 5,
            same_error: 5,
        },
        Phase::Improve => Thresholds {
            no_progress: 2,
            same_error: 3,
        },
        Phase::Document => Thresholds {
            no_progress: 3,
            same_error: 5,
        },
        Phase::Validate => Thresholds {
            no_progress: 3,
            same_error: 3,
        },
    }
}

/// No-progress count at which the breaker enters HALF_OPEN for `threshold`.
pub fn half_open_at(threshold: u32) -> u32 {
    HALF_OPEN_AFTER.min(threshold.saturating_sub(1)).max(1)
}

/// Content hash used to detect repeated identical errors.
///
/// Whitespace is normalized so that reflowed output hashes the same.
pub fn error_hash(message: &str) -> String {
    let normalized = message.split_whitespace().collect::<Vec<_>>().join(" ");
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}

/// One audited state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitTransition {
    pub at: DateTime<Utc>,
    pub phase: Phase,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
}

/// Persisted breaker record (`circuit_breaker.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub revision: u64,
    pub state: CircuitState,
    pub no_progress_count: u32,
    pub same_error_count: u32,
    pub last_error_hash: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub open_reason: Option<String>,
    pub last_progress_snapshot: Option<MetricsSnapshot>,
    #[serde(default)]
    pub history: Vec<CircuitTransition>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            revision: 0,
            state: CircuitState::Closed,
            no_progress_count: 0,
            same_error_count: 0,
            last_error_hash: None,
            opened_at: None,
            open_reason: None,
            last_progress_snapshot: None,
            history: Vec::new(),
        }
    }
}

impl CircuitBreakerState {
    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Feed one tick's progress verdict. OPEN ignores further input.
    pub fn record_progress(
        &mut self,
        phase: Phase,
        progressed: bool,
        snapshot: Option<&MetricsSnapshot>,
        now: DateTime<Utc>,
    ) -> CircuitState {
        if self.is_open() {
            return self.state;
        }

        if progressed {
            self.no_progress_count = 0;
            self.same_error_count = 0;
            self.last_error_hash = None;
            self.last_progress_snapshot = snapshot.cloned();
            self.move_to(CircuitState::Closed, phase, "progress detected", now);
            return self.state;
        }

        self.no_progress_count = self.no_progress_count.saturating_add(1);
        let limit = thresholds(phase).no_progress;
        if self.no_progress_count >= limit {
            let reason = format!(
                "no progress for {} consecutive iterations in {} (threshold {})",
                self.no_progress_count, phase, limit
            );
            self.open(phase, reason, now);
        } else if self.no_progress_count >= half_open_at(limit) {
            let reason = format!(
                "no progress for {} consecutive iterations in {}",
                self.no_progress_count, phase
            );
            self.move_to(CircuitState::HalfOpen, phase, &reason, now);
        }
        self.state
    }

    /// Feed the tick's reported error. Reaching the same-error threshold
    /// opens the breaker regardless of the progress path.
    pub fn record_error(&mut self, phase: Phase, message: &str, now: DateTime<Utc>) -> CircuitState {
        if self.is_open() {
            return self.state;
        }

        let hash = error_hash(message);
        if self.last_error_hash.as_deref() == Some(hash.as_str()) {
            self.same_error_count = self.same_error_count.saturating_add(1);
        } else {
            self.same_error_count = 1;
            self.last_error_hash = Some(hash);
        }

        let limit = thresholds(phase).same_error;
        if self.same_error_count >= limit {
            let reason = format!(
                "same error repeated {} times in {} (threshold {}): {}",
                self.same_error_count,
                phase,
                limit,
                first_line(message)
            );
            self.open(phase, reason, now);
        }
        self.state
    }

    /// Zero the counters of a non-open breaker when the session changes phase.
    pub fn on_phase_change(&mut self, from: Phase, to: Option<Phase>, now: DateTime<Utc>) {
        if self.is_open() {
            return;
        }
        self.no_progress_count = 0;
        self.same_error_count = 0;
        self.last_error_hash = None;
        self.last_progress_snapshot = None;
        let reason = match to {
            Some(next) => format!("phase changed from {from} to {next}"),
            None => format!("final phase {from} exited"),
        };
        self.move_to(CircuitState::Closed, from, &reason, now);
    }

    /// External reset: back to CLOSED with all counters and open details cleared.
    pub fn reset(&mut self, phase: Phase, reason: &str, now: DateTime<Utc>) {
        let from = self.state;
        self.state = CircuitState::Closed;
        self.no_progress_count = 0;
        self.same_error_count = 0;
        self.last_error_hash = None;
        self.opened_at = None;
        self.open_reason = None;
        self.last_progress_snapshot = None;
        self.history.push(CircuitTransition {
            at: now,
            phase,
            from,
            to: CircuitState::Closed,
            reason: format!("reset: {reason}"),
        });
    }

    fn open(&mut self, phase: Phase, reason: String, now: DateTime<Utc>) {
        self.opened_at = Some(now);
        self.open_reason = Some(reason.clone());
        self.move_to(CircuitState::Open, phase, &reason, now);
    }

    fn move_to(&mut self, to: CircuitState, phase: Phase, reason: &str, now: DateTime<Utc>) {
        if self.state == to {
            return;
        }
        self.history.push(CircuitTransition {
            at: now,
            phase,
            from: self.state,
            to,
            reason: reason.to_string(),
        });
        self.state = to;
    }
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or_default().trim()
}
