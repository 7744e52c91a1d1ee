//! The four records that make up one session's persisted state.

use chrono::{DateTime, Utc};

use crate::core::circuit_breaker::CircuitBreakerState;
use crate::core::metrics::MetricsStore;
use crate::core::rate_limit::RateLimitState;
use crate::core::session::Session;

/// Session, breaker, limiter and metrics, committed together under one
/// shared revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    pub session: Session,
    pub breaker: CircuitBreakerState,
    pub rate_limit: RateLimitState,
    pub metrics: MetricsStore,
}

impl LoopState {
    /// Fresh state for a new session; all sub-states are created together.
    pub fn new(session_id: String, target: String, calls_per_hour: u32, now: DateTime<Utc>) -> Self {
        Self {
            session: Session::new(session_id, target, now),
            breaker: CircuitBreakerState::default(),
            rate_limit: RateLimitState::new(calls_per_hour, now),
            metrics: MetricsStore::default(),
        }
    }

    pub fn revision(&self) -> u64 {
        self.session.revision
    }

    /// Stamp every record with the next revision before a commit.
    pub fn bump_revision(&mut self) -> u64 {
        let next = self.session.revision + 1;
        self.session.revision = next;
        self.breaker.revision = next;
        self.rate_limit.revision = next;
        self.metrics.revision = next;
        next
    }

    /// Revisions that disagree with the session's, by record name.
    pub fn revision_mismatches(&self) -> Vec<String> {
        let expected = self.session.revision;
        [
            ("circuit_breaker", self.breaker.revision),
            ("rate_limit", self.rate_limit.revision),
            ("metrics", self.metrics.revision),
        ]
        .into_iter()
        .filter(|(_, revision)| *revision != expected)
        .map(|(name, revision)| format!("{name} revision {revision} != session revision {expected}"))
        .collect()
    }

    /// Re-initialize breaker and limiter as a unit (manual reset).
    pub fn reset_guards(&mut self, reason: &str, now: DateTime<Utc>) {
        let phase = self.session.current_phase;
        self.breaker.reset(phase, reason, now);
        let limit = self.rate_limit.hourly.limit;
        self.rate_limit = RateLimitState {
            revision: self.rate_limit.revision,
            ..RateLimitState::new(limit, now)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CircuitState;
    use crate::test_support::at;

    #[test]
    fn bump_revision_stamps_every_record() {
        let mut state = LoopState::new("s".into(), "t".into(), 10, at(0));
        assert_eq!(state.bump_revision(), 1);
        assert!(state.revision_mismatches().is_empty());

        state.metrics.revision = 0;
        let mismatches = state.revision_mismatches();
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].starts_with("metrics"));
    }

    #[test]
    fn reset_guards_reinitializes_breaker_and_limiter_together() {
        let mut state = LoopState::new("s".into(), "t".into(), 10, at(0));
        state.bump_revision();
        state.breaker.state = CircuitState::Open;
        state.breaker.no_progress_count = 3;
        state.rate_limit.hourly.calls_made = 10;
        state.rate_limit.open_cooldown(at(5), "overloaded");

        state.reset_guards("operator", at(100));

        assert_eq!(state.breaker.state, CircuitState::Closed);
        assert_eq!(state.breaker.no_progress_count, 0);
        assert_eq!(state.rate_limit.hourly.calls_made, 0);
        assert_eq!(state.rate_limit.hourly.limit, 10);
        assert_eq!(state.rate_limit.hourly.window_start, at(100));
        assert!(!state.rate_limit.cooldown.waiting);
        assert!(state.revision_mismatches().is_empty());
    }
}
