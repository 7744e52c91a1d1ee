//! Operator actions on a persisted session.
//!
//! Each action validates against the loaded state, mutates it, commits the
//! bundle and appends a `CONTROL:` status block.

use anyhow::Result;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, instrument};

use crate::core::rate_limit::LimitDecision;
use crate::core::session::PhaseChange;
use crate::core::state::LoopState;
use crate::core::types::SessionStatus;
use crate::io::status_log::{CONTROL_PREFIX, StatusBlock, append_block};
use crate::io::store::SessionStore;

/// An action that does not apply to the session's current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("session is completed; start a new session")]
    Completed,
    #[error("session is {status}; {action} needs a {expected} session")]
    WrongStatus {
        action: &'static str,
        status: SessionStatus,
        expected: &'static str,
    },
    #[error("circuit breaker is open ({reason}); reset before skipping")]
    CircuitOpen { reason: String },
    #[error("hourly limit awaits a decision; run `decide wait|override|abort`")]
    AwaitingDecision,
    #[error("no hourly limit decision is pending")]
    NoPendingDecision,
    #[error("{action} requires a reason")]
    MissingReason { action: &'static str },
}

/// Clear the breaker and limiter as a unit and reopen a halted session.
#[instrument(skip_all, fields(session_id = %state.session.session_id))]
pub fn reset(store: &SessionStore, state: &mut LoopState, reason: &str, now: DateTime<Utc>) -> Result<()> {
    if state.session.status == SessionStatus::Completed {
        return Err(ControlError::Completed.into());
    }
    let reason = reason_or(reason, "manual reset");
    let was_halted = state.session.status == SessionStatus::Halted;
    state.session.reopen(now)?;
    state.reset_guards(&reason, now);
    state.session.last_activity = now;
    info!(was_halted, "breaker and rate limiter reset");
    commit(store, state, &format!("reset ({reason})"), now)
}

/// Force the current phase to complete without consulting the gates.
#[instrument(skip_all, fields(session_id = %state.session.session_id))]
pub fn skip_phase(
    store: &SessionStore,
    state: &mut LoopState,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<PhaseChange> {
    let reason = required_reason("skip", reason)?;
    ensure_not_terminal("skip", state)?;
    if state.breaker.is_open() {
        return Err(ControlError::CircuitOpen {
            reason: state.breaker.open_reason.clone().unwrap_or_default(),
        }
        .into());
    }
    let change = state.session.force_skip(&reason, now)?;
    state.breaker.on_phase_change(change.from, change.to, now);
    let next = change.to.map_or("completion".to_string(), |p| p.to_string());
    info!(from = %change.from, to = %next, "phase skipped");
    commit(
        store,
        state,
        &format!("forced skip of {} to {next} ({reason})", change.from),
        now,
    )?;
    Ok(change)
}

/// Terminate the session as halted.
#[instrument(skip_all, fields(session_id = %state.session.session_id))]
pub fn abort(store: &SessionStore, state: &mut LoopState, reason: &str, now: DateTime<Utc>) -> Result<()> {
    let reason = required_reason("abort", reason)?;
    ensure_not_terminal("abort", state)?;
    state
        .session
        .set_status(SessionStatus::Halted, Some(format!("aborted: {reason}")), now)?;
    info!("session aborted");
    commit(store, state, &format!("aborted ({reason})"), now)
}

#[instrument(skip_all, fields(session_id = %state.session.session_id))]
pub fn pause(store: &SessionStore, state: &mut LoopState, reason: &str, now: DateTime<Utc>) -> Result<()> {
    let reason = required_reason("pause", reason)?;
    if state.session.status != SessionStatus::Running {
        return Err(ControlError::WrongStatus {
            action: "pause",
            status: state.session.status,
            expected: "running",
        }
        .into());
    }
    state
        .session
        .set_status(SessionStatus::Paused, Some(reason.clone()), now)?;
    commit(store, state, &format!("paused ({reason})"), now)
}

/// Return a paused session to running. Phase and iteration are untouched.
#[instrument(skip_all, fields(session_id = %state.session.session_id))]
pub fn resume(store: &SessionStore, state: &mut LoopState, now: DateTime<Utc>) -> Result<()> {
    if state.session.status != SessionStatus::Paused {
        return Err(ControlError::WrongStatus {
            action: "resume",
            status: state.session.status,
            expected: "paused",
        }
        .into());
    }
    // A window that rolled over since the pause no longer needs a decision.
    state.rate_limit.refresh(now);
    if state.rate_limit.awaiting_decision() {
        return Err(ControlError::AwaitingDecision.into());
    }
    state.session.set_status(SessionStatus::Running, None, now)?;
    commit(store, state, "resumed", now)
}

/// Answer a reached hourly limit. `wait` and `override` resume the session;
/// `abort` halts it.
#[instrument(skip_all, fields(session_id = %state.session.session_id, decision = %decision))]
pub fn decide_limit(
    store: &SessionStore,
    state: &mut LoopState,
    decision: LimitDecision,
    now: DateTime<Utc>,
) -> Result<()> {
    if !state.rate_limit.awaiting_decision() {
        return Err(ControlError::NoPendingDecision.into());
    }
    ensure_not_terminal("decide", state)?;
    let limit_reason = state.rate_limit.pause_reason.clone().unwrap_or_default();
    state.rate_limit.apply_decision(decision);
    match decision {
        LimitDecision::Abort => {
            state.session.set_status(
                SessionStatus::Halted,
                Some(format!("aborted at hourly limit: {limit_reason}")),
                now,
            )?;
        }
        LimitDecision::Wait | LimitDecision::Override => {
            if state.session.status == SessionStatus::Paused {
                state.session.set_status(SessionStatus::Running, None, now)?;
            }
        }
    }
    info!("hourly limit decision recorded");
    commit(store, state, &format!("hourly limit decision: {decision}"), now)
}

fn ensure_not_terminal(action: &'static str, state: &LoopState) -> Result<(), ControlError> {
    match state.session.status {
        SessionStatus::Completed => Err(ControlError::Completed),
        SessionStatus::Halted => Err(ControlError::WrongStatus {
            action,
            status: SessionStatus::Halted,
            expected: "running or paused",
        }),
        SessionStatus::Running | SessionStatus::Paused => Ok(()),
    }
}

fn required_reason(action: &'static str, reason: &str) -> Result<String, ControlError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(ControlError::MissingReason { action });
    }
    Ok(reason.to_string())
}

fn reason_or(reason: &str, fallback: &str) -> String {
    let reason = reason.trim();
    if reason.is_empty() {
        fallback.to_string()
    } else {
        reason.to_string()
    }
}

fn commit(store: &SessionStore, state: &mut LoopState, action: &str, now: DateTime<Utc>) -> Result<()> {
    store.save(state)?;
    let block = StatusBlock::capture(
        state,
        state.metrics.latest(state.session.current_phase),
        None,
        None,
        &format!("{CONTROL_PREFIX} {action}"),
        now,
    );
    append_block(&store.paths(&state.session.session_id).status_log_path, &block)
}
