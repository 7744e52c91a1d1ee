//! Creating sessions and reopening them for another run.
//!
//! A session is created once per target and owns its own directory under
//! `<home>/sessions/`. Reopening never repairs anything: a record that fails
//! to load or validate makes the session invalid for resume and the operator
//! starts a fresh one.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::core::session::validate_for_resume;
use crate::core::state::LoopState;
use crate::io::config::LoopConfig;
use crate::io::status_log::{StatusBlock, append_block};
use crate::io::store::{SessionStore, generate_session_id};

/// Create and persist a new session for `target`.
pub fn start_session(
    store: &SessionStore,
    config: &LoopConfig,
    target: &str,
    now: DateTime<Utc>,
) -> Result<LoopState> {
    let target = target.trim();
    anyhow::ensure!(!target.is_empty(), "target must not be empty");

    let mut session_id = generate_session_id(now);
    while store.exists(&session_id) {
        session_id = generate_session_id(now);
    }
    let mut state = LoopState::new(
        session_id,
        target.to_string(),
        config.max_calls_per_hour,
        now,
    );
    let paths = store.create(&mut state)?;

    let block = StatusBlock::capture(
        &state,
        None,
        None,
        None,
        &format!("session created; start {}", state.session.current_phase),
        now,
    );
    append_block(&paths.status_log_path, &block)?;
    info!(session_id = %state.session.session_id, target, "session started");
    Ok(state)
}

/// Load a persisted session and check it may be resumed for `target`.
pub fn open_for_resume(store: &SessionStore, session_id: &str, target: &str) -> Result<LoopState> {
    let state = store
        .load(session_id)
        .with_context(|| format!("session {session_id} is invalid for resume"))?;
    validate_for_resume(&state.session, &state.breaker, target)
        .with_context(|| format!("session {session_id} is invalid for resume"))?;
    debug!(
        session_id,
        phase = %state.session.current_phase,
        iteration = state.session.current_iteration,
        "session reopened"
    );
    Ok(state)
}
