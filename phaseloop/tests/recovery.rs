//! Interrupted commits, shutdown requests and manual recovery.

use std::fs;
use std::path::Path;

use phaseloop::control::{self, ControlError};
use phaseloop::core::metrics::keys;
use phaseloop::core::session::ResumeRejection;
use phaseloop::core::types::{CircuitState, Phase, SessionStatus};
use phaseloop::io::clock::AbortSignal;
use phaseloop::io::config::LoopConfig;
use phaseloop::io::paths::temp_path;
use phaseloop::io::status_log::read_last_block;
use phaseloop::io::store::StateCorruption;
use phaseloop::looping::{LoopStop, run_loop};
use phaseloop::orchestrator::{LoopDecision, Orchestrator, SHUTDOWN_REASON};
use phaseloop::start::open_for_resume;
use phaseloop::test_support::{ManualClock, ScriptedWorker, TestHome, at, report};
use serde::Serialize;

const TARGET: &str = "crate://widget";

fn orchestrator(home: &TestHome, worker: ScriptedWorker) -> Orchestrator<ScriptedWorker, ManualClock> {
    Orchestrator::new(
        home.store(),
        worker,
        ManualClock::new(at(0)),
        LoopConfig::default(),
        AbortSignal::new(),
    )
}

fn write_json(path: &Path, value: &impl Serialize) {
    fs::write(path, serde_json::to_vec_pretty(value).expect("serialize")).expect("write");
}

/// Verifies a commit interrupted halfway through promotion is rolled forward
/// on the next load and the loop continues from the new revision.
#[test]
fn interrupted_promotion_rolls_forward_and_resumes() {
    let home = TestHome::new();
    let store = home.store();
    let mut state = home.create_session(TARGET);
    let orch = orchestrator(&home, ScriptedWorker::repeating(report(&[(keys::TESTS_GENERATED, 2)]), 1));
    orch.tick(&mut state).expect("tick");
    let committed = state.revision();

    // Next revision: every temp written, only the breaker promoted.
    let mut next = state.clone();
    next.session.increment_iteration(at(30)).expect("increment");
    next.bump_revision();
    let paths = store.paths(&state.session.session_id);
    write_json(&temp_path(&paths.circuit_breaker_path), &next.breaker);
    write_json(&temp_path(&paths.rate_limit_path), &next.rate_limit);
    write_json(&temp_path(&paths.metrics_path), &next.metrics);
    write_json(&temp_path(&paths.session_path), &next.session);
    fs::rename(temp_path(&paths.circuit_breaker_path), &paths.circuit_breaker_path)
        .expect("promote breaker");

    let mut reopened = open_for_resume(&store, &state.session.session_id, TARGET).expect("reopen");
    assert_eq!(reopened.revision(), committed + 1);
    assert_eq!(reopened.session.current_iteration, 2);
    assert!(!temp_path(&paths.session_path).exists());

    let orch = orchestrator(&home, ScriptedWorker::repeating(report(&[(keys::TESTS_GENERATED, 4)]), 1));
    let outcome = orch.tick(&mut reopened).expect("tick after recovery");
    assert_eq!(outcome.decision, LoopDecision::Continue);
    assert_eq!(outcome.iteration, 2);
    assert!(outcome.progress);
    assert_eq!(reopened.revision(), committed + 2);
}

/// Verifies a crash before the session temp was complete leaves the last
/// committed revision in force.
#[test]
fn incomplete_commit_is_discarded() {
    let home = TestHome::new();
    let store = home.store();
    let state = home.create_session(TARGET);
    let paths = store.paths(&state.session.session_id);

    let mut next = state.clone();
    next.breaker.no_progress_count = 2;
    next.bump_revision();
    write_json(&temp_path(&paths.circuit_breaker_path), &next.breaker);
    fs::write(temp_path(&paths.session_path), b"{\"session_id\": \"trunc").expect("write");

    let reopened = open_for_resume(&store, &state.session.session_id, TARGET).expect("reopen");
    assert_eq!(reopened, state);
    assert!(!temp_path(&paths.circuit_breaker_path).exists());
}

/// Verifies records from different revisions make the session invalid for
/// resume instead of being repaired.
#[test]
fn mixed_revisions_are_rejected() {
    let home = TestHome::new();
    let store = home.store();
    let state = home.create_session(TARGET);
    let paths = store.paths(&state.session.session_id);

    let mut stale = state.rate_limit.clone();
    stale.revision += 5;
    write_json(&paths.rate_limit_path, &stale);

    let err = open_for_resume(&store, &state.session.session_id, TARGET).unwrap_err();
    let corruption = err.downcast_ref::<StateCorruption>().expect("corruption");
    assert!(corruption.detail.contains("rate_limit revision"));
    assert!(format!("{err:#}").contains("invalid for resume"));
}

/// Verifies a shutdown request during a worker call discards the report,
/// pauses the session, and that an operator resume lets the loop continue.
#[test]
fn shutdown_pauses_then_resume_continues() {
    let home = TestHome::new();
    let store = home.store();
    let mut state = home.create_session(TARGET);
    let abort = AbortSignal::new();
    let worker = ScriptedWorker::repeating(report(&[(keys::TESTS_GENERATED, 3)]), 1)
        .abort_after_call(abort.clone());
    let orch = Orchestrator::new(
        store.clone(),
        worker,
        ManualClock::new(at(0)),
        LoopConfig::default(),
        abort,
    );

    let outcome = run_loop(&orch, &mut state, None, |_, _| {}).expect("loop");
    assert_eq!(
        outcome.stop,
        LoopStop::Paused {
            reason: SHUTDOWN_REASON.to_string()
        }
    );
    assert_eq!(state.session.status, SessionStatus::Paused);
    assert_eq!(state.session.current_iteration, 0);
    assert_eq!(state.rate_limit.hourly.calls_made, 1);
    assert!(state.metrics.latest(Phase::GenerateTests).is_none());
    assert_eq!(state.breaker.no_progress_count, 0);

    let err = orch.tick(&mut state).unwrap_err();
    assert!(format!("{err:#}").contains("resume it first"));

    let mut reopened = open_for_resume(&store, &state.session.session_id, TARGET).expect("reopen");
    assert_eq!(reopened, state);
    control::resume(&store, &mut reopened, at(10)).expect("resume");
    assert_eq!(reopened.session.status, SessionStatus::Running);
    let last = read_last_block(&store.paths(&reopened.session.session_id).status_log_path)
        .expect("read")
        .expect("block");
    assert_eq!(last.recommendation, "CONTROL: resumed");

    let orch = orchestrator(&home, ScriptedWorker::repeating(report(&[(keys::TESTS_GENERATED, 3)]), 1));
    let outcome = orch.tick(&mut reopened).expect("tick");
    assert_eq!(outcome.decision, LoopDecision::Continue);
    assert!(outcome.progress);
    assert_eq!(reopened.session.current_iteration, 1);
}

/// Verifies a halted session is refused until a manual reset clears the
/// breaker.
#[test]
fn breaker_halt_requires_manual_reset() {
    let home = TestHome::new();
    let store = home.store();
    let mut state = home.create_session(TARGET);
    let orch = orchestrator(&home, ScriptedWorker::repeating(report(&[(keys::TESTS_GENERATED, 0)]), 3));
    let outcome = run_loop(&orch, &mut state, None, |_, _| {}).expect("loop");
    assert!(matches!(outcome.stop, LoopStop::Halted { .. }));

    let id = state.session.session_id.clone();
    let err = open_for_resume(&store, &id, TARGET).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ResumeRejection>(),
        Some(ResumeRejection::Terminal {
            status: SessionStatus::Halted
        })
    ));

    let err = control::skip_phase(&store, &mut state, "move on", at(20)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ControlError>(),
        Some(ControlError::WrongStatus { action: "skip", .. })
    ));

    control::reset(&store, &mut state, "fixture repaired", at(30)).expect("reset");
    assert_eq!(state.session.status, SessionStatus::Running);
    assert_eq!(state.breaker.state, CircuitState::Closed);
    assert_eq!(state.breaker.no_progress_count, 0);
    assert_eq!(state.rate_limit.hourly.calls_made, 0);
    assert_eq!(state.session.current_phase, Phase::GenerateTests);

    let mut reopened = open_for_resume(&store, &id, TARGET).expect("reopen after reset");
    let last = read_last_block(&store.paths(&id).status_log_path)
        .expect("read")
        .expect("block");
    assert_eq!(last.recommendation, "CONTROL: reset (fixture repaired)");
    assert_eq!(last.circuit_breaker, CircuitState::Closed);

    let orch = orchestrator(&home, ScriptedWorker::repeating(report(&[(keys::TESTS_GENERATED, 4)]), 1));
    let outcome = orch.tick(&mut reopened).expect("tick");
    assert!(outcome.progress);
    assert_eq!(outcome.circuit, CircuitState::Closed);
}

/// Verifies an operator skip advances the phase and the next request targets
/// the new phase.
#[test]
fn skip_advances_to_next_phase() {
    let home = TestHome::new();
    let store = home.store();
    let mut state = home.create_session(TARGET);

    let change = control::skip_phase(&store, &mut state, "tests exist already", at(5)).expect("skip");
    assert_eq!(change.from, Phase::GenerateTests);
    assert_eq!(change.to, Some(Phase::Implement));

    let mut reopened = open_for_resume(&store, &state.session.session_id, TARGET).expect("reopen");
    let orch = orchestrator(&home, ScriptedWorker::repeating(report(&[(keys::TESTS_PASSING, 1)]), 1));
    orch.tick(&mut reopened).expect("tick");
    let requests = orch.worker().requests();
    assert_eq!(requests[0].phase, Phase::Implement);
    assert_eq!(requests[0].iteration, 0);
}
