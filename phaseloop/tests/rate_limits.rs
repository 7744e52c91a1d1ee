//! Hourly call budget decisions and provider-overload cooldowns.

use anyhow::anyhow;
use phaseloop::control::{self, ControlError};
use phaseloop::core::metrics::keys;
use phaseloop::core::rate_limit::LimitDecision;
use phaseloop::core::report::WorkerReport;
use phaseloop::core::session::ResumeRejection;
use phaseloop::core::types::SessionStatus;
use phaseloop::io::clock::{AbortSignal, Clock};
use phaseloop::io::config::LoopConfig;
use phaseloop::io::status_log::read_last_block;
use phaseloop::looping::{LoopStop, run_loop};
use phaseloop::orchestrator::{LoopDecision, Orchestrator};
use phaseloop::start::open_for_resume;
use phaseloop::test_support::{ManualClock, ScriptedWorker, TestHome, at, report};

const TARGET: &str = "crate://widget";

fn growing_reports(count: u64) -> ScriptedWorker {
    ScriptedWorker::new(
        (1..=count)
            .map(|n| Ok(report(&[(keys::TESTS_GENERATED, n)])))
            .collect(),
    )
}

fn limited(home: &TestHome, worker: ScriptedWorker) -> Orchestrator<ScriptedWorker, ManualClock> {
    let config = LoopConfig {
        max_calls_per_hour: 2,
        ..LoopConfig::default()
    };
    Orchestrator::new(
        home.store(),
        worker,
        ManualClock::new(at(0)),
        config,
        AbortSignal::new(),
    )
}

/// Runs until the hourly budget of two calls pauses the session.
fn run_into_limit(
    home: &TestHome,
    worker: ScriptedWorker,
) -> (Orchestrator<ScriptedWorker, ManualClock>, phaseloop::core::state::LoopState) {
    let mut state = home.create_session(TARGET);
    let orch = limited(home, worker);
    let outcome = run_loop(&orch, &mut state, None, |_, _| {}).expect("loop");
    assert_eq!(outcome.ticks_executed, 3);
    match outcome.stop {
        LoopStop::Paused { reason } => assert!(reason.contains("hourly call limit reached (2/2)"), "{reason}"),
        other => panic!("expected pause, got {other:?}"),
    }
    assert_eq!(orch.worker().requests().len(), 2);
    (orch, state)
}

/// Verifies a reached limit pauses for a decision and `wait` blocks the next
/// tick until the window resets.
#[test]
fn wait_decision_blocks_until_window_resets() {
    let home = TestHome::new();
    let store = home.store();
    let (orch, mut state) = run_into_limit(&home, growing_reports(3));
    assert!(state.rate_limit.awaiting_decision());
    assert_eq!(state.session.status, SessionStatus::Paused);

    let err = control::resume(&store, &mut state, at(10)).unwrap_err();
    assert_eq!(err.downcast_ref::<ControlError>(), Some(&ControlError::AwaitingDecision));

    control::decide_limit(&store, &mut state, LimitDecision::Wait, at(10)).expect("decide");
    assert_eq!(state.session.status, SessionStatus::Running);
    assert!(state.rate_limit.hourly.awaiting_reset);
    let last = read_last_block(&store.paths(&state.session.session_id).status_log_path)
        .expect("read")
        .expect("block");
    assert_eq!(last.recommendation, "CONTROL: hourly limit decision: wait");

    let outcome = orch.tick(&mut state).expect("tick");
    assert_eq!(outcome.decision, LoopDecision::Continue);
    assert!(outcome.worker_invoked);
    assert_eq!(orch.clock().now(), at(3600));
    assert_eq!(state.rate_limit.hourly.window_start, at(3600));
    assert_eq!(state.rate_limit.hourly.calls_made, 1);
    assert!(!state.rate_limit.hourly.awaiting_reset);
    assert_eq!(orch.worker().requests().len(), 3);
}

/// Verifies `override` lets calls continue past the ceiling in the same
/// window.
#[test]
fn override_decision_continues_immediately() {
    let home = TestHome::new();
    let store = home.store();
    let (orch, mut state) = run_into_limit(&home, growing_reports(3));

    control::decide_limit(&store, &mut state, LimitDecision::Override, at(10)).expect("decide");
    let outcome = orch.tick(&mut state).expect("tick");
    assert!(outcome.worker_invoked);
    assert_eq!(orch.clock().now(), at(0));
    assert_eq!(state.rate_limit.hourly.calls_made, 3);
    assert!(state.rate_limit.hourly.override_active);

    let err = control::decide_limit(&store, &mut state, LimitDecision::Wait, at(20)).unwrap_err();
    assert_eq!(err.downcast_ref::<ControlError>(), Some(&ControlError::NoPendingDecision));
}

/// Verifies `abort` at the limit halts the session for good.
#[test]
fn abort_decision_halts_session() {
    let home = TestHome::new();
    let store = home.store();
    let (_orch, mut state) = run_into_limit(&home, growing_reports(2));

    control::decide_limit(&store, &mut state, LimitDecision::Abort, at(10)).expect("decide");
    assert_eq!(state.session.status, SessionStatus::Halted);
    let reason = state.session.halt_reason.clone().expect("halt reason");
    assert!(reason.starts_with("aborted at hourly limit: hourly call limit reached"), "{reason}");

    let err = open_for_resume(&store, &state.session.session_id, TARGET).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ResumeRejection>(),
        Some(ResumeRejection::Terminal { .. })
    ));
}

/// Verifies an overload report opens a cooldown without touching progress,
/// and the next tick waits it out before calling the worker again.
#[test]
fn overload_report_cools_down_then_retries_same_iteration() {
    let home = TestHome::new();
    let store = home.store();
    let mut state = home.create_session(TARGET);
    let overloaded = WorkerReport {
        provider_overloaded: true,
        ..WorkerReport::default()
    };
    let worker = ScriptedWorker::new(vec![
        Ok(overloaded),
        Ok(report(&[(keys::TESTS_GENERATED, 2)])),
    ]);
    let orch = Orchestrator::new(
        store.clone(),
        worker,
        ManualClock::new(at(0)),
        LoopConfig::default(),
        AbortSignal::new(),
    );

    let outcome = orch.tick(&mut state).expect("overloaded tick");
    assert_eq!(outcome.decision, LoopDecision::Continue);
    assert!(outcome.overloaded);
    assert!(outcome.gates.is_none());
    assert_eq!(state.session.current_iteration, 0);
    assert_eq!(state.breaker.no_progress_count, 0);
    assert!(state.rate_limit.cooldown.waiting);
    assert_eq!(state.rate_limit.cooldown.resume_at, Some(at(3600)));
    let last = read_last_block(&store.paths(&state.session.session_id).status_log_path)
        .expect("read")
        .expect("block");
    assert!(last.recommendation.starts_with("COOLDOWN:"), "{}", last.recommendation);

    let outcome = orch.tick(&mut state).expect("retry tick");
    assert!(!outcome.overloaded);
    assert!(outcome.progress);
    assert_eq!(orch.clock().now(), at(3600));
    assert!(!state.rate_limit.cooldown.waiting);
    let iterations: Vec<u32> = orch.worker().requests().iter().map(|r| r.iteration).collect();
    assert_eq!(iterations, vec![0, 0]);
    assert_eq!(state.session.current_iteration, 1);
}

/// Verifies overload text in a failed worker call is treated like an
/// explicit overload flag.
#[test]
fn overload_error_text_opens_cooldown() {
    let home = TestHome::new();
    let mut state = home.create_session(TARGET);
    let worker = ScriptedWorker::new(vec![Err(anyhow!("API Error: 529 overloaded_error"))]);
    let orch = Orchestrator::new(
        home.store(),
        worker,
        ManualClock::new(at(0)),
        LoopConfig::default(),
        AbortSignal::new(),
    );

    let outcome = orch.tick(&mut state).expect("tick");
    assert!(outcome.overloaded);
    assert!(state.rate_limit.cooldown.waiting);
    assert!(state.session.error_history.is_empty());
    assert_eq!(state.rate_limit.hourly.calls_made, 1);
}
