//! One orchestration tick: limiter, breaker, worker, metrics, gates, session.
//!
//! Every tick ends with a full commit of the session bundle and one status
//! block, so a killed process always resumes from a consistent revision.

use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::circuit_breaker::error_hash;
use crate::core::gate::{GateEvaluation, evaluate};
use crate::core::metrics::MetricsSnapshot;
use crate::core::progress::detect_progress;
use crate::core::rate_limit::Permit;
use crate::core::report::{WorkerReport, WorkerRequest};
use crate::core::state::LoopState;
use crate::core::types::{CircuitState, Phase, SessionStatus};
use crate::io::clock::{AbortSignal, Clock, WaitOutcome, wait_until};
use crate::io::config::LoopConfig;
use crate::io::status_log::{StatusBlock, append_block};
use crate::io::store::SessionStore;
use crate::io::worker::PhaseWorker;

/// Pause reason recorded when an abort signal is honored.
pub const SHUTDOWN_REASON: &str = "shutdown requested";

/// Appended to a tick's recommendation when gate 2 was computed by the worker.
pub const DERIVED_EXIT_MARKER: &str = "(exit signal derived from metrics)";

/// What the loop should do after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopDecision {
    /// Stay in the current phase.
    Continue,
    Transition { from: Phase, to: Phase },
    /// The last phase exited.
    Complete,
    Pause { reason: String },
    Halt { reason: String },
}

impl LoopDecision {
    /// True when the loop must stop ticking.
    pub fn stops(&self) -> bool {
        matches!(
            self,
            LoopDecision::Complete | LoopDecision::Pause { .. } | LoopDecision::Halt { .. }
        )
    }
}

/// Result of a single tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub decision: LoopDecision,
    /// Phase and iteration the tick worked on.
    pub phase: Phase,
    pub iteration: u32,
    pub worker_invoked: bool,
    pub overloaded: bool,
    pub progress: bool,
    pub circuit: CircuitState,
    pub gates: Option<GateEvaluation>,
}

impl TickOutcome {
    fn without_work(state: &LoopState, decision: LoopDecision) -> Self {
        Self {
            decision,
            phase: state.session.current_phase,
            iteration: state.session.current_iteration,
            worker_invoked: false,
            overloaded: false,
            progress: false,
            circuit: state.breaker.state,
            gates: None,
        }
    }
}

/// Drives ticks for one session.
pub struct Orchestrator<W: PhaseWorker, C: Clock> {
    store: SessionStore,
    worker: W,
    clock: C,
    config: LoopConfig,
    abort: AbortSignal,
}

impl<W: PhaseWorker, C: Clock> Orchestrator<W, C> {
    pub fn new(store: SessionStore, worker: W, clock: C, config: LoopConfig, abort: AbortSignal) -> Self {
        Self {
            store,
            worker,
            clock,
            config,
            abort,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Run one tick against `state`, persisting the result.
    #[instrument(skip_all, fields(session_id = %state.session.session_id, phase = %state.session.current_phase, iteration = state.session.current_iteration))]
    pub fn tick(&self, state: &mut LoopState) -> Result<TickOutcome> {
        match state.session.status {
            SessionStatus::Running => {}
            SessionStatus::Completed => {
                return Ok(TickOutcome::without_work(state, LoopDecision::Complete));
            }
            SessionStatus::Halted => {
                let reason = state
                    .session
                    .halt_reason
                    .clone()
                    .unwrap_or_else(|| "halted".to_string());
                return Ok(TickOutcome::without_work(state, LoopDecision::Halt { reason }));
            }
            SessionStatus::Paused => {
                return Err(anyhow!(
                    "session {} is paused ({}); resume it first",
                    state.session.session_id,
                    state.session.pause_reason.as_deref().unwrap_or("no reason recorded")
                ));
            }
        }

        if self.abort.is_requested() {
            return self.pause(state, SHUTDOWN_REASON, self.clock.now());
        }

        state.rate_limit.set_limit(self.config.max_calls_per_hour);
        if let Some(outcome) = self.acquire_permit(state)? {
            return Ok(outcome);
        }

        let now = self.clock.now();
        if state.breaker.is_open() {
            let reason = state
                .breaker
                .open_reason
                .clone()
                .unwrap_or_else(|| "circuit breaker open".to_string());
            return self.halt(state, &reason, None, None, now);
        }

        let phase = state.session.current_phase;
        let iteration = state.session.current_iteration;
        let request = WorkerRequest {
            session_id: state.session.session_id.clone(),
            target: state.session.target.clone(),
            phase,
            iteration,
            prior_metrics: state.metrics.latest(phase).cloned(),
        };
        let result = self.worker.invoke(&request);
        state.rate_limit.record_call();
        let now = self.clock.now();

        if self.abort.is_requested() {
            info!("abort requested during worker call; discarding report");
            return self.pause(state, SHUTDOWN_REASON, now);
        }

        let report = match result {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "worker invocation failed");
                WorkerReport {
                    error: Some(format!("worker failed: {err:#}")),
                    ..WorkerReport::default()
                }
            }
        };

        if report.indicates_overload() {
            return self.cool_down(state, &report, now);
        }
        self.ingest(state, phase, iteration, &report, now)
    }

    /// Wait out cooldowns and hourly resets. Returns an outcome when the tick
    /// must end without invoking the worker.
    fn acquire_permit(&self, state: &mut LoopState) -> Result<Option<TickOutcome>> {
        let poll = Duration::from_millis(self.config.wait_poll_millis);
        loop {
            let now = self.clock.now();
            let deadline = match state.rate_limit.check(now) {
                Permit::Granted => return Ok(None),
                Permit::Cooldown { resume_at } => {
                    info!(%resume_at, "provider cooldown active; waiting");
                    resume_at
                }
                Permit::AwaitReset { next_reset } => {
                    info!(%next_reset, "hourly limit reached; waiting for reset");
                    next_reset
                }
                Permit::LimitReached {
                    calls_made, limit, ..
                } => {
                    let reason = state.rate_limit.pause_reason.clone().unwrap_or_else(|| {
                        format!("hourly call limit reached ({calls_made}/{limit})")
                    });
                    warn!(calls_made, limit, "hourly call limit reached; pausing for a decision");
                    return self.pause(state, &reason, now).map(Some);
                }
            };
            self.store.save(state)?;
            if wait_until(&self.clock, deadline, &self.abort, poll) == WaitOutcome::Aborted {
                return self.pause(state, SHUTDOWN_REASON, self.clock.now()).map(Some);
            }
        }
    }

    fn cool_down(&self, state: &mut LoopState, report: &WorkerReport, now: DateTime<Utc>) -> Result<TickOutcome> {
        let reason = report
            .error_message()
            .unwrap_or("provider overloaded")
            .to_string();
        state.rate_limit.open_cooldown(now, &reason);
        state.session.ticks += 1;
        state.session.last_activity = now;
        let resume_at = state.rate_limit.cooldown.resume_at.unwrap_or(now);
        warn!(%resume_at, "provider overload reported; cooling down");

        let recommendation = format!("COOLDOWN: provider overloaded; retrying after {}", resume_at.to_rfc3339());
        self.commit(state, None, None, report.exit_signal, &recommendation, now)?;
        Ok(TickOutcome {
            worker_invoked: true,
            overloaded: true,
            ..TickOutcome::without_work(state, LoopDecision::Continue)
        })
    }

    fn ingest(
        &self,
        state: &mut LoopState,
        phase: Phase,
        iteration: u32,
        report: &WorkerReport,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        // A failed call carries no metrics; it must not become the baseline.
        let snapshot = (!report.is_failure())
            .then(|| MetricsSnapshot::new(phase, iteration, now, report.metrics.clone()));
        let progress = snapshot
            .as_ref()
            .is_some_and(|snapshot| detect_progress(phase, snapshot, state.metrics.latest(phase)));
        if let Some(snapshot) = &snapshot {
            state.metrics.record(snapshot.clone());
        }

        state
            .breaker
            .record_progress(phase, progress, snapshot.as_ref(), now);
        if let Some(message) = report.error_message() {
            warn!(error = %message, "worker reported an error");
            let hash = error_hash(message);
            state
                .session
                .record_error(message, hash, self.config.error_history_cap, now);
            state.breaker.record_error(phase, message, now);
        }
        if state.breaker.state == CircuitState::HalfOpen {
            warn!(
                no_progress = state.breaker.no_progress_count,
                "circuit breaker half-open"
            );
        }

        let gates = snapshot
            .as_ref()
            .map(|snapshot| evaluate(phase, snapshot, report.exit_signal(), now));
        if let Some(gates) = &gates {
            if gates.premature_exit_signal() {
                warn!(unmet = ?gates.unmet, "worker asserted exit before the objective gate passed");
            }
            if gates.gate_2_derived {
                warn!("exit signal was derived from metrics rather than asserted independently");
            }
        }
        state.session.ticks += 1;
        if let Some(snapshot) = &snapshot {
            self.store.append_metrics_history(&state.session.session_id, snapshot)?;
        }

        if state.breaker.is_open() {
            let reason = state
                .breaker
                .open_reason
                .clone()
                .unwrap_or_else(|| "circuit breaker open".to_string());
            let tick = gates.as_ref().map(|gates| (gates, report));
            let mut outcome = self.halt(state, &reason, snapshot.as_ref(), tick, now)?;
            outcome.phase = phase;
            outcome.iteration = iteration;
            outcome.worker_invoked = true;
            outcome.progress = progress;
            outcome.gates = gates;
            return Ok(outcome);
        }

        let can_exit = gates.as_ref().is_some_and(|gates| gates.can_exit);
        let (decision, mut recommendation) = if can_exit {
            let change = state
                .session
                .transition(true, now)?
                .ok_or_else(|| anyhow!("gates passed but the session did not transition"))?;
            state.breaker.on_phase_change(change.from, change.to, now);
            match change.to {
                Some(to) => {
                    info!(from = %change.from, to = %to, "phase transition");
                    (
                        LoopDecision::Transition {
                            from: change.from,
                            to,
                        },
                        format!("{} complete; advancing to {to}", change.from),
                    )
                }
                None => {
                    info!("all phases complete");
                    (LoopDecision::Complete, "all phases complete".to_string())
                }
            }
        } else {
            state.session.increment_iteration(now)?;
            let text = match &gates {
                Some(gates) => continue_recommendation(phase, gates, state.breaker.state),
                None => failure_recommendation(phase, report, state.breaker.state),
            };
            (LoopDecision::Continue, text)
        };
        if gates.as_ref().is_some_and(|gates| gates.gate_2_derived) {
            recommendation.push(' ');
            recommendation.push_str(DERIVED_EXIT_MARKER);
        }
        debug!(?decision, progress, "tick decided");

        self.commit(
            state,
            snapshot.as_ref(),
            gates.as_ref(),
            report.exit_signal,
            &recommendation,
            now,
        )?;
        Ok(TickOutcome {
            decision,
            phase,
            iteration,
            worker_invoked: true,
            overloaded: false,
            progress,
            circuit: state.breaker.state,
            gates,
        })
    }

    fn pause(&self, state: &mut LoopState, reason: &str, now: DateTime<Utc>) -> Result<TickOutcome> {
        info!(reason, "pausing session");
        state
            .session
            .set_status(SessionStatus::Paused, Some(reason.to_string()), now)?;
        self.commit(state, None, None, None, &format!("PAUSE: {reason}"), now)?;
        Ok(TickOutcome::without_work(
            state,
            LoopDecision::Pause {
                reason: reason.to_string(),
            },
        ))
    }

    fn halt(
        &self,
        state: &mut LoopState,
        reason: &str,
        snapshot: Option<&MetricsSnapshot>,
        tick: Option<(&GateEvaluation, &WorkerReport)>,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        warn!(reason, "halting session");
        state
            .session
            .set_status(SessionStatus::Halted, Some(reason.to_string()), now)?;
        let recommendation = format!("HALT: {reason}; reset, skip, or abort");
        self.commit(
            state,
            snapshot,
            tick.map(|(gates, _)| gates),
            tick.and_then(|(_, report)| report.exit_signal),
            &recommendation,
            now,
        )?;
        Ok(TickOutcome::without_work(
            state,
            LoopDecision::Halt {
                reason: reason.to_string(),
            },
        ))
    }

    fn commit(
        &self,
        state: &mut LoopState,
        snapshot: Option<&MetricsSnapshot>,
        gates: Option<&GateEvaluation>,
        exit_signal: Option<bool>,
        recommendation: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store.save(state)?;
        let block = StatusBlock::capture(state, snapshot, gates, exit_signal, recommendation, now);
        append_block(
            &self.store.paths(&state.session.session_id).status_log_path,
            &block,
        )
    }
}

fn failure_recommendation(phase: Phase, report: &WorkerReport, circuit: CircuitState) -> String {
    let mut text = format!(
        "continue {phase}: no metrics reported ({})",
        report.error_message().unwrap_or("worker failed")
    );
    if circuit == CircuitState::HalfOpen {
        text.push_str(" (circuit half-open)");
    }
    text
}

fn continue_recommendation(phase: Phase, gates: &GateEvaluation, circuit: CircuitState) -> String {
    let mut text = format!("continue {phase}");
    if !gates.unmet.is_empty() {
        text.push_str(": ");
        text.push_str(&gates.unmet.join("; "));
    }
    if gates.gate_1 && !gates.gate_2 {
        text.push_str(": objective gate met, waiting for exit signal");
    }
    if circuit == CircuitState::HalfOpen {
        text.push_str(" (circuit half-open)");
    }
    text
}
