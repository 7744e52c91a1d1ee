//! Multi-tick driver for `phaseloop run`.

use anyhow::Result;
use tracing::{debug, info};

use crate::core::state::LoopState;
use crate::io::clock::Clock;
use crate::io::worker::PhaseWorker;
use crate::orchestrator::{LoopDecision, Orchestrator, TickOutcome};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every phase exited.
    Complete,
    /// The session halted (breaker open, operator abort).
    Halted { reason: String },
    /// The session paused (hourly limit, shutdown request).
    Paused { reason: String },
    /// The caller's tick budget ran out while the session was still running.
    MaxTicks { max_ticks: u32 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub session_id: String,
    pub ticks_executed: u32,
    pub stop: LoopStop,
}

/// Tick until the session completes, halts or pauses, or `max_ticks` ticks
/// have run.
///
/// Errors from a tick stop the loop immediately; the last committed revision
/// stays on disk.
pub fn run_loop<W, C, F>(
    orchestrator: &Orchestrator<W, C>,
    state: &mut LoopState,
    max_ticks: Option<u32>,
    mut on_tick: F,
) -> Result<LoopOutcome>
where
    W: PhaseWorker,
    C: Clock,
    F: FnMut(&TickOutcome, &LoopState),
{
    let session_id = state.session.session_id.clone();
    let mut ticks_executed = 0u32;
    loop {
        if let Some(max_ticks) = max_ticks
            && ticks_executed >= max_ticks
        {
            info!(session_id, max_ticks, "tick budget exhausted");
            return Ok(LoopOutcome {
                session_id,
                ticks_executed,
                stop: LoopStop::MaxTicks { max_ticks },
            });
        }

        let outcome = orchestrator.tick(state)?;
        ticks_executed += 1;
        on_tick(&outcome, state);
        debug!(ticks_executed, decision = ?outcome.decision, "tick finished");

        let stop = match outcome.decision {
            LoopDecision::Continue | LoopDecision::Transition { .. } => continue,
            LoopDecision::Complete => LoopStop::Complete,
            LoopDecision::Halt { reason } => LoopStop::Halted { reason },
            LoopDecision::Pause { reason } => LoopStop::Paused { reason },
        };
        info!(session_id, ?stop, "loop stopped");
        return Ok(LoopOutcome {
            session_id,
            ticks_executed,
            stop,
        });
    }
}
