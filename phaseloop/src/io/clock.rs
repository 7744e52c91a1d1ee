//! Wall-clock access and cancellable waits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

/// Source of the current time. Production uses [`SystemClock`]; tests use a
/// manual clock so deadlines can be crossed deterministically.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Shared abort request, set by a signal handler or an embedding caller and
/// observed by the loop at its safe checkpoints.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached,
    Aborted,
}

/// Block until `deadline`, sleeping at most `poll` at a time so an abort is
/// noticed promptly.
pub fn wait_until<C: Clock>(
    clock: &C,
    deadline: DateTime<Utc>,
    abort: &AbortSignal,
    poll: Duration,
) -> WaitOutcome {
    debug!(%deadline, "waiting for deadline");
    loop {
        if abort.is_requested() {
            return WaitOutcome::Aborted;
        }
        let now = clock.now();
        if now >= deadline {
            return WaitOutcome::Reached;
        }
        let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        clock.sleep(remaining.min(poll));
    }
}
