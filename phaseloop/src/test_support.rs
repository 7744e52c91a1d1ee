//! Test helpers: fixed timestamps, metrics builders, a manual clock, a
//! scripted worker and a temporary session home.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use tempfile::TempDir;

use crate::core::metrics::{MetricValue, MetricsSnapshot};
use crate::core::report::{WorkerReport, WorkerRequest};
use crate::core::state::LoopState;
use crate::core::types::Phase;
use crate::io::clock::{AbortSignal, Clock};
use crate::io::config::LoopConfig;
use crate::io::store::SessionStore;
use crate::io::worker::PhaseWorker;
use crate::start::start_session;

/// 2026-01-01T00:00:00Z.
const BASE_TIMESTAMP: i64 = 1_767_225_600;

/// Deterministic timestamp `secs` seconds after a fixed base.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(BASE_TIMESTAMP + secs, 0).expect("valid timestamp")
}

fn counts(values: &[(&str, u64)]) -> BTreeMap<String, MetricValue> {
    values
        .iter()
        .map(|(key, value)| (key.to_string(), MetricValue::Count(*value)))
        .collect()
}

/// Snapshot with counter values, recorded at `at(iteration)`.
pub fn snapshot(phase: Phase, iteration: u32, values: &[(&str, u64)]) -> MetricsSnapshot {
    MetricsSnapshot::new(phase, iteration, at(i64::from(iteration)), counts(values))
}

/// Snapshot holding a single flag.
pub fn snapshot_with_flag(phase: Phase, iteration: u32, key: &str, value: bool) -> MetricsSnapshot {
    let mut values = BTreeMap::new();
    values.insert(key.to_string(), MetricValue::Flag(value));
    MetricsSnapshot::new(phase, iteration, at(i64::from(iteration)), values)
}

/// Report with counters and no exit assertion.
pub fn report(values: &[(&str, u64)]) -> WorkerReport {
    WorkerReport {
        metrics: counts(values),
        ..WorkerReport::default()
    }
}

/// Report with counters and an explicit exit assertion.
pub fn report_with_exit(values: &[(&str, u64)], exit_signal: bool) -> WorkerReport {
    WorkerReport {
        exit_signal: Some(exit_signal),
        ..report(values)
    }
}

/// Report with counters, flags and an optional exit assertion.
pub fn report_with_flags(
    values: &[(&str, u64)],
    flags: &[(&str, bool)],
    exit_signal: Option<bool>,
) -> WorkerReport {
    let mut metrics = counts(values);
    for (key, value) in flags {
        metrics.insert(key.to_string(), MetricValue::Flag(*value));
    }
    WorkerReport {
        metrics,
        exit_signal,
        ..WorkerReport::default()
    }
}

/// Clock that only moves when told to; `sleep` advances it instantly.
pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    pub fn advance(&self, delta: TimeDelta) {
        self.now.set(self.now.get() + delta);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        let delta = TimeDelta::from_std(duration).expect("sleep duration fits");
        self.advance(delta);
    }
}

/// Worker that replays a fixed queue of results and records every request.
pub struct ScriptedWorker {
    results: RefCell<VecDeque<Result<WorkerReport>>>,
    requests: RefCell<Vec<WorkerRequest>>,
    abort_after_call: Option<AbortSignal>,
}

impl ScriptedWorker {
    pub fn new(results: Vec<Result<WorkerReport>>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            requests: RefCell::new(Vec::new()),
            abort_after_call: None,
        }
    }

    /// Replay the same report `count` times.
    pub fn repeating(report: WorkerReport, count: usize) -> Self {
        Self::new((0..count).map(|_| Ok(report.clone())).collect())
    }

    /// Request an abort while the first call is "in flight".
    pub fn abort_after_call(mut self, abort: AbortSignal) -> Self {
        self.abort_after_call = Some(abort);
        self
    }

    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.borrow().clone()
    }
}

impl PhaseWorker for ScriptedWorker {
    fn invoke(&self, request: &WorkerRequest) -> Result<WorkerReport> {
        self.requests.borrow_mut().push(request.clone());
        let next = self
            .results
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("scripted worker exhausted")));
        if let Some(abort) = &self.abort_after_call {
            abort.request();
        }
        next
    }
}

/// Session home inside a temporary directory.
pub struct TestHome {
    dir: TempDir,
}

impl Default for TestHome {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHome {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn store(&self) -> SessionStore {
        SessionStore::new(self.dir.path())
    }

    /// Start a session with default config at `at(0)`.
    pub fn create_session(&self, target: &str) -> LoopState {
        start_session(&self.store(), &LoopConfig::default(), target, at(0)).expect("start session")
    }
}
