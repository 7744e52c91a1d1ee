//! Dual-gate phase exit evaluation.
//!
//! Gate 1 is an objective predicate over one metrics snapshot. Gate 2 is the
//! worker's own exit assertion. Both are evaluated together, from the same
//! report, on every tick; nothing is carried over between ticks.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::metrics::{MetricsSnapshot, keys};
use crate::core::types::Phase;

/// Successful full-suite runs required before `implement` may exit.
pub const REQUIRED_CONSECUTIVE_RUNS: u64 = 2;

/// The worker's explicit exit assertion for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitSignal {
    /// `None` when the worker did not say; treated as `false`.
    pub asserted: Option<bool>,
    /// The worker reports that it computed the signal from its metrics
    /// instead of asserting it independently.
    pub derived: bool,
}

impl ExitSignal {
    pub fn asserted(value: bool) -> Self {
        Self {
            asserted: Some(value),
            derived: false,
        }
    }

    pub fn value(self) -> bool {
        self.asserted.unwrap_or(false)
    }
}

/// Result of the objective gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateCheck {
    pub passed: bool,
    /// Human-readable unmet conditions, empty when `passed`.
    pub unmet: Vec<String>,
}

/// Per-tick evaluation. Never persisted as authoritative state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateEvaluation {
    pub phase: Phase,
    pub gate_1: bool,
    pub gate_2: bool,
    pub gate_2_derived: bool,
    pub can_exit: bool,
    pub unmet: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl GateEvaluation {
    /// Worker claims completion while the objective gate disagrees.
    pub fn premature_exit_signal(&self) -> bool {
        self.gate_2 && !self.gate_1
    }
}

/// Gate 1: the phase-specific objective exit condition.
pub fn gate_1(phase: Phase, snapshot: &MetricsSnapshot) -> GateCheck {
    let mut unmet = Vec::new();
    if snapshot.phase != phase {
        unmet.push(format!(
            "snapshot is for {} but phase is {}",
            snapshot.phase, phase
        ));
        return GateCheck {
            passed: false,
            unmet,
        };
    }

    let mut require = |ok: bool, message: String| {
        if !ok {
            unmet.push(message);
        }
    };

    match phase {
        Phase::GenerateTests => {
            let generated = snapshot.count(keys::TESTS_GENERATED);
            let failing = snapshot.count(keys::TESTS_FAILING);
            let passing = snapshot.count(keys::TESTS_PASSING);
            let required = snapshot.count_or(keys::TESTS_REQUIRED, 1);
            require(generated > 0, "no tests generated".to_string());
            require(
                failing == generated,
                format!("{failing} of {generated} generated tests fail (all must fail)"),
            );
            require(passing == 0, format!("{passing} tests already pass"));
            require(
                generated >= required,
                format!("tests_generated {generated} < tests_required {required}"),
            );
        }
        Phase::Implement => {
            require_green_suite(snapshot, &mut require);
            let runs = snapshot.count(keys::CONSECUTIVE_RUNS);
            require(
                runs >= REQUIRED_CONSECUTIVE_RUNS,
                format!("consecutive_runs {runs} < {REQUIRED_CONSECUTIVE_RUNS}"),
            );
        }
        Phase::Improve => {
            require_green_suite(snapshot, &mut require);
            let issues = snapshot.count(keys::QUALITY_ISSUES);
            require(issues == 0, format!("{issues} quality issues remain"));
        }
        Phase::Document => {
            let generated = snapshot.count(keys::DOCS_GENERATED);
            let required = snapshot.count(keys::DOCS_REQUIRED);
            require(generated > 0, "no documents generated".to_string());
            require(
                generated >= required,
                format!("docs_generated {generated} < docs_required {required}"),
            );
        }
        Phase::Validate => {
            let blocking = snapshot.count(keys::BLOCKING_FAILURES);
            require(blocking == 0, format!("{blocking} blocking failures"));
            require(
                snapshot.flag(keys::APPROVED),
                "no approval verdict".to_string(),
            );
        }
    }

    GateCheck {
        passed: unmet.is_empty(),
        unmet,
    }
}

fn require_green_suite(snapshot: &MetricsSnapshot, require: &mut impl FnMut(bool, String)) {
    let total = snapshot.count(keys::TESTS_TOTAL);
    let passing = snapshot.count(keys::TESTS_PASSING);
    let failing = snapshot.count(keys::TESTS_FAILING);
    require(total > 0, "no tests in suite".to_string());
    require(failing == 0, format!("{failing} tests failing"));
    require(
        passing == total,
        format!("tests_passing {passing} != tests_total {total}"),
    );
}

/// Evaluate both gates for `phase` from one snapshot and the same tick's
/// exit signal.
pub fn evaluate(
    phase: Phase,
    snapshot: &MetricsSnapshot,
    signal: ExitSignal,
    now: DateTime<Utc>,
) -> GateEvaluation {
    let check = gate_1(phase, snapshot);
    let gate_2 = signal.value();
    GateEvaluation {
        phase,
        gate_1: check.passed,
        gate_2,
        gate_2_derived: signal.derived,
        can_exit: check.passed && gate_2,
        unmet: check.unmet,
        evaluated_at: now,
    }
}
