//! Quantitative snapshots reported by phase workers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::Phase;

/// Well-known counter names shared by the progress and gate rules.
pub mod keys {
    pub const TESTS_GENERATED: &str = "tests_generated";
    pub const TESTS_REQUIRED: &str = "tests_required";
    pub const TESTS_TOTAL: &str = "tests_total";
    pub const TESTS_PASSING: &str = "tests_passing";
    pub const TESTS_FAILING: &str = "tests_failing";
    pub const CONSECUTIVE_RUNS: &str = "consecutive_runs";
    pub const FILES_CREATED: &str = "files_created";
    pub const FILES_MODIFIED: &str = "files_modified";
    pub const QUALITY_ISSUES: &str = "quality_issues";
    pub const DOCS_GENERATED: &str = "docs_generated";
    pub const DOCS_REQUIRED: &str = "docs_required";
    pub const CHECKS_TOTAL: &str = "checks_total";
    pub const CHECKS_PASSED: &str = "checks_passed";
    pub const CHECKS_FAILED: &str = "checks_failed";
    pub const BLOCKING_FAILURES: &str = "blocking_failures";
    pub const APPROVED: &str = "approved";
}

/// A single named metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Flag(bool),
    Count(u64),
}

impl MetricValue {
    pub fn as_count(self) -> u64 {
        match self {
            MetricValue::Count(value) => value,
            MetricValue::Flag(flag) => u64::from(flag),
        }
    }

    pub fn as_flag(self) -> bool {
        match self {
            MetricValue::Flag(flag) => flag,
            MetricValue::Count(value) => value > 0,
        }
    }
}

/// Immutable, phase-tagged metrics recorded for one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub phase: Phase,
    pub iteration: u32,
    pub recorded_at: DateTime<Utc>,
    pub values: BTreeMap<String, MetricValue>,
}

impl MetricsSnapshot {
    pub fn new(
        phase: Phase,
        iteration: u32,
        recorded_at: DateTime<Utc>,
        values: BTreeMap<String, MetricValue>,
    ) -> Self {
        Self {
            phase,
            iteration,
            recorded_at,
            values,
        }
    }

    /// Counter value; missing counters read as zero.
    pub fn count(&self, key: &str) -> u64 {
        self.values.get(key).map_or(0, |value| value.as_count())
    }

    /// Counter value with an explicit default for missing keys.
    pub fn count_or(&self, key: &str, default: u64) -> u64 {
        self.values.get(key).map_or(default, |value| value.as_count())
    }

    /// Flag value; missing flags read as false.
    pub fn flag(&self, key: &str) -> bool {
        self.values.get(key).is_some_and(|value| value.as_flag())
    }

    /// True when both snapshots carry exactly the same metric values.
    pub fn same_values(&self, other: &MetricsSnapshot) -> bool {
        self.values == other.values
    }

    /// Compact JSON rendering of the values with sorted keys.
    pub fn values_json(&self) -> String {
        serde_json::to_string(&self.values).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Latest and previous snapshot for one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub latest: Option<MetricsSnapshot>,
    pub previous: Option<MetricsSnapshot>,
}

/// Per-phase metrics store (`metrics.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsStore {
    pub revision: u64,
    #[serde(default)]
    pub phases: BTreeMap<Phase, PhaseMetrics>,
}

impl MetricsStore {
    /// Record a snapshot as the newest for its phase, shifting the old latest
    /// into `previous`.
    pub fn record(&mut self, snapshot: MetricsSnapshot) {
        let entry = self.phases.entry(snapshot.phase).or_default();
        entry.previous = entry.latest.take();
        entry.latest = Some(snapshot);
    }

    pub fn latest(&self, phase: Phase) -> Option<&MetricsSnapshot> {
        self.phases.get(&phase).and_then(|entry| entry.latest.as_ref())
    }

    pub fn previous(&self, phase: Phase) -> Option<&MetricsSnapshot> {
        self.phases
            .get(&phase)
            .and_then(|entry| entry.previous.as_ref())
    }
}
