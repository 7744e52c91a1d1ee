//! Envelope exchanged with phase workers.
//!
//! The core never interprets the work a worker performed, only these fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::gate::ExitSignal;
use crate::core::metrics::{MetricValue, MetricsSnapshot};
use crate::core::rate_limit::looks_overloaded;
use crate::core::types::Phase;

/// Input handed to a phase worker for one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub session_id: String,
    pub target: String,
    pub phase: Phase,
    pub iteration: u32,
    pub prior_metrics: Option<MetricsSnapshot>,
}

/// Structured status report returned by a phase worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricValue>,
    /// Gate 2. Missing means "not asserted".
    #[serde(default)]
    pub exit_signal: Option<bool>,
    /// Set by workers that compute the exit signal from their own metrics.
    #[serde(default)]
    pub exit_signal_derived: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub provider_overloaded: bool,
    #[serde(default)]
    pub summary: Option<String>,
}

impl WorkerReport {
    pub fn exit_signal(&self) -> ExitSignal {
        ExitSignal {
            asserted: self.exit_signal,
            derived: self.exit_signal_derived,
        }
    }

    /// Provider overload, either flagged explicitly or recognizable in the
    /// error text.
    pub fn indicates_overload(&self) -> bool {
        self.provider_overloaded || self.error.as_deref().is_some_and(looks_overloaded)
    }

    /// An error with no metrics: the call produced nothing to measure.
    pub fn is_failure(&self) -> bool {
        self.metrics.is_empty() && self.error_message().is_some()
    }

    /// Non-empty error text, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.error
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_report_defaults_fail_closed() {
        let report: WorkerReport = serde_json::from_str("{}").expect("parse");
        assert_eq!(report.exit_signal(), ExitSignal::default());
        assert!(!report.exit_signal().value());
        assert!(!report.indicates_overload());
        assert_eq!(report.error_message(), None);
    }

    #[test]
    fn overload_detected_from_error_text() {
        let report = WorkerReport {
            error: Some("API Error: 529 overloaded_error".to_string()),
            ..WorkerReport::default()
        };
        assert!(report.indicates_overload());
    }

    #[test]
    fn failure_needs_an_error_and_no_metrics() {
        let crashed = WorkerReport {
            error: Some("exit status 1".to_string()),
            ..WorkerReport::default()
        };
        assert!(crashed.is_failure());
        assert!(!WorkerReport::default().is_failure());

        let mut partial = crashed.clone();
        partial
            .metrics
            .insert("tests_total".to_string(), MetricValue::Count(3));
        assert!(!partial.is_failure());
    }

    #[test]
    fn blank_errors_are_ignored() {
        let report = WorkerReport {
            error: Some("   ".to_string()),
            ..WorkerReport::default()
        };
        assert_eq!(report.error_message(), None);
    }
}
