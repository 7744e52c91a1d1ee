//! Append-only human-readable status log (`status.log`).
//!
//! Each tick and each control action appends one fixed-order block between
//! delimiter markers. The `status` command parses the log back.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use minijinja::{Environment, context};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::gate::GateEvaluation;
use crate::core::metrics::MetricsSnapshot;
use crate::core::state::LoopState;
use crate::core::types::{CircuitState, Phase, SessionStatus};
use crate::io::store::append_text;

const STATUS_BLOCK_TEMPLATE: &str = include_str!("templates/status_block.txt");

/// Recommendation prefix for blocks written by operator actions.
pub const CONTROL_PREFIX: &str = "CONTROL:";

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("status_block.txt", STATUS_BLOCK_TEMPLATE)
        .expect("status block template should be valid");
    env
});

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)=== PHASELOOP STATUS ===\r?\n(.*?)\r?\n=== END STATUS ===")
        .expect("status block pattern should compile")
});

/// One parsed or to-be-written status block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBlock {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub phase: Phase,
    pub status: SessionStatus,
    pub iteration: u32,
    pub progress_percent: u8,
    /// Compact JSON object with sorted keys.
    pub metrics: String,
    pub circuit_breaker: CircuitState,
    pub gate_1: Option<bool>,
    pub gate_2: Option<bool>,
    pub can_exit: Option<bool>,
    pub exit_signal: Option<bool>,
    pub recommendation: String,
}

impl StatusBlock {
    /// Capture the session's state after a tick or control action.
    pub fn capture(
        state: &LoopState,
        metrics: Option<&MetricsSnapshot>,
        gates: Option<&GateEvaluation>,
        exit_signal: Option<bool>,
        recommendation: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let session = &state.session;
        Self {
            timestamp: now,
            session_id: session.session_id.clone(),
            phase: session.current_phase,
            status: session.status,
            iteration: session.current_iteration,
            progress_percent: session.progress_percent(),
            metrics: metrics.map_or_else(|| "{}".to_string(), MetricsSnapshot::values_json),
            circuit_breaker: state.breaker.state,
            gate_1: gates.map(|g| g.gate_1),
            gate_2: gates.map(|g| g.gate_2),
            can_exit: gates.map(|g| g.can_exit),
            exit_signal,
            recommendation: single_line(recommendation),
        }
    }

    /// True when written by an operator action rather than a tick.
    pub fn is_control(&self) -> bool {
        self.recommendation.starts_with(CONTROL_PREFIX)
    }

    pub fn render(&self) -> Result<String> {
        let template = ENGINE.get_template("status_block.txt")?;
        let mut rendered = template.render(context! {
            timestamp => self.timestamp.to_rfc3339(),
            session_id => &self.session_id,
            phase => self.phase.as_str(),
            status => self.status.as_str(),
            iteration => self.iteration,
            progress_percent => self.progress_percent,
            metrics => &self.metrics,
            circuit_breaker => self.circuit_breaker.as_str(),
            gate_1 => tri_state(self.gate_1),
            gate_2 => tri_state(self.gate_2),
            can_exit => tri_state(self.can_exit),
            exit_signal => tri_state(self.exit_signal),
            recommendation => &self.recommendation,
        })?;
        rendered.push('\n');
        Ok(rendered)
    }
}

/// Render `block` and append it to the log at `path`.
#[instrument(skip_all, fields(path = %path.display(), status = %block.status))]
pub fn append_block(path: &Path, block: &StatusBlock) -> Result<()> {
    let rendered = block.render().context("render status block")?;
    append_text(path, &rendered)?;
    debug!(recommendation = %block.recommendation, "status block appended");
    Ok(())
}

/// Parse every block in a status log.
pub fn parse_status_log(contents: &str) -> Result<Vec<StatusBlock>> {
    BLOCK_RE
        .captures_iter(contents)
        .enumerate()
        .map(|(i, caps)| {
            let body = caps.get(1).map_or("", |m| m.as_str());
            parse_block(body).with_context(|| format!("status block #{}", i + 1))
        })
        .collect()
}

/// Read the log at `path` and return its last block, if any.
pub fn read_last_block(path: &Path) -> Result<Option<StatusBlock>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(parse_status_log(&contents)?.pop())
}

fn parse_block(body: &str) -> Result<StatusBlock> {
    let mut fields = std::collections::HashMap::new();
    for line in body.lines() {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed line '{line}'"))?;
        fields.insert(key.trim(), value.trim());
    }
    let field = |key: &str| {
        fields
            .get(key)
            .copied()
            .ok_or_else(|| anyhow!("missing field '{key}'"))
    };

    Ok(StatusBlock {
        timestamp: DateTime::parse_from_rfc3339(field("timestamp")?)
            .context("parse timestamp")?
            .with_timezone(&Utc),
        session_id: field("session_id")?.to_string(),
        phase: field("phase")?.parse().map_err(|e: String| anyhow!(e))?,
        status: parse_name(field("status")?)?,
        iteration: field("iteration")?.parse().context("parse iteration")?,
        progress_percent: field("progress_percent")?
            .parse()
            .context("parse progress_percent")?,
        metrics: field("metrics")?.to_string(),
        circuit_breaker: parse_name(field("circuit_breaker")?)?,
        gate_1: parse_tri_state(field("gate_1")?)?,
        gate_2: parse_tri_state(field("gate_2")?)?,
        can_exit: parse_tri_state(field("can_exit")?)?,
        exit_signal: parse_tri_state(field("exit_signal")?)?,
        recommendation: field("recommendation")?.to_string(),
    })
}

fn parse_name<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .with_context(|| format!("unknown value '{raw}'"))
}

fn tri_state(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "true",
        Some(false) => "false",
        None => "none",
    }
}

fn parse_tri_state(raw: &str) -> Result<Option<bool>> {
    match raw {
        "true" => Ok(Some(true)),
        "false" => Ok(Some(false)),
        "none" => Ok(None),
        other => Err(anyhow!("expected true, false, or none (got '{other}')")),
    }
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gate::{ExitSignal, evaluate};
    use crate::core::metrics::keys;
    use crate::test_support::{at, snapshot};

    fn state() -> LoopState {
        LoopState::new("session-1".into(), "crate://demo".into(), 10, at(0))
    }

    #[test]
    fn rendered_block_has_fixed_field_order() {
        let snap = snapshot(Phase::GenerateTests, 0, &[(keys::TESTS_REQUIRED, 4), (keys::TESTS_GENERATED, 2)]);
        let gates = evaluate(Phase::GenerateTests, &snap, ExitSignal::default(), at(5));
        let block = StatusBlock::capture(&state(), Some(&snap), Some(&gates), None, "continue", at(5));
        let rendered = block.render().expect("render");

        let keys_in_order: Vec<&str> = rendered
            .lines()
            .filter_map(|line| line.split_once(':').map(|(k, _)| k))
            .collect();
        assert_eq!(
            keys_in_order,
            vec![
                "timestamp",
                "session_id",
                "phase",
                "status",
                "iteration",
                "progress_percent",
                "metrics",
                "circuit_breaker",
                "gate_1",
                "gate_2",
                "can_exit",
                "exit_signal",
                "recommendation",
            ]
        );
        assert!(rendered.starts_with("=== PHASELOOP STATUS ===\n"));
        assert!(rendered.ends_with("=== END STATUS ===\n"));
        assert!(rendered.contains("metrics: {\"tests_generated\":2,\"tests_required\":4}\n"));
        assert!(rendered.contains("exit_signal: none\n"));
    }

    #[test]
    fn appended_blocks_parse_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.log");
        let first = StatusBlock::capture(&state(), None, None, None, "start", at(1));
        let second = StatusBlock::capture(
            &state(),
            None,
            None,
            Some(true),
            "CONTROL: paused by operator:\n maintenance",
            at(2),
        );
        append_block(&path, &first).expect("append");
        append_block(&path, &second).expect("append");

        let blocks = parse_status_log(&fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(blocks, vec![first, second.clone()]);
        assert!(!blocks[0].is_control());
        assert!(blocks[1].is_control());
        assert_eq!(blocks[1].recommendation, "CONTROL: paused by operator: maintenance");
        assert_eq!(read_last_block(&path).expect("last"), Some(second));
    }

    #[test]
    fn missing_log_has_no_last_block() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(read_last_block(&temp.path().join("status.log")).expect("read"), None);
    }

    #[test]
    fn malformed_block_is_reported() {
        let log = "=== PHASELOOP STATUS ===\ntimestamp: nope\n=== END STATUS ===\n";
        let err = parse_status_log(log).unwrap_err();
        assert!(format!("{err:#}").contains("status block #1"));
    }
}
