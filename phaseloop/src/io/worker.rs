//! Phase worker invocation.
//!
//! The [`PhaseWorker`] trait decouples the orchestrator from whatever performs
//! a phase iteration. Production runs an external command; tests use scripted
//! workers that return predetermined reports.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::report::{WorkerReport, WorkerRequest};
use crate::io::config::WorkerConfig;
use crate::io::paths::HomePaths;
use crate::io::process::{CommandOutput, run_command_with_timeout};

const REPORT_SCHEMA: &str = include_str!("../../schemas/worker_report.schema.json");

static REPORT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(REPORT_SCHEMA).expect("worker report schema should be valid JSON");
    validator_for(&schema).expect("worker report schema should compile")
});

/// Performs one phase iteration and reports on it.
pub trait PhaseWorker {
    fn invoke(&self, request: &WorkerRequest) -> Result<WorkerReport>;
}

/// Worker that runs a configured command.
///
/// The request is written to stdin as JSON and mirrored in `PHASELOOP_*`
/// environment variables. The report is read from stdout.
pub struct CommandWorker {
    config: WorkerConfig,
    home: HomePaths,
}

impl CommandWorker {
    pub fn new(config: WorkerConfig, home: HomePaths) -> Self {
        Self { config, home }
    }
}

impl PhaseWorker for CommandWorker {
    #[instrument(skip_all, fields(phase = %request.phase, iteration = request.iteration))]
    fn invoke(&self, request: &WorkerRequest) -> Result<WorkerReport> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("worker.command is empty"))?;
        info!(program = %program, "invoking phase worker");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("PHASELOOP_SESSION_ID", &request.session_id)
            .env("PHASELOOP_TARGET", &request.target)
            .env("PHASELOOP_PHASE", request.phase.as_str())
            .env("PHASELOOP_ITERATION", request.iteration.to_string());
        let input = serde_json::to_vec(request).context("serialize worker request")?;

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = run_command_with_timeout(
            cmd,
            Some(&input),
            timeout,
            self.config.output_limit_bytes,
        )
        .with_context(|| format!("run worker {program}"))?;

        let log_path = self
            .home
            .session(&request.session_id)
            .worker_log_path(request.phase.as_str(), request.iteration);
        write_worker_log(&log_path, &output)?;

        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "worker timed out");
            return Err(anyhow!("worker timed out after {}s", timeout.as_secs()));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "worker failed");
            return Err(anyhow!(
                "worker exited with status {:?}: {}",
                output.status.code(),
                last_line(&output.stderr_text()).unwrap_or("no stderr")
            ));
        }

        let report = parse_report(&output.stdout_text())?;
        debug!(
            metrics = report.metrics.len(),
            exit_signal = ?report.exit_signal,
            "worker report parsed"
        );
        Ok(report)
    }
}

/// Parse a worker's stdout: the whole text as JSON, or else its last
/// non-empty line. The value must satisfy the report schema.
pub fn parse_report(stdout: &str) -> Result<WorkerReport> {
    let value: Value = match serde_json::from_str(stdout.trim()) {
        Ok(value) => value,
        Err(_) => {
            let line = last_line(stdout).ok_or_else(|| anyhow!("worker produced no report"))?;
            serde_json::from_str(line).context("parse worker report")?
        }
    };
    validate_report(&value)?;
    serde_json::from_value(value).context("deserialize worker report")
}

fn validate_report(value: &Value) -> Result<()> {
    let messages: Vec<String> = REPORT_VALIDATOR
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "worker report schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|line| !line.is_empty())
}

fn write_worker_log(path: &Path, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create worker log dir {}", parent.display()))?;
    }
    fs::write(path, output.transcript())
        .with_context(|| format!("write worker log {}", path.display()))
}
