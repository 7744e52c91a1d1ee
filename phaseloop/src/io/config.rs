//! Loop configuration stored under `<home>/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::rate_limit::DEFAULT_CALLS_PER_HOUR;
use crate::core::session::DEFAULT_ERROR_HISTORY_CAP;
use crate::io::paths::{DEFAULT_HOME, temp_path};

/// Overrides the session storage location.
pub const ENV_HOME: &str = "PHASELOOP_HOME";
/// Overrides `max_calls_per_hour`.
pub const ENV_MAX_CALLS_PER_HOUR: &str = "PHASELOOP_MAX_CALLS_PER_HOUR";

/// Loop configuration (TOML).
///
/// Meant to be edited by humans. Missing fields fall back to defaults.
/// Circuit breaker thresholds are deliberately absent: they are fixed per
/// phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Hourly worker invocation ceiling.
    pub max_calls_per_hour: u32,

    /// Entries kept in a session's `error_history`.
    pub error_history_cap: usize,

    /// Granularity of cancellable waits (cooldown, hourly reset).
    pub wait_poll_millis: u64,

    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Command that performs one phase iteration (e.g. `["./worker.sh"]`).
    pub command: Vec<String>,

    /// Wall-clock limit for one invocation in seconds.
    pub timeout_secs: u64,

    /// Truncate worker stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec!["phaseloop-worker".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_calls_per_hour: DEFAULT_CALLS_PER_HOUR,
            error_history_cap: DEFAULT_ERROR_HISTORY_CAP,
            wait_poll_millis: 1_000,
            worker: WorkerConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_calls_per_hour == 0 {
            return Err(anyhow!("max_calls_per_hour must be > 0"));
        }
        if self.error_history_cap == 0 {
            return Err(anyhow!("error_history_cap must be > 0"));
        }
        if self.wait_poll_millis == 0 {
            return Err(anyhow!("wait_poll_millis must be > 0"));
        }
        if self.worker.timeout_secs == 0 {
            return Err(anyhow!("worker.timeout_secs must be > 0"));
        }
        if self.worker.output_limit_bytes == 0 {
            return Err(anyhow!("worker.output_limit_bytes must be > 0"));
        }
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_MAX_CALLS_PER_HOUR) {
            let limit: u32 = raw.trim().parse().with_context(|| {
                format!("{ENV_MAX_CALLS_PER_HOUR} must be a positive integer (got '{raw}')")
            })?;
            debug!(limit, "hourly limit overridden from environment");
            self.max_calls_per_hour = limit;
        }
        self.validate()?;
        Ok(self)
    }
}

/// Resolve the home directory: explicit flag, then `PHASELOOP_HOME`, then
/// the default.
pub fn resolve_home<F>(flag: Option<&Path>, lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    match lookup(ENV_HOME) {
        Some(raw) if !raw.trim().is_empty() => PathBuf::from(raw.trim()),
        _ => PathBuf::from(DEFAULT_HOME),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load config and apply the process environment on top.
pub fn load_config_with_env(path: &Path) -> Result<LoopConfig> {
    load_config(path)?.apply_env(|key| std::env::var(key).ok())
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = temp_path(path);
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
