//! Canonical on-disk layout under the phaseloop home directory.

use std::path::{Path, PathBuf};

/// Default home directory, relative to the working directory.
pub const DEFAULT_HOME: &str = ".phaseloop";

/// Paths shared by every session under one home directory.
#[derive(Debug, Clone)]
pub struct HomePaths {
    pub home: PathBuf,
    pub sessions_dir: PathBuf,
    pub config_path: PathBuf,
}

impl HomePaths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            sessions_dir: home.join("sessions"),
            config_path: home.join("config.toml"),
            home,
        }
    }

    pub fn session(&self, session_id: &str) -> SessionPaths {
        SessionPaths::new(self.sessions_dir.join(session_id))
    }
}

/// All files belonging to one session.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub session_path: PathBuf,
    pub circuit_breaker_path: PathBuf,
    pub rate_limit_path: PathBuf,
    pub metrics_path: PathBuf,
    pub metrics_history_path: PathBuf,
    pub status_log_path: PathBuf,
    pub worker_dir: PathBuf,
}

impl SessionPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            session_path: dir.join("session.json"),
            circuit_breaker_path: dir.join("circuit_breaker.json"),
            rate_limit_path: dir.join("rate_limit.json"),
            metrics_path: dir.join("metrics.json"),
            metrics_history_path: dir.join("metrics_history.jsonl"),
            status_log_path: dir.join("status.log"),
            worker_dir: dir.join("worker"),
            dir,
        }
    }

    /// Worker log for one invocation, e.g. `worker/implement-3.log`.
    pub fn worker_log_path(&self, phase: &str, iteration: u32) -> PathBuf {
        self.worker_dir.join(format!("{phase}-{iteration}.log"))
    }
}

/// Temp path used by the commit protocol (`session.json` -> `session.json.tmp`).
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let home = HomePaths::new(temp.path());
        let paths = home.session("session-1");

        assert!(paths.dir.ends_with("sessions/session-1"));
        assert!(paths.session_path.ends_with("session.json"));
        assert!(paths.circuit_breaker_path.ends_with("circuit_breaker.json"));
        assert!(paths.rate_limit_path.ends_with("rate_limit.json"));
        assert!(paths.metrics_path.ends_with("metrics.json"));
        assert!(paths.status_log_path.ends_with("status.log"));
        assert!(
            paths
                .worker_log_path("implement", 3)
                .ends_with("worker/implement-3.log")
        );
        assert!(home.config_path.ends_with("config.toml"));
    }

    #[test]
    fn temp_path_appends_suffix() {
        let tmp = temp_path(Path::new("/x/session.json"));
        assert_eq!(tmp, PathBuf::from("/x/session.json.tmp"));
    }
}
