//! Per-session record storage with an atomic multi-file commit.
//!
//! A commit writes every `*.json.tmp` first (session last), then renames each
//! into place (session last). A readable `session.json.tmp` on load therefore
//! means all temps were complete and the commit is rolled forward; any other
//! leftover temp belongs to a commit that never finished and is discarded.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::circuit_breaker::CircuitBreakerState;
use crate::core::metrics::{MetricsSnapshot, MetricsStore};
use crate::core::rate_limit::RateLimitState;
use crate::core::session::Session;
use crate::core::state::LoopState;
use crate::io::paths::{HomePaths, SessionPaths, temp_path};

/// Persisted state that cannot be trusted. Never patched in place; the
/// caller must start a fresh session.
#[derive(Debug, Error)]
#[error("session {session_id} is corrupt: {detail}")]
pub struct StateCorruption {
    pub session_id: String,
    pub detail: String,
}

/// Generate `session-<yyyymmdd_HHMMSS>-<6 alphanumerics>`.
pub fn generate_session_id(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| rng.sample(Alphanumeric) as char)
        .collect();
    format!("session-{}-{}", now.format("%Y%m%d_%H%M%S"), suffix)
}

/// Reject ids that would resolve outside `<home>/sessions/`.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(anyhow!(
            "invalid session id '{session_id}' (expected letters, digits, '-' or '_')"
        ));
    }
    Ok(())
}

/// Session storage rooted at a home directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    home: HomePaths,
}

impl SessionStore {
    pub fn new(home: impl Into<std::path::PathBuf>) -> Self {
        Self {
            home: HomePaths::new(home),
        }
    }

    pub fn home(&self) -> &HomePaths {
        &self.home
    }

    pub fn paths(&self, session_id: &str) -> SessionPaths {
        self.home.session(session_id)
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.paths(session_id).session_path.exists()
    }

    /// Persist a brand-new session; refuses to overwrite an existing one.
    pub fn create(&self, state: &mut LoopState) -> Result<SessionPaths> {
        validate_session_id(&state.session.session_id)?;
        let paths = self.paths(&state.session.session_id);
        if paths.session_path.exists() {
            return Err(anyhow!(
                "session {} already exists",
                state.session.session_id
            ));
        }
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create session dir {}", paths.dir.display()))?;
        self.save(state)?;
        info!(session_id = %state.session.session_id, "session created");
        Ok(paths)
    }

    /// Commit all four records under the next revision.
    pub fn save(&self, state: &mut LoopState) -> Result<()> {
        let paths = self.paths(&state.session.session_id);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create session dir {}", paths.dir.display()))?;
        let revision = state.bump_revision();
        debug!(session_id = %state.session.session_id, revision, "committing session state");

        // Session goes last in both passes; see the module docs.
        write_temp(&paths.circuit_breaker_path, &state.breaker)?;
        write_temp(&paths.rate_limit_path, &state.rate_limit)?;
        write_temp(&paths.metrics_path, &state.metrics)?;
        write_temp(&paths.session_path, &state.session)?;

        promote(&paths.circuit_breaker_path)?;
        promote(&paths.rate_limit_path)?;
        promote(&paths.metrics_path)?;
        promote(&paths.session_path)?;
        Ok(())
    }

    /// Load all records, recovering an interrupted commit first.
    ///
    /// Unparseable records and revision mismatches are reported as
    /// [`StateCorruption`].
    pub fn load(&self, session_id: &str) -> Result<LoopState> {
        validate_session_id(session_id)?;
        let paths = self.paths(session_id);
        if !paths.session_path.exists() && !temp_path(&paths.session_path).exists() {
            return Err(anyhow!("session {session_id} not found in {}", paths.dir.display()));
        }
        recover_pending_commit(&paths)?;

        let corrupt = |detail: String| StateCorruption {
            session_id: session_id.to_string(),
            detail,
        };
        let session: Session = read_record(&paths.session_path).map_err(|e| corrupt(format!("{e:#}")))?;
        let breaker: CircuitBreakerState =
            read_record(&paths.circuit_breaker_path).map_err(|e| corrupt(format!("{e:#}")))?;
        let rate_limit: RateLimitState =
            read_record(&paths.rate_limit_path).map_err(|e| corrupt(format!("{e:#}")))?;
        let metrics: MetricsStore =
            read_record(&paths.metrics_path).map_err(|e| corrupt(format!("{e:#}")))?;

        if session.session_id != session_id {
            return Err(corrupt(format!(
                "session.json belongs to '{}'",
                session.session_id
            ))
            .into());
        }

        let state = LoopState {
            session,
            breaker,
            rate_limit,
            metrics,
        };
        let mismatches = state.revision_mismatches();
        if !mismatches.is_empty() {
            return Err(corrupt(mismatches.join("; ")).into());
        }
        debug!(session_id, revision = state.revision(), "session state loaded");
        Ok(state)
    }

    /// Ids of every stored session, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = &self.home.sessions_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            if entry.path().join("session.json").is_file()
                && let Some(name) = entry.file_name().to_str()
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Append one snapshot to the audit history (`metrics_history.jsonl`).
    pub fn append_metrics_history(&self, session_id: &str, snapshot: &MetricsSnapshot) -> Result<()> {
        let path = self.paths(session_id).metrics_history_path;
        let mut line = serde_json::to_string(snapshot).context("serialize metrics snapshot")?;
        line.push('\n');
        append_text(&path, &line)
    }
}

/// Append text to a file, creating it if needed.
pub fn append_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

fn write_temp<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let tmp_path = temp_path(path);
    fs::write(&tmp_path, buf).with_context(|| format!("write temp {}", tmp_path.display()))
}

fn promote(path: &Path) -> Result<()> {
    let tmp_path = temp_path(path);
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn recover_pending_commit(paths: &SessionPaths) -> Result<()> {
    let record_paths = [
        &paths.circuit_breaker_path,
        &paths.rate_limit_path,
        &paths.metrics_path,
        &paths.session_path,
    ];
    let pending: Vec<&Path> = record_paths
        .iter()
        .map(|p| p.as_path())
        .filter(|p| temp_path(p).exists())
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let session_tmp = temp_path(&paths.session_path);
    let complete = session_tmp.exists() && read_record::<Session>(&session_tmp).is_ok();
    if complete {
        warn!(dir = %paths.dir.display(), pending = pending.len(), "rolling forward interrupted commit");
        for path in pending {
            promote(path)?;
        }
    } else {
        warn!(dir = %paths.dir.display(), pending = pending.len(), "discarding unfinished commit");
        for path in pending {
            let tmp = temp_path(path);
            fs::remove_file(&tmp).with_context(|| format!("remove {}", tmp.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CircuitState, Phase};
    use crate::test_support::{at, snapshot};

    fn new_state(id: &str) -> LoopState {
        LoopState::new(id.to_string(), "crate://demo".to_string(), 100, at(0))
    }

    #[test]
    fn create_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        let mut state = new_state("s1");
        state.metrics.record(snapshot(Phase::GenerateTests, 0, &[("tests_generated", 2)]));
        store.create(&mut state).expect("create");

        let loaded = store.load("s1").expect("load");
        assert_eq!(loaded, state);
        assert_eq!(loaded.revision(), 1);
        assert_eq!(store.list().expect("list"), vec!["s1".to_string()]);
    }

    #[test]
    fn create_refuses_existing_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        store.create(&mut new_state("s1")).expect("create");
        let err = store.create(&mut new_state("s1")).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn malformed_record_is_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        store.create(&mut new_state("s1")).expect("create");
        fs::write(store.paths("s1").circuit_breaker_path, "{ not json").expect("write");

        let err = store.load("s1").unwrap_err();
        assert!(err.downcast_ref::<StateCorruption>().is_some(), "{err:#}");
    }

    #[test]
    fn revision_mismatch_is_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        let mut state = new_state("s1");
        store.create(&mut state).expect("create");

        let mut stale = state.rate_limit.clone();
        stale.revision = 0;
        let mut buf = serde_json::to_string_pretty(&stale).expect("serialize");
        buf.push('\n');
        fs::write(store.paths("s1").rate_limit_path, buf).expect("write");

        let err = store.load("s1").unwrap_err();
        let corruption = err.downcast_ref::<StateCorruption>().expect("corruption");
        assert!(corruption.detail.contains("rate_limit revision 0"));
    }

    #[test]
    fn interrupted_commit_with_complete_temps_rolls_forward() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        let mut state = new_state("s1");
        store.create(&mut state).expect("create");

        // Simulate a crash after the temps were written and the breaker was
        // renamed, but before the remaining renames.
        let paths = store.paths("s1");
        state.breaker.state = CircuitState::HalfOpen;
        state.session.current_iteration = 4;
        state.bump_revision();
        write_temp(&paths.circuit_breaker_path, &state.breaker).expect("tmp");
        write_temp(&paths.rate_limit_path, &state.rate_limit).expect("tmp");
        write_temp(&paths.metrics_path, &state.metrics).expect("tmp");
        write_temp(&paths.session_path, &state.session).expect("tmp");
        promote(&paths.circuit_breaker_path).expect("rename");

        let loaded = store.load("s1").expect("load");
        assert_eq!(loaded, state);
        assert!(!temp_path(&paths.session_path).exists());
    }

    #[test]
    fn unfinished_commit_is_discarded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        let mut state = new_state("s1");
        store.create(&mut state).expect("create");
        let committed = state.clone();

        let paths = store.paths("s1");
        state.session.current_iteration = 9;
        state.bump_revision();
        write_temp(&paths.circuit_breaker_path, &state.breaker).expect("tmp");
        fs::write(temp_path(&paths.session_path), "{\"revision\": 2, \"sess").expect("partial");

        let loaded = store.load("s1").expect("load");
        assert_eq!(loaded, committed);
        assert!(!temp_path(&paths.circuit_breaker_path).exists());
    }

    #[test]
    fn metrics_history_appends_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        store.create(&mut new_state("s1")).expect("create");
        for i in 0..3 {
            store
                .append_metrics_history("s1", &snapshot(Phase::Implement, i, &[("tests_passing", 1)]))
                .expect("append");
        }
        let contents =
            fs::read_to_string(store.paths("s1").metrics_history_path).expect("read history");
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn generated_ids_are_path_safe() {
        let id = generate_session_id(at(0));
        let expected_prefix = format!("session-{}-", at(0).format("%Y%m%d_%H%M%S"));
        assert!(id.starts_with(&expected_prefix), "{id}");
        assert_eq!(id.len(), expected_prefix.len() + 6);
        assert!(
            id.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_ne!(generate_session_id(at(0)), generate_session_id(at(0)));
    }

    #[test]
    fn ids_escaping_the_sessions_dir_are_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        let outside = temp.path().join("x");
        fs::create_dir_all(&outside).expect("mkdir");
        fs::write(outside.join("session.json"), "{}").expect("write");

        for id in ["../x", "..", "a/b", "a\\b", ""] {
            let err = store.load(id).unwrap_err();
            assert!(err.to_string().contains("invalid session id"), "{id}: {err:#}");
        }
        assert!(store.create(&mut new_state("../escape")).is_err());
        assert!(!temp.path().join("escape").exists());
        validate_session_id(&generate_session_id(at(0))).expect("generated id");
    }
}
