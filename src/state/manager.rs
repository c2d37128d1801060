//! Durable persistence for [`PipelineState`].
//!
//! The state file is a single JSON document written with
//! write-temp-then-rename, so a crash mid-write leaves either the previous
//! or the new document on disk, never a torn one.

use chrono::{Duration as ChronoDuration, Utc};
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use super::PipelineState;
use super::store::DEFAULT_RETRY_CEILING;
use crate::errors::PersistError;
use crate::util::atomic_write;

pub struct StateManager {
    state_file: PathBuf,
    archive_dir: PathBuf,
    retry_ceiling: u32,
    persist_attempts: u32,
}

impl StateManager {
    pub fn new(state_file: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            archive_dir: archive_dir.into(),
            retry_ceiling: DEFAULT_RETRY_CEILING,
            persist_attempts: 3,
        }
    }

    /// Retry ceiling installed into every loaded task store.
    pub fn with_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    pub fn with_persist_attempts(mut self, attempts: u32) -> Self {
        self.persist_attempts = attempts.max(1);
        self
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn exists(&self) -> bool {
        self.state_file.exists()
    }

    /// Load the state file, or a fresh state when none exists yet.
    pub fn load(&self) -> Result<PipelineState, PersistError> {
        if !self.state_file.exists() {
            let mut state = PipelineState::new();
            state.tasks.set_retry_ceiling(self.retry_ceiling);
            return Ok(state);
        }

        let bytes = std::fs::read(&self.state_file).map_err(|source| PersistError::Io {
            path: self.state_file.clone(),
            source,
        })?;
        let mut state: PipelineState =
            serde_json::from_slice(&bytes).map_err(|source| PersistError::Corrupt {
                path: self.state_file.clone(),
                source,
            })?;
        state.tasks.set_retry_ceiling(self.retry_ceiling);
        Ok(state)
    }

    /// Atomically write `state` to the state file.
    pub fn save(&self, state: &PipelineState) -> Result<(), PersistError> {
        let bytes = serde_json::to_vec_pretty(state).map_err(PersistError::Serialization)?;
        atomic_write(&self.state_file, &bytes).map_err(|source| PersistError::Io {
            path: self.state_file.clone(),
            source,
        })
    }

    /// Save, retrying transient failures with a short backoff. Serialization
    /// errors are not retried since they cannot succeed on a second try.
    pub async fn save_with_retry(&self, state: &PipelineState) -> Result<(), PersistError> {
        let mut attempt = 1;
        loop {
            match self.save(state) {
                Ok(()) => return Ok(()),
                Err(e @ PersistError::Serialization(_)) => {
                    error!(error = %e, "Pipeline state cannot be serialized");
                    return Err(e);
                }
                Err(e) if attempt >= self.persist_attempts => {
                    error!(error = %e, attempts = attempt, "Giving up persisting pipeline state");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Persisting pipeline state failed; retrying");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Load for `--resume`, or archive any existing state and start fresh.
    pub fn start(&self, resume: bool) -> Result<PipelineState, PersistError> {
        if resume {
            let state = self.load()?;
            info!(run_id = %state.run_id, tasks = state.tasks.len(), "Resuming pipeline state");
            return Ok(state);
        }

        if self.exists() {
            let archived = self.archive()?;
            info!(path = %archived.display(), "Archived previous pipeline state");
        }
        let mut state = PipelineState::new();
        state.tasks.set_retry_ceiling(self.retry_ceiling);
        self.save(&state)?;
        Ok(state)
    }

    /// Move the current state file into the archive directory.
    pub fn archive(&self) -> Result<PathBuf, PersistError> {
        std::fs::create_dir_all(&self.archive_dir).map_err(|source| PersistError::Io {
            path: self.archive_dir.clone(),
            source,
        })?;
        let name = format!("state-{}.json", Utc::now().format("%Y%m%d-%H%M%S%.3f"));
        let dest = self.archive_dir.join(name);
        std::fs::rename(&self.state_file, &dest).map_err(|source| PersistError::Io {
            path: self.state_file.clone(),
            source,
        })?;
        Ok(dest)
    }

    /// Remove the state file, and the archive too when `include_archive`.
    pub fn reset(&self, include_archive: bool) -> Result<(), PersistError> {
        if self.state_file.exists() {
            std::fs::remove_file(&self.state_file).map_err(|source| PersistError::Io {
                path: self.state_file.clone(),
                source,
            })?;
        }
        if include_archive && self.archive_dir.exists() {
            std::fs::remove_dir_all(&self.archive_dir).map_err(|source| PersistError::Io {
                path: self.archive_dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Drop action records older than `max_age_hours`, protecting the newest
/// `keep_last` of each (phase, task) window. An age too large to represent
/// prunes nothing. Returns the number removed.
pub fn prune_history(state: &mut PipelineState, max_age_hours: u64, keep_last: usize) -> usize {
    let Some(max_age) = i64::try_from(max_age_hours)
        .ok()
        .and_then(ChronoDuration::try_hours)
    else {
        return 0;
    };
    state.actions.prune_older_than(max_age, keep_last)
}

/// Exclusive advisory lock guaranteeing one coordinator per project.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    pub fn acquire(path: &Path) -> Result<Self, PersistError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PersistError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = File::create(path).map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        FileExt::try_lock_exclusive(&file).map_err(|_| PersistError::Locked {
            path: path.to_path_buf(),
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskStatus;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> StateManager {
        StateManager::new(dir.join("state.json"), dir.join("archive"))
    }

    #[test]
    fn test_prune_history_with_huge_age_is_a_no_op() {
        let mut state = PipelineState::new();
        state.actions.append(crate::state::ActionRecord {
            seq: 1,
            phase: crate::phase::Phase::Coding,
            task_id: None,
            tool: "read_file".into(),
            args: serde_json::json!({"path": "a.py"}),
            success: true,
            target_file: None,
            mutated: false,
            timestamp: Utc::now() - ChronoDuration::hours(1000),
        });
        assert_eq!(prune_history(&mut state, u64::MAX, 0), 0);
        assert_eq!(prune_history(&mut state, i64::MAX as u64, 0), 0);
        assert_eq!(prune_history(&mut state, 1_000_000_000_000_000, 0), 0);
        assert_eq!(state.actions.len(), 1);
        assert_eq!(prune_history(&mut state, 1, 0), 1);
    }

    #[test]
    fn test_load_missing_returns_fresh_state() {
        let dir = tempdir().unwrap();
        let state = manager(dir.path()).load().unwrap();
        assert!(state.tasks.is_empty());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut state = PipelineState::new();
        let id = state.tasks.create_task("Add parser", "src/parser.py", 3);
        state
            .tasks
            .update_task(&id, TaskStatus::InProgress, Some("first try".into()))
            .unwrap();
        state.record_file_write("src/parser.py", "abc", Some(&id));
        mgr.save(&state).unwrap();

        let loaded = mgr.load().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(
            loaded.tasks.get(&id).unwrap().errors[0].timestamp,
            state.tasks.get(&id).unwrap().errors[0].timestamp
        );
    }

    #[test]
    fn test_load_applies_configured_ceiling() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path()).with_retry_ceiling(5);
        mgr.save(&PipelineState::new()).unwrap();
        assert_eq!(mgr.load().unwrap().tasks.retry_ceiling(), 5);
    }

    #[test]
    fn test_corrupt_state_is_reported() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        std::fs::write(mgr.state_file(), "{ not json").unwrap();
        assert!(matches!(mgr.load(), Err(PersistError::Corrupt { .. })));
    }

    #[test]
    fn test_fresh_start_archives_previous_state() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut old = PipelineState::new();
        old.tasks.create_task("stale review", "a.py", 1);
        mgr.save(&old).unwrap();

        let fresh = mgr.start(false).unwrap();
        assert!(fresh.tasks.is_empty());
        assert_ne!(fresh.run_id, old.run_id);
        let archived: Vec<_> = std::fs::read_dir(dir.path().join("archive"))
            .unwrap()
            .collect();
        assert_eq!(archived.len(), 1);
    }

    #[test]
    fn test_resume_loads_existing_state() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut old = PipelineState::new();
        old.tasks.create_task("keep me", "a.py", 1);
        mgr.save(&old).unwrap();

        let resumed = mgr.start(true).unwrap();
        assert_eq!(resumed.run_id, old.run_id);
        assert_eq!(resumed.tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_save_with_retry_reports_persistent_failure() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file, not a dir").unwrap();
        let mgr = StateManager::new(blocker.join("state.json"), dir.path().join("archive"))
            .with_persist_attempts(2);
        let result = mgr.save_with_retry(&PipelineState::new()).await;
        assert!(matches!(result, Err(PersistError::Io { .. })));
    }

    #[test]
    fn test_reset_removes_state() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.save(&PipelineState::new()).unwrap();
        mgr.reset(false).unwrap();
        assert!(!mgr.exists());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let first = StateLock::acquire(&path).unwrap();
        assert!(matches!(
            StateLock::acquire(&path),
            Err(PersistError::Locked { .. })
        ));
        drop(first);
        assert!(StateLock::acquire(&path).is_ok());
    }
}
