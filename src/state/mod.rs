//! Pipeline state: the single durable aggregate for a project.
//!
//! Holds the task/objective store, checkpoint logs, action history, per-file
//! review status, and the counters the coordinator needs across iterations.
//! The coordinator reloads this from disk at the top of every iteration and
//! writes it back atomically through [`StateManager`].

pub mod actions;
pub mod manager;
pub mod objective;
pub mod store;
pub mod task;

pub use actions::{ActionLog, ActionRecord};
pub use manager::{StateLock, StateManager};
pub use objective::{Objective, ObjectiveLevel};
pub use store::{NewTask, TaskFilter, TaskStore};
pub use task::{ErrorRecord, StatusChange, Task, TaskError, TaskId, TaskKind, TaskStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::checkpoint::CheckpointLog;
use crate::loop_detect::Intervention;
use crate::phase::Phase;

pub const STATE_VERSION: u32 = 1;

/// Review status of a file produced by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    #[default]
    Unknown,
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReviewStatus::Unknown => "unknown",
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// Tracked state of one project file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// SHA-256 of the content last written by the pipeline.
    pub hash: String,
    pub review: ReviewStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Counters that must survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    pub iteration: u64,
    pub next_action_seq: u64,
    /// Iterations in a row that changed no file and no task, within
    /// `streak_scope`.
    pub consecutive_no_progress: u32,
    /// Checkpoint scope (task id or phase key) the streak belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streak_scope: Option<String>,
    /// Per-task iterations in a row without progress.
    pub task_stalls: BTreeMap<String, u32>,
    /// Loop hints surfaced to the model per task since its last progress.
    pub hints_surfaced: BTreeMap<String, u32>,
    /// Planning passes in a row that created no task.
    pub idle_planning_passes: u32,
    /// Completed-task count when documentation last ran.
    pub documented_at_completed: usize,
    /// Completed-task count when refactoring last ran.
    pub refactored_at_completed: usize,
    pub last_refactor_iteration: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub version: u32,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tasks: TaskStore,
    #[serde(default)]
    pub checkpoints: CheckpointLog,
    #[serde(default)]
    pub actions: ActionLog,
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_intervention: Option<Intervention>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_phase: Option<Phase>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            updated_at: now,
            tasks: TaskStore::default(),
            checkpoints: CheckpointLog::default(),
            actions: ActionLog::default(),
            files: BTreeMap::new(),
            counters: Counters::default(),
            pending_intervention: None,
            last_phase: None,
        }
    }

    /// Reserve the next dispatch sequence number.
    pub fn next_seq(&mut self) -> u64 {
        self.counters.next_action_seq += 1;
        self.counters.next_action_seq
    }

    /// Record a pipeline write to `path`. A content change resets the file to
    /// pending review. Returns whether the content changed.
    pub fn record_file_write(&mut self, path: &str, hash: &str, task_id: Option<&str>) -> bool {
        let now = Utc::now();
        match self.files.get_mut(path) {
            Some(rec) if rec.hash == hash => false,
            Some(rec) => {
                rec.hash = hash.to_string();
                rec.review = ReviewStatus::Pending;
                rec.updated_at = now;
                rec.task_id = task_id.map(str::to_string);
                true
            }
            None => {
                self.files.insert(
                    path.to_string(),
                    FileRecord {
                        hash: hash.to_string(),
                        review: ReviewStatus::Pending,
                        updated_at: now,
                        task_id: task_id.map(str::to_string),
                    },
                );
                true
            }
        }
    }

    pub fn record_file_removed(&mut self, path: &str) {
        self.files.remove(path);
    }

    pub fn set_review(&mut self, path: &str, review: ReviewStatus) {
        let rec = self
            .files
            .entry(path.to_string())
            .or_insert_with(|| FileRecord {
                hash: String::new(),
                review: ReviewStatus::Unknown,
                updated_at: Utc::now(),
                task_id: None,
            });
        rec.review = review;
        rec.updated_at = Utc::now();
    }

    pub fn files_with_review(&self, review: ReviewStatus) -> Vec<&str> {
        self.files
            .iter()
            .filter(|(_, r)| r.review == review)
            .map(|(p, _)| p.as_str())
            .collect()
    }

    /// The no-progress streak for `scope` once an iteration with the given
    /// outcome is counted. A streak never carries over from another scope.
    pub fn streak_after(&self, scope: &str, made_progress: bool) -> u32 {
        if made_progress {
            return 0;
        }
        let prior = if self.counters.streak_scope.as_deref() == Some(scope) {
            self.counters.consecutive_no_progress
        } else {
            0
        };
        prior + 1
    }

    /// Reset the per-task stall and hint counters after the task progressed.
    pub fn clear_stall(&mut self, task_id: &str) {
        self.counters.task_stalls.remove(task_id);
        self.counters.hints_surfaced.remove(task_id);
    }
}
