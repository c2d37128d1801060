//! Task records and the task state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::ErrorKind;
use crate::phase::Phase;
use crate::retry::EscalationReport;

pub type TaskId = String;

/// Lifecycle status of a task.
///
/// ```text
/// NEW -> IN_PROGRESS -> AWAITING_REVIEW -> COMPLETED
///            |                 |
///            v                 v
///         FAILED <------ NEEDS_FIXES -> IN_PROGRESS (below the retry ceiling)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    InProgress,
    AwaitingReview,
    NeedsFixes,
    Completed,
    /// Always carries an escalation report.
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::New,
        TaskStatus::InProgress,
        TaskStatus::AwaitingReview,
        TaskStatus::NeedsFixes,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// The legal transition table.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (New, InProgress)
                | (InProgress, AwaitingReview)
                | (InProgress, Failed)
                | (AwaitingReview, Completed)
                | (AwaitingReview, NeedsFixes)
                | (NeedsFixes, InProgress)
                | (NeedsFixes, Failed)
        )
    }

    /// Transitions that start a new attempt and therefore count against the
    /// retry ceiling.
    pub fn is_new_attempt(self, to: TaskStatus) -> bool {
        self == TaskStatus::NeedsFixes && to == TaskStatus::InProgress
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::New => "NEW",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::AwaitingReview => "AWAITING_REVIEW",
            TaskStatus::NeedsFixes => "NEEDS_FIXES",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "NEW" => Ok(TaskStatus::New),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "AWAITING_REVIEW" => Ok(TaskStatus::AwaitingReview),
            "NEEDS_FIXES" => Ok(TaskStatus::NeedsFixes),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            _ => anyhow::bail!(
                "Invalid task status '{}'. Valid values: new, in_progress, awaiting_review, needs_fixes, completed, failed",
                s
            ),
        }
    }
}

/// What kind of work a task represents; decides which phase develops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[default]
    Feature,
    Fix,
    Refactor,
    Documentation,
}

impl TaskKind {
    /// Infer a kind from the target path and description.
    pub fn infer(description: &str, target: &str) -> Self {
        let lower = description.to_lowercase();
        if target.ends_with(".md")
            || target.ends_with(".rst")
            || ["document", "readme", "docstring"]
                .iter()
                .any(|k| lower.contains(k))
        {
            TaskKind::Documentation
        } else if ["refactor", "merge duplicate", "consolidate"]
            .iter()
            .any(|k| lower.contains(k))
        {
            TaskKind::Refactor
        } else if lower.starts_with("fix") {
            TaskKind::Fix
        } else {
            TaskKind::Feature
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskKind::Feature => "feature",
            TaskKind::Fix => "fix",
            TaskKind::Refactor => "refactor",
            TaskKind::Documentation => "documentation",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TaskKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "feature" => Ok(TaskKind::Feature),
            "fix" => Ok(TaskKind::Fix),
            "refactor" => Ok(TaskKind::Refactor),
            "documentation" | "docs" => Ok(TaskKind::Documentation),
            _ => anyhow::bail!(
                "Invalid task kind '{}'. Valid values: feature, fix, refactor, documentation",
                s
            ),
        }
    }
}

/// One entry in a task's error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// 1-based attempt during which the error happened.
    pub attempt_number: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

/// Error details supplied alongside a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskError {
    pub message: String,
    pub phase: Option<Phase>,
    pub kind: Option<ErrorKind>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            phase: None,
            kind: None,
        }
    }

    pub fn in_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        TaskError::new(message)
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        TaskError::new(message)
    }
}

/// A recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub timestamp: DateTime<Utc>,
}

/// A unit of work with a target artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub target: String,
    #[serde(default)]
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Lower numbers are more urgent (1..=10).
    pub priority: u8,
    pub attempt_count: u32,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub history: Vec<StatusChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    /// Creation order, used as the scheduling tie-break.
    pub created_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<EscalationReport>,
}

impl Task {
    /// Deterministic id for (description, target): identical work always
    /// hashes to the same id.
    pub fn derive_id(description: &str, target: &str) -> TaskId {
        let mut hasher = Sha256::new();
        hasher.update(description.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(target.as_bytes());
        format!("{:x}", hasher.finalize())[..12].to_string()
    }

    /// The attempt number the next error would be recorded under.
    pub fn current_attempt(&self) -> u32 {
        self.attempt_count + 1
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.errors.last()
    }
}
