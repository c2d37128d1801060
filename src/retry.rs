//! Retry and escalation policy.
//!
//! After each iteration the coordinator summarizes what happened in an
//! [`IterationOutcome`]; [`RetryPolicy::decide`] turns that into a
//! [`Verdict`] and [`RetryPolicy::apply`] carries it out through the task
//! store. Retries of failed work go through [`RetryPolicy::resume`], which
//! lets the store refuse the retry at the ceiling and escalates instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::checkpoint::scope_key;
use crate::errors::{ErrorKind, StoreError};
use crate::loop_detect::Intervention;
use crate::phase::Phase;
use crate::state::{ErrorRecord, PipelineState, StatusChange, Task, TaskError, TaskStatus};

/// Human-readable record produced when automation gives up on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationReport {
    pub task_id: String,
    pub description: String,
    pub target: String,
    pub reason: String,
    pub attempts: u32,
    pub errors: Vec<ErrorRecord>,
    pub status_history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
}

impl EscalationReport {
    /// Build a report from the task's full history.
    pub fn build(task: &Task, reason: &str) -> Self {
        Self {
            task_id: task.id.clone(),
            description: task.description.clone(),
            target: task.target.clone(),
            reason: reason.to_string(),
            attempts: task.attempt_count,
            errors: task.errors.clone(),
            status_history: task.history.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Escalation: {}\n\n", self.description));
        out.push_str(&format!("- Task: `{}`\n", self.task_id));
        out.push_str(&format!("- Target: `{}`\n", self.target));
        out.push_str(&format!("- Retries used: {}\n", self.attempts));
        out.push_str(&format!("- Escalated: {}\n\n", self.created_at.to_rfc3339()));
        out.push_str(&format!("## Reason\n\n{}\n\n", self.reason));

        out.push_str("## Attempt history\n\n");
        if self.errors.is_empty() {
            out.push_str("No errors were recorded.\n");
        }
        for err in &self.errors {
            let phase = err.phase.map(|p| format!(" [{}]", p)).unwrap_or_default();
            let kind = err.kind.map(|k| format!(" ({})", k)).unwrap_or_default();
            out.push_str(&format!(
                "- Attempt {}{}{} at {}: {}\n",
                err.attempt_number,
                phase,
                kind,
                err.timestamp.to_rfc3339(),
                err.message
            ));
        }

        out.push_str("\n## Status history\n\n");
        for change in &self.status_history {
            out.push_str(&format!(
                "- {} -> {} at {}\n",
                change.from,
                change.to,
                change.timestamp.to_rfc3339()
            ));
        }
        out
    }

    /// Write the markdown report to `<dir>/<task-id>.md`.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(format!("{}.md", self.task_id));
        crate::util::atomic_write(&path, self.to_markdown().as_bytes())?;
        Ok(path)
    }
}

/// How a task was prepared for the iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// NEW task moved to IN_PROGRESS.
    Started,
    /// NEEDS_FIXES task granted another attempt.
    Retrying { attempt: u32 },
    /// The retry ceiling was reached; the task is now FAILED with a report.
    Escalated,
    /// No transition needed.
    Unchanged,
}

/// Summary of one iteration, as input to the policy.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub phase: Phase,
    pub task_id: Option<String>,
    /// Status of the task after dispatch.
    pub task_status: Option<TaskStatus>,
    /// Status of the task before dispatch.
    pub status_before: Option<TaskStatus>,
    pub files_changed: usize,
    /// A tool created or transitioned a task.
    pub tasks_changed: bool,
    pub intervention: Option<Intervention>,
    /// Hints already surfaced for this task since its last progress.
    pub hints_surfaced: u32,
    /// Stalled iterations in a row before this one.
    pub stalls: u32,
}

impl IterationOutcome {
    pub fn made_progress(&self) -> bool {
        self.files_changed > 0 || self.tasks_changed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Continue,
    SubmitForReview,
    Stalled,
    Escalate { reason: String, kind: ErrorKind },
    InconclusiveReview { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub decision: Decision,
    /// Intervention to surface to the next model invocation.
    pub hint: Option<Intervention>,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    stall_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    pub fn new(stall_limit: u32) -> Self {
        Self {
            stall_limit: stall_limit.max(1),
        }
    }

    pub fn stall_limit(&self) -> u32 {
        self.stall_limit
    }

    /// Prepare the selected task for work. A NEEDS_FIXES task is retried only
    /// if the store grants the retry; at the ceiling it is escalated in the
    /// same call.
    pub fn resume(
        &self,
        state: &mut PipelineState,
        task_id: &str,
        phase: Phase,
    ) -> Result<Resume, StoreError> {
        let status = state
            .tasks
            .get(task_id)
            .map(|t| t.status)
            .ok_or_else(|| StoreError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;

        match status {
            TaskStatus::New => {
                state.tasks.update_task(task_id, TaskStatus::InProgress, None)?;
                Ok(Resume::Started)
            }
            TaskStatus::NeedsFixes => {
                match state.tasks.update_task(task_id, TaskStatus::InProgress, None) {
                    Ok(task) => {
                        let attempt = task.attempt_count;
                        info!(task_id, attempt, "Retrying task");
                        Ok(Resume::Retrying { attempt })
                    }
                    Err(StoreError::RetryCeilingReached {
                        attempts, ceiling, ..
                    }) => {
                        let reason = format!(
                            "Retry ceiling reached: {} of {} retries used and the task still needs fixes",
                            attempts, ceiling
                        );
                        warn!(task_id, attempts, "Escalating task at retry ceiling");
                        state.tasks.update_task(
                            task_id,
                            TaskStatus::Failed,
                            Some(TaskError::new(reason).in_phase(phase)),
                        )?;
                        Ok(Resume::Escalated)
                    }
                    Err(e) => Err(e),
                }
            }
            _ => Ok(Resume::Unchanged),
        }
    }

    pub fn decide(&self, outcome: &IterationOutcome) -> Verdict {
        let hint = outcome.intervention.clone();
        let status_changed = outcome.status_before != outcome.task_status;

        let (Some(_), Some(status)) = (&outcome.task_id, outcome.task_status) else {
            return Verdict {
                decision: Decision::Continue,
                hint,
            };
        };
        if status_changed || status.is_terminal() {
            return Verdict {
                decision: Decision::Continue,
                hint: None,
            };
        }

        let loop_persisted = outcome.intervention.is_some() && outcome.hints_surfaced > 0;
        let stalled_out = !outcome.made_progress() && outcome.stalls + 1 >= self.stall_limit;

        let decision = match status {
            TaskStatus::InProgress => {
                if outcome.files_changed > 0 {
                    Decision::SubmitForReview
                } else if let (true, Some(hit)) = (loop_persisted, &outcome.intervention) {
                    Decision::Escalate {
                        reason: format!(
                            "Loop persisted after an intervention: {}",
                            hit.description
                        ),
                        kind: ErrorKind::LoopDetected,
                    }
                } else if stalled_out {
                    Decision::Escalate {
                        reason: format!(
                            "No progress in {} consecutive {} iterations",
                            outcome.stalls + 1,
                            outcome.phase
                        ),
                        kind: ErrorKind::LoopDetected,
                    }
                } else if outcome.made_progress() {
                    Decision::Continue
                } else {
                    Decision::Stalled
                }
            }
            TaskStatus::AwaitingReview => {
                if loop_persisted || stalled_out {
                    Decision::InconclusiveReview {
                        reason: format!(
                            "Review was inconclusive after {} iterations",
                            outcome.stalls + 1
                        ),
                    }
                } else if outcome.made_progress() {
                    Decision::Continue
                } else {
                    Decision::Stalled
                }
            }
            _ => Decision::Continue,
        };

        let hint = match decision {
            Decision::Continue | Decision::Stalled => hint,
            _ => None,
        };
        Verdict { decision, hint }
    }

    /// Carry out a verdict against the pipeline state. On error the tasks,
    /// counters and pending intervention are restored to what they were
    /// before the call.
    pub fn apply(
        &self,
        state: &mut PipelineState,
        outcome: &IterationOutcome,
        verdict: Verdict,
    ) -> Result<(), StoreError> {
        let saved = (
            state.tasks.clone(),
            state.counters.clone(),
            state.pending_intervention.clone(),
        );
        let applied = self.apply_verdict(state, outcome, verdict);
        if applied.is_err() {
            (state.tasks, state.counters, state.pending_intervention) = saved;
        }
        applied
    }

    fn apply_verdict(
        &self,
        state: &mut PipelineState,
        outcome: &IterationOutcome,
        verdict: Verdict,
    ) -> Result<(), StoreError> {
        let scope = scope_key(outcome.task_id.as_deref(), outcome.phase);
        state.counters.consecutive_no_progress = state.streak_after(&scope, outcome.made_progress());
        state.counters.streak_scope = Some(scope);

        if let Some(task_id) = outcome.task_id.as_deref() {
            match &verdict.decision {
                Decision::Continue => {
                    if outcome.made_progress() {
                        state.clear_stall(task_id);
                    }
                }
                Decision::SubmitForReview => {
                    state
                        .tasks
                        .update_task(task_id, TaskStatus::AwaitingReview, None)?;
                    state.clear_stall(task_id);
                }
                Decision::Stalled => {
                    *state
                        .counters
                        .task_stalls
                        .entry(task_id.to_string())
                        .or_insert(0) += 1;
                }
                Decision::Escalate { reason, kind } => {
                    state.tasks.escalate(
                        task_id,
                        TaskError::new(reason.clone())
                            .in_phase(outcome.phase)
                            .with_kind(*kind),
                    )?;
                    state.clear_stall(task_id);
                }
                Decision::InconclusiveReview { reason } => {
                    state.tasks.update_task(
                        task_id,
                        TaskStatus::NeedsFixes,
                        Some(TaskError::new(reason.clone()).in_phase(outcome.phase)),
                    )?;
                    state.clear_stall(task_id);
                }
            }
        }

        if let Some(hint) = verdict.hint {
            if let Some(task_id) = hint.task_id.as_deref() {
                *state
                    .counters
                    .hints_surfaced
                    .entry(task_id.to_string())
                    .or_insert(0) += 1;
            }
            warn!(pattern = %hint.pattern, severity = ?hint.severity, "Loop detected; intervention queued");
            state.pending_intervention = Some(hint);
        }
        Ok(())
    }
}
