//! The task/objective store.
//!
//! All task mutation goes through this API. Status changes are checked
//! against the transition table in [`TaskStatus::can_transition_to`], retries
//! are checked against the retry ceiling before they are granted, and a
//! transition to `FAILED` always attaches an escalation report built from the
//! task's full history.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::objective::{Objective, ObjectiveLevel};
use super::task::{ErrorRecord, StatusChange, Task, TaskError, TaskId, TaskKind, TaskStatus};
use crate::errors::StoreError;
use crate::retry::EscalationReport;

pub const DEFAULT_RETRY_CEILING: u32 = 2;
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

fn default_ceiling() -> u32 {
    DEFAULT_RETRY_CEILING
}

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub description: String,
    pub target: String,
    pub priority: u8,
    pub kind: Option<TaskKind>,
    pub objective: Option<String>,
}

impl NewTask {
    pub fn new(description: impl Into<String>, target: impl Into<String>, priority: u8) -> Self {
        Self {
            description: description.into(),
            target: target.into(),
            priority,
            kind: None,
            objective: None,
        }
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn objective(mut self, objective_id: impl Into<String>) -> Self {
        self.objective = Some(objective_id.into());
        self
    }
}

/// Which tasks `get_next_task` may return.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Vec<TaskStatus>,
    pub kinds: Vec<TaskKind>,
}

impl TaskFilter {
    pub fn status(statuses: &[TaskStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            kinds: Vec::new(),
        }
    }

    pub fn with_kinds(mut self, kinds: &[TaskKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && (self.kinds.is_empty() || self.kinds.contains(&task.kind))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStore {
    #[serde(default)]
    tasks: BTreeMap<TaskId, Task>,
    #[serde(default)]
    objectives: BTreeMap<String, Objective>,
    #[serde(default)]
    next_seq: u64,
    #[serde(skip, default = "default_ceiling")]
    retry_ceiling: u32,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self {
            tasks: BTreeMap::new(),
            objectives: BTreeMap::new(),
            next_seq: 0,
            retry_ceiling: DEFAULT_RETRY_CEILING,
        }
    }
}

impl PartialEq for TaskStore {
    fn eq(&self, other: &Self) -> bool {
        self.tasks == other.tasks
            && self.objectives == other.objectives
            && self.next_seq == other.next_seq
    }
}

impl TaskStore {
    pub fn with_ceiling(retry_ceiling: u32) -> Self {
        Self {
            retry_ceiling,
            ..Self::default()
        }
    }

    pub fn set_retry_ceiling(&mut self, retry_ceiling: u32) {
        self.retry_ceiling = retry_ceiling;
    }

    pub fn retry_ceiling(&self) -> u32 {
        self.retry_ceiling
    }

    /// Create a task, or return the id of the live task with the same
    /// (description, target).
    pub fn create_task(&mut self, description: &str, target: &str, priority: u8) -> TaskId {
        self.create(NewTask::new(description, target, priority)).0
    }

    /// Create a task from full parameters. Returns the id and whether a new
    /// record was inserted.
    ///
    /// When every earlier record for the same (description, target) is
    /// terminal, the new task gets a generation suffix (`<id>-2`, `<id>-3`, ...)
    /// so the terminal history is preserved and the id stays deterministic.
    pub fn create(&mut self, new: NewTask) -> (TaskId, bool) {
        let target = crate::util::normalize_path(&new.target);
        let base = Task::derive_id(&new.description, &target);

        let mut generation = 1u32;
        let id = loop {
            let candidate = if generation == 1 {
                base.clone()
            } else {
                format!("{}-{}", base, generation)
            };
            match self.tasks.get(&candidate) {
                None => break candidate,
                Some(existing) if !existing.status.is_terminal() => {
                    debug!(task_id = %candidate, "create_task collapsed onto existing task");
                    return (candidate, false);
                }
                Some(_) => generation += 1,
            }
        };

        let now = Utc::now();
        let kind = new
            .kind
            .unwrap_or_else(|| TaskKind::infer(&new.description, &target));
        let objective = new.objective.filter(|o| self.objectives.contains_key(o));
        let task = Task {
            id: id.clone(),
            description: new.description.trim().to_string(),
            target,
            kind,
            status: TaskStatus::New,
            priority: new.priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            attempt_count: 0,
            errors: Vec::new(),
            history: Vec::new(),
            objective: objective.clone(),
            created_seq: self.next_seq,
            created_at: now,
            updated_at: now,
            report: None,
        };
        self.next_seq += 1;

        if let Some(obj_id) = objective
            && let Some(obj) = self.objectives.get_mut(&obj_id)
        {
            obj.task_ids.push(id.clone());
        }

        debug!(task_id = %id, kind = %task.kind, "Created task");
        self.tasks.insert(id.clone(), task);
        (id, true)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks matching `filter` in scheduling order: most urgent priority
    /// first, then earliest created.
    pub fn ordered(&self, filter: &TaskFilter) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().filter(|t| filter.matches(t)).collect();
        tasks.sort_by_key(|t| (t.priority, t.created_seq));
        tasks
    }

    /// The most urgent task matching `filter`.
    pub fn get_next_task(&self, filter: &TaskFilter) -> Option<&Task> {
        self.tasks
            .values()
            .filter(|t| filter.matches(t))
            .min_by_key(|t| (t.priority, t.created_seq))
    }

    /// Apply a status transition, optionally recording an error.
    ///
    /// Fails with `InvalidTransition` for transitions outside the table and
    /// with `RetryCeilingReached` when a retry would exceed the ceiling. A
    /// rejected update leaves the task untouched.
    pub fn update_task(
        &mut self,
        id: &str,
        to: TaskStatus,
        error: Option<TaskError>,
    ) -> Result<&Task, StoreError> {
        let ceiling = self.retry_ceiling;
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound {
                task_id: id.to_string(),
            })?;

        let from = task.status;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                task_id: id.to_string(),
                from,
                to,
            });
        }
        if from.is_new_attempt(to) && task.attempt_count >= ceiling {
            return Err(StoreError::RetryCeilingReached {
                task_id: id.to_string(),
                attempts: task.attempt_count,
                ceiling,
            });
        }

        let now = Utc::now();
        if let Some(err) = &error {
            push_error(task, err);
        }
        if from.is_new_attempt(to) {
            task.attempt_count += 1;
        }
        task.history.push(StatusChange {
            from,
            to,
            timestamp: now,
        });
        task.status = to;
        task.updated_at = now;

        if to == TaskStatus::Failed {
            let reason = error
                .map(|e| e.message)
                .unwrap_or_else(|| "Escalated without further detail".to_string());
            warn!(task_id = %id, attempts = task.attempt_count, "Task failed; escalation report attached");
            task.report = Some(EscalationReport::build(task, &reason));
        } else {
            debug!(task_id = %id, %from, %to, "Task transition");
        }

        Ok(task)
    }

    /// Append to a task's error history without changing its status.
    pub fn record_error(&mut self, id: &str, error: TaskError) -> Result<(), StoreError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound {
                task_id: id.to_string(),
            })?;
        push_error(task, &error);
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Drive a live task to `FAILED` through legal transitions in one call,
    /// attaching an escalation report. The walk is validated before anything
    /// is applied.
    pub fn escalate(&mut self, id: &str, reason: TaskError) -> Result<&Task, StoreError> {
        let status = self
            .tasks
            .get(id)
            .map(|t| t.status)
            .ok_or_else(|| StoreError::TaskNotFound {
                task_id: id.to_string(),
            })?;

        let path: &[TaskStatus] = match status {
            TaskStatus::New => &[TaskStatus::InProgress, TaskStatus::Failed],
            TaskStatus::InProgress | TaskStatus::NeedsFixes => &[TaskStatus::Failed],
            TaskStatus::AwaitingReview => &[TaskStatus::NeedsFixes, TaskStatus::Failed],
            TaskStatus::Completed | TaskStatus::Failed => {
                return Err(StoreError::InvalidTransition {
                    task_id: id.to_string(),
                    from: status,
                    to: TaskStatus::Failed,
                });
            }
        };

        let (last, steps) = path
            .split_last()
            .ok_or_else(|| StoreError::TaskNotFound {
                task_id: id.to_string(),
            })?;
        for step in steps {
            self.update_task(id, *step, None)?;
        }
        self.update_task(id, *last, Some(reason))
    }

    pub fn count_by_status(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Share of tasks that are COMPLETED.
    pub fn completion_ratio(&self) -> f64 {
        if self.tasks.is_empty() {
            return 0.0;
        }
        let done = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        done as f64 / self.tasks.len() as f64
    }

    /// Return the id of the objective with `title`, creating it if needed.
    pub fn ensure_objective(&mut self, title: &str, level: ObjectiveLevel) -> String {
        let id = Objective::derive_id(title);
        self.objectives
            .entry(id.clone())
            .or_insert_with(|| Objective {
                id: id.clone(),
                title: title.trim().to_string(),
                level,
                task_ids: Vec::new(),
                created_at: Utc::now(),
            });
        id
    }

    pub fn objectives(&self) -> impl Iterator<Item = &Objective> {
        self.objectives.values()
    }

    /// Share of an objective's tasks that are COMPLETED.
    pub fn objective_progress(&self, objective_id: &str) -> Option<f64> {
        let obj = self.objectives.get(objective_id)?;
        if obj.task_ids.is_empty() {
            return Some(0.0);
        }
        let done = obj
            .task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        Some(done as f64 / obj.task_ids.len() as f64)
    }
}

fn push_error(task: &mut Task, error: &TaskError) {
    task.errors.push(ErrorRecord {
        attempt_number: task.current_attempt(),
        message: error.message.clone(),
        timestamp: Utc::now(),
        phase: error.phase,
        kind: error.kind,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_task() -> (TaskStore, TaskId) {
        let mut store = TaskStore::default();
        let id = store.create_task("Add parser", "src/parser.py", 5);
        (store, id)
    }

    /// Walk a task through one failed review cycle.
    fn fail_once(store: &mut TaskStore, id: &str) {
        let status = store.get(id).unwrap().status;
        match status {
            TaskStatus::New => {
                store.update_task(id, TaskStatus::InProgress, None).unwrap();
            }
            TaskStatus::NeedsFixes => {
                store.update_task(id, TaskStatus::InProgress, None).unwrap();
            }
            _ => {}
        }
        store
            .update_task(id, TaskStatus::AwaitingReview, None)
            .unwrap();
        store
            .update_task(id, TaskStatus::NeedsFixes, Some("tests fail".into()))
            .unwrap();
    }

    #[test]
    fn test_create_task_is_idempotent() {
        let mut store = TaskStore::default();
        let a = store.create_task("Add parser", "src/parser.py", 5);
        let b = store.create_task("Add parser", "./src/parser.py", 3);
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).unwrap().priority, 5);
    }

    #[test]
    fn test_create_task_after_terminal_gets_generation_suffix() {
        let (mut store, id) = store_with_task();
        store.escalate(&id, "gave up".into()).unwrap();

        let again = store.create_task("Add parser", "src/parser.py", 5);
        assert_eq!(again, format!("{}-2", id));
        assert_eq!(store.len(), 2);
        assert_eq!(store.create_task("Add parser", "src/parser.py", 5), again);
    }

    #[test]
    fn test_priority_is_clamped() {
        let mut store = TaskStore::default();
        let id = store.create_task("x", "a.py", 0);
        assert_eq!(store.get(&id).unwrap().priority, MIN_PRIORITY);
        let id = store.create_task("y", "a.py", 99);
        assert_eq!(store.get(&id).unwrap().priority, MAX_PRIORITY);
    }

    #[test]
    fn test_get_next_task_orders_by_priority_then_creation() {
        let mut store = TaskStore::default();
        let late_urgent = {
            store.create_task("first", "a.py", 5);
            store.create_task("second", "b.py", 2)
        };
        let tie = store.create_task("third", "c.py", 2);

        let filter = TaskFilter::status(&[TaskStatus::New]);
        assert_eq!(store.get_next_task(&filter).unwrap().id, late_urgent);

        store
            .update_task(&late_urgent, TaskStatus::InProgress, None)
            .unwrap();
        assert_eq!(store.get_next_task(&filter).unwrap().id, tie);
    }

    #[test]
    fn test_get_next_task_respects_kind_filter() {
        let mut store = TaskStore::default();
        store.create_task("Add parser", "a.py", 1);
        let docs = store.create_task("Write guide", "GUIDE.md", 5);
        let filter =
            TaskFilter::status(&[TaskStatus::New]).with_kinds(&[TaskKind::Documentation]);
        assert_eq!(store.get_next_task(&filter).unwrap().id, docs);
    }

    #[test]
    fn test_invalid_transition_is_rejected_without_change() {
        let (mut store, id) = store_with_task();
        let err = store
            .update_task(&id, TaskStatus::Completed, Some("nope".into()))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::New);
        assert!(task.errors.is_empty());
    }

    #[test]
    fn test_unknown_task() {
        let mut store = TaskStore::default();
        let err = store
            .update_task("missing", TaskStatus::InProgress, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::TaskNotFound { .. }));
    }

    #[test]
    fn test_attempt_count_only_grows_on_retry() {
        let (mut store, id) = store_with_task();
        store.update_task(&id, TaskStatus::InProgress, None).unwrap();
        assert_eq!(store.get(&id).unwrap().attempt_count, 0);
        store
            .update_task(&id, TaskStatus::AwaitingReview, None)
            .unwrap();
        store
            .update_task(&id, TaskStatus::NeedsFixes, Some("bad".into()))
            .unwrap();
        assert_eq!(store.get(&id).unwrap().attempt_count, 0);
        store.update_task(&id, TaskStatus::InProgress, None).unwrap();
        assert_eq!(store.get(&id).unwrap().attempt_count, 1);
    }

    #[test]
    fn test_retry_refused_at_ceiling() {
        let mut store = TaskStore::with_ceiling(2);
        let id = store.create_task("Add parser", "src/parser.py", 5);
        let mut last_attempts = 0;
        for _ in 0..3 {
            fail_once(&mut store, &id);
            let attempts = store.get(&id).unwrap().attempt_count;
            assert!(attempts >= last_attempts);
            last_attempts = attempts;
        }
        assert_eq!(store.get(&id).unwrap().attempt_count, 2);

        let err = store
            .update_task(&id, TaskStatus::InProgress, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::RetryCeilingReached { .. }));
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::NeedsFixes);
    }

    #[test]
    fn test_failed_transition_attaches_report_with_full_history() {
        let (mut store, id) = store_with_task();
        fail_once(&mut store, &id);
        fail_once(&mut store, &id);
        let task = store
            .update_task(&id, TaskStatus::Failed, Some("ceiling reached".into()))
            .unwrap();
        let report = task.report.as_ref().expect("report attached");
        assert_eq!(report.reason, "ceiling reached");
        assert_eq!(report.errors.len(), 3);
        assert_eq!(report.errors[0].attempt_number, 1);
        assert_eq!(report.errors[1].attempt_number, 2);
    }

    #[test]
    fn test_escalate_from_awaiting_review_walks_legal_path() {
        let (mut store, id) = store_with_task();
        store.update_task(&id, TaskStatus::InProgress, None).unwrap();
        store
            .update_task(&id, TaskStatus::AwaitingReview, None)
            .unwrap();
        let task = store.escalate(&id, "unfixable".into()).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.report.is_some());
        let path: Vec<_> = task.history.iter().map(|c| c.to).collect();
        assert_eq!(
            path,
            vec![
                TaskStatus::InProgress,
                TaskStatus::AwaitingReview,
                TaskStatus::NeedsFixes,
                TaskStatus::Failed
            ]
        );
    }

    #[test]
    fn test_escalate_terminal_task_fails() {
        let (mut store, id) = store_with_task();
        store.escalate(&id, "x".into()).unwrap();
        assert!(store.escalate(&id, "again".into()).is_err());
    }

    #[test]
    fn test_error_attempt_numbers_are_one_based() {
        let (mut store, id) = store_with_task();
        store.record_error(&id, "first".into()).unwrap();
        assert_eq!(store.get(&id).unwrap().errors[0].attempt_number, 1);
    }

    #[test]
    fn test_objective_linking_and_progress() {
        let mut store = TaskStore::default();
        let obj = store.ensure_objective("Parser", ObjectiveLevel::Primary);
        assert_eq!(store.ensure_objective("parser ", ObjectiveLevel::Tertiary), obj);

        let (a, _) = store.create(NewTask::new("lex", "lex.py", 5).objective(&obj));
        let (_b, _) = store.create(NewTask::new("parse", "parse.py", 5).objective(&obj));
        assert_eq!(store.objective_progress(&obj), Some(0.0));

        store.update_task(&a, TaskStatus::InProgress, None).unwrap();
        store.update_task(&a, TaskStatus::AwaitingReview, None).unwrap();
        store.update_task(&a, TaskStatus::Completed, None).unwrap();
        assert_eq!(store.objective_progress(&obj), Some(0.5));
    }

    #[test]
    fn test_unknown_objective_is_not_linked() {
        let mut store = TaskStore::default();
        let (id, _) = store.create(NewTask::new("lex", "lex.py", 5).objective("obj-nope"));
        assert!(store.get(&id).unwrap().objective.is_none());
    }

    #[test]
    fn test_completion_ratio() {
        let mut store = TaskStore::default();
        assert_eq!(store.completion_ratio(), 0.0);
        let a = store.create_task("a", "a.py", 5);
        store.create_task("b", "b.py", 5);
        store.update_task(&a, TaskStatus::InProgress, None).unwrap();
        store.update_task(&a, TaskStatus::AwaitingReview, None).unwrap();
        store.update_task(&a, TaskStatus::Completed, None).unwrap();
        assert_eq!(store.completion_ratio(), 0.5);
    }
}
