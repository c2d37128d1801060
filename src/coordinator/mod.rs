//! The coordinator loop.
//!
//! One iteration: reload state, select a phase, build the model request,
//! invoke the model, dispatch its tool calls, run loop detection, apply the
//! retry policy, persist. Iterations are strictly sequential and the state
//! file is reloaded at the top of each one, so a crash at any point resumes
//! from the last persisted iteration.

pub mod prompt;

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::checkpoint::scope_key;
use crate::config::Config;
use crate::errors::PersistError;
use crate::loop_detect::{Intervention, LoopDetector};
use crate::model::{ModelClient, ModelRequest};
use crate::phase::{Phase, PhaseSelector, Selection};
use crate::retry::{Decision, IterationOutcome, Resume, RetryPolicy};
use crate::state::{PipelineState, StateManager, TaskError, TaskStatus};
use crate::tools::builtin::Workspace;
use crate::tools::{DispatchContext, Dispatcher, ToolRegistry, ToolResult};

/// Recent actions included in a model request.
const RECENT_ACTIONS: usize = 10;

/// What a single iteration did.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: u64,
    pub phase: Phase,
    pub task_id: Option<String>,
    pub reason: String,
    pub resume: Option<Resume>,
    pub results: Vec<ToolResult>,
    pub files_changed: usize,
    pub tasks_changed: bool,
    pub intervention: Option<Intervention>,
    pub decision: Option<Decision>,
    pub model_error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Step {
    Ran(Box<IterationReport>),
    Complete,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every task is terminal and planning has nothing to add.
    Complete,
    MaxIterations,
    /// Planning passes produced no task on an empty project.
    NothingPlanned,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub iterations: u64,
    pub stop: StopReason,
    pub counts: BTreeMap<TaskStatus, usize>,
    /// Ids of tasks that are FAILED at the end of the run.
    pub failed: Vec<String>,
}

pub struct Coordinator<M: ModelClient> {
    manager: StateManager,
    model: M,
    dispatcher: Dispatcher,
    selector: PhaseSelector,
    detector: LoopDetector,
    policy: RetryPolicy,
    reports_dir: PathBuf,
}

impl<M: ModelClient> Coordinator<M> {
    /// Build a coordinator from validated configuration.
    pub fn from_config(config: &Config, model: M) -> Result<Self> {
        config.validate()?;
        let toml = &config.toml;

        let registry = ToolRegistry::builtin()
            .with_external(&toml.tools.external)
            .context("Failed to register external tools")?;
        let dispatcher = Dispatcher::new(
            registry,
            Workspace::new(&config.project_dir, &config.backup_dir),
            Duration::from_secs(toml.tools.timeout_secs),
        )
        .with_parallel(toml.tools.parallel);

        let selector = PhaseSelector::new(
            toml.scheduling.work_order()?,
            toml.scheduling.completion_threshold,
            toml.scheduling.refactor_interval,
        );
        let detector = LoopDetector::new(
            toml.loop_detection.window,
            toml.loop_detection.repeat_threshold,
            toml.loop_detection.oscillation_cycles,
            toml.loop_detection.no_progress_threshold,
        );

        Ok(Self {
            manager: config.state_manager(),
            model,
            dispatcher,
            selector,
            detector,
            policy: RetryPolicy::new(toml.retry.stall_limit),
            reports_dir: config.reports_dir.clone(),
        })
    }

    pub fn manager(&self) -> &StateManager {
        &self.manager
    }

    /// Run iterations until the selector reports completion or
    /// `max_iterations` is reached. Persistence failures end the run.
    pub async fn run(&self, max_iterations: Option<u64>) -> Result<RunSummary, PersistError> {
        let mut iterations = 0u64;
        let stop = loop {
            if max_iterations.is_some_and(|max| iterations >= max) {
                info!(iterations, "Iteration limit reached");
                break StopReason::MaxIterations;
            }
            match self.run_iteration().await? {
                Step::Complete => break StopReason::Complete,
                Step::Ran(report) => {
                    iterations += 1;
                    if report.phase == Phase::Planning && self.planning_exhausted()? {
                        warn!("Planning produced no tasks; stopping");
                        break StopReason::NothingPlanned;
                    }
                }
            }
        };

        let state = self.manager.load()?;
        let summary = RunSummary {
            iterations,
            stop,
            counts: state.tasks.count_by_status(),
            failed: state
                .tasks
                .tasks()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| t.id.clone())
                .collect(),
        };
        info!(iterations, stop = ?summary.stop, failed = summary.failed.len(), "Run finished");
        Ok(summary)
    }

    fn planning_exhausted(&self) -> Result<bool, PersistError> {
        let state = self.manager.load()?;
        Ok(state.tasks.is_empty()
            && state.counters.idle_planning_passes >= self.policy.stall_limit())
    }

    /// Run exactly one iteration against the persisted state.
    pub async fn run_iteration(&self) -> Result<Step, PersistError> {
        let mut state = self.manager.load()?;

        let (phase, task_id, reason) = match self.selector.select(&state) {
            Selection::Complete => {
                info!("All work is complete");
                return Ok(Step::Complete);
            }
            Selection::Run {
                phase,
                task_id,
                reason,
            } => (phase, task_id, reason),
        };

        state.counters.iteration += 1;
        let iteration = state.counters.iteration;
        info!(iteration, %phase, task = task_id.as_deref().unwrap_or("-"), %reason, "Starting iteration");

        let mut report = IterationReport {
            iteration,
            phase,
            task_id: task_id.clone(),
            reason,
            resume: None,
            results: Vec::new(),
            files_changed: 0,
            tasks_changed: false,
            intervention: None,
            decision: None,
            model_error: None,
        };

        if let Some(id) = task_id.as_deref() {
            match self.policy.resume(&mut state, id, phase) {
                Ok(Resume::Escalated) => {
                    report.resume = Some(Resume::Escalated);
                    self.finish(&mut state, phase).await?;
                    return Ok(Step::Ran(Box::new(report)));
                }
                Ok(resume) => report.resume = Some(resume),
                Err(e) => {
                    error!(task_id = id, error = %e, "Could not prepare task");
                    self.finish(&mut state, phase).await?;
                    return Ok(Step::Ran(Box::new(report)));
                }
            }
        }

        let intervention = state.pending_intervention.take();
        self.manager.save_with_retry(&state).await?;

        let request = self.build_request(&state, phase, task_id.as_deref(), intervention);
        let calls = match self.model.complete(&request).await {
            Ok(response) => response.into_calls(),
            Err(e) => {
                warn!(error = %e, kind = %e.kind(), "Model invocation failed");
                if let Some(id) = task_id.as_deref() {
                    let err = TaskError::new(format!("Model invocation failed: {}", e))
                        .in_phase(phase)
                        .with_kind(e.kind());
                    if let Err(store_err) = state.tasks.record_error(id, err) {
                        warn!(error = %store_err, "Could not record model failure");
                    }
                }
                report.model_error = Some(e.to_string());
                Vec::new()
            }
        };

        let status_before = task_id
            .as_deref()
            .and_then(|id| state.tasks.get(id))
            .map(|t| t.status);

        let ctx = DispatchContext::new(phase, task_id.as_deref());
        let batch = self.dispatcher.dispatch(&mut state, &ctx, &calls).await;

        let detected = self.detector.detect_in(
            &state,
            phase,
            task_id.as_deref(),
            batch.files_changed > 0 || batch.tasks_changed,
        );
        let counter = |map: &BTreeMap<String, u32>| {
            task_id
                .as_deref()
                .and_then(|id| map.get(id).copied())
                .unwrap_or(0)
        };
        let outcome = IterationOutcome {
            phase,
            task_id: task_id.clone(),
            task_status: task_id
                .as_deref()
                .and_then(|id| state.tasks.get(id))
                .map(|t| t.status),
            status_before,
            files_changed: batch.files_changed,
            tasks_changed: batch.tasks_changed,
            intervention: detected.clone(),
            hints_surfaced: counter(&state.counters.hints_surfaced),
            stalls: counter(&state.counters.task_stalls),
        };

        let verdict = self.policy.decide(&outcome);
        info!(
            iteration,
            calls = batch.results.len(),
            failures = batch.failures().count(),
            files_changed = batch.files_changed,
            decision = ?verdict.decision,
            "Iteration finished"
        );
        report.decision = Some(verdict.decision.clone());
        if let Err(e) = self.policy.apply(&mut state, &outcome, verdict) {
            error!(error = %e, "Retry policy could not be applied; task left as dispatched");
            if let Some(id) = task_id.as_deref() {
                let err = TaskError::new(format!("Retry policy could not be applied: {}", e))
                    .in_phase(phase)
                    .with_kind(e.kind());
                if let Err(store_err) = state.tasks.record_error(id, err) {
                    warn!(error = %store_err, "Could not record policy failure");
                }
            }
        }

        if task_id.is_none() {
            let completed = state
                .tasks
                .count_by_status()
                .get(&TaskStatus::Completed)
                .copied()
                .unwrap_or(0);
            match phase {
                Phase::Planning => {
                    if batch.tasks_changed {
                        state.counters.idle_planning_passes = 0;
                    } else {
                        state.counters.idle_planning_passes += 1;
                    }
                }
                Phase::Documentation => state.counters.documented_at_completed = completed,
                Phase::Refactoring => {
                    state.counters.refactored_at_completed = completed;
                    state.counters.last_refactor_iteration = iteration;
                }
                _ => {}
            }
        } else if batch.tasks_changed {
            state.counters.idle_planning_passes = 0;
        }

        report.files_changed = batch.files_changed;
        report.tasks_changed = batch.tasks_changed;
        report.intervention = detected;
        report.results = batch.results;

        self.finish(&mut state, phase).await?;
        Ok(Step::Ran(Box::new(report)))
    }

    fn build_request(
        &self,
        state: &PipelineState,
        phase: Phase,
        task_id: Option<&str>,
        intervention: Option<Intervention>,
    ) -> ModelRequest {
        let task = task_id.and_then(|id| state.tasks.get(id)).cloned();
        let scope = scope_key(task_id, phase);
        ModelRequest {
            phase,
            iteration: state.counters.iteration,
            instructions: prompt::instructions(phase, task.as_ref(), intervention.as_ref()),
            state_summary: prompt::state_summary(state),
            checkpoints: state.checkpoints.steps(&scope).to_vec(),
            recent_actions: state
                .actions
                .window(phase, task_id, RECENT_ACTIONS)
                .into_iter()
                .cloned()
                .collect(),
            tools: self.dispatcher.registry().schemas_for_phase(phase),
            task,
            intervention,
        }
    }

    /// Persist the iteration and render reports for newly failed tasks.
    async fn finish(&self, state: &mut PipelineState, phase: Phase) -> Result<(), PersistError> {
        state.last_phase = Some(phase);
        state.updated_at = Utc::now();
        self.manager.save_with_retry(state).await?;
        self.write_reports(state);
        Ok(())
    }

    fn write_reports(&self, state: &PipelineState) {
        for task in state.tasks.tasks().filter(|t| t.status == TaskStatus::Failed) {
            let Some(report) = &task.report else {
                continue;
            };
            if self.reports_dir.join(format!("{}.md", task.id)).exists() {
                continue;
            }
            if let Err(e) = std::fs::create_dir_all(&self.reports_dir) {
                warn!(error = %e, "Could not create reports directory");
                return;
            }
            match report.write_to(&self.reports_dir) {
                Ok(path) => warn!(task_id = %task.id, path = %path.display(), "Escalation report written"),
                Err(e) => warn!(task_id = %task.id, error = %e, "Could not write escalation report"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ModelError;
    use crate::model::ModelResponse;
    use crate::tools::ToolCall;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Replies from a fixed script, then with no calls.
    struct Scripted {
        replies: Mutex<Vec<Result<ModelResponse, ModelError>>>,
        seen: Mutex<Vec<ModelRequest>>,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<ModelResponse, ModelError>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for Scripted {
        async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
            self.seen.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(ModelResponse::default()))
        }
    }

    fn setup() -> (tempfile::TempDir, Config) {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        config.ensure_directories().unwrap();
        (dir, config)
    }

    #[tokio::test]
    async fn test_planning_iteration_creates_tasks() {
        let (_dir, config) = setup();
        let model = Scripted::new(vec![Ok(ModelResponse::with_calls(vec![ToolCall::new(
            "create_task",
            json!({"description": "Add parser", "target": "parser.py"}),
        )]))]);
        let coordinator = Coordinator::from_config(&config, model).unwrap();

        let Step::Ran(report) = coordinator.run_iteration().await.unwrap() else {
            panic!("expected an iteration");
        };
        assert_eq!(report.phase, Phase::Planning);
        assert!(report.tasks_changed);

        let state = coordinator.manager().load().unwrap();
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.counters.iteration, 1);
        assert_eq!(state.last_phase, Some(Phase::Planning));
        assert_eq!(state.actions.len(), 1);
    }

    #[tokio::test]
    async fn test_request_carries_tools_and_task() {
        let (_dir, config) = setup();
        let mut state = config.state_manager().load().unwrap();
        let id = state.tasks.create_task("Add parser", "parser.py", 5);
        config.state_manager().save(&state).unwrap();

        let coordinator = Coordinator::from_config(&config, Scripted::new(vec![])).unwrap();
        coordinator.run_iteration().await.unwrap();

        let seen = coordinator.model.seen.lock().unwrap();
        let request = &seen[0];
        assert_eq!(request.phase, Phase::Coding);
        assert_eq!(request.task.as_ref().unwrap().id, id);
        assert_eq!(request.task.as_ref().unwrap().status, TaskStatus::InProgress);
        let names: Vec<&str> = request
            .tools
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert!(names.contains(&"modify_file"));
        assert!(!names.contains(&"approve_code"));
    }

    #[tokio::test]
    async fn test_model_failure_is_recorded_on_task() {
        let (_dir, config) = setup();
        let mut state = config.state_manager().load().unwrap();
        let id = state.tasks.create_task("Add parser", "parser.py", 5);
        config.state_manager().save(&state).unwrap();

        let model = Scripted::new(vec![Err(ModelError::Timeout { secs: 600 })]);
        let coordinator = Coordinator::from_config(&config, model).unwrap();
        let Step::Ran(report) = coordinator.run_iteration().await.unwrap() else {
            panic!("expected an iteration");
        };
        assert!(report.model_error.is_some());
        assert_eq!(report.decision, Some(Decision::Stalled));

        let state = coordinator.manager().load().unwrap();
        let task = state.tasks.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.errors.len(), 1);
        assert_eq!(task.errors[0].kind, Some(crate::errors::ErrorKind::Timeout));
        assert_eq!(state.counters.task_stalls.get(&id), Some(&1));
    }

    #[tokio::test]
    async fn test_empty_planning_stops_run() {
        let (_dir, config) = setup();
        let coordinator = Coordinator::from_config(&config, Scripted::new(vec![])).unwrap();
        let summary = coordinator.run(Some(20)).await.unwrap();
        assert_eq!(summary.stop, StopReason::NothingPlanned);
        assert_eq!(summary.iterations, 3);
        assert!(summary.counts.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (_dir, config) = setup();
        let config = config.with_retry_ceiling(Some(0));
        assert!(Coordinator::from_config(&config, Scripted::new(vec![])).is_err());
    }
}
