//! Tool call dispatcher.
//!
//! Validates each requested call against the phase's tool set and the tool's
//! parameters, runs it in isolation, and records the outcome in the pipeline
//! state: an action record for every call, file records for every write, and
//! a checkpoint for successful checkpointed tools. Tool failures never escape;
//! they become structured [`ToolResult`]s in input order.
//!
//! Sequence numbers are assigned when the batch is prepared, so records keep
//! request order even when independent read-only calls run concurrently.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::builtin::{Workspace, run_fs, run_state};
use super::external::run_external;
use super::{Prerequisite, ToolEffect, ToolOutput, ToolRegistry, ToolSource, ToolSpec, validate_args};
use crate::checkpoint::scope_key;
use crate::errors::{ErrorKind, ToolError};
use crate::phase::Phase;
use crate::state::{ActionRecord, PipelineState};

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(alias = "tool")]
    pub name: String,
    #[serde(default, alias = "args")]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Structured outcome of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub seq: u64,
    pub tool: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Tools offered in the phase, returned with `unknown_tool` errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_tools: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub phase: Phase,
    pub task_id: Option<String>,
}

impl DispatchContext {
    pub fn new(phase: Phase, task_id: Option<&str>) -> Self {
        Self {
            phase,
            task_id: task_id.map(str::to_string),
        }
    }

    fn scope(&self) -> String {
        scope_key(self.task_id.as_deref(), self.phase)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub results: Vec<ToolResult>,
    /// Files whose content changed or that were removed.
    pub files_changed: usize,
    pub tasks_changed: bool,
}

impl BatchReport {
    pub fn failures(&self) -> impl Iterator<Item = &ToolResult> {
        self.results.iter().filter(|r| !r.success)
    }
}

struct Pending<'a> {
    seq: u64,
    name: String,
    args: Value,
    prepared: Result<&'a ToolSpec, ToolError>,
}

pub struct Dispatcher {
    registry: ToolRegistry,
    workspace: Workspace,
    default_timeout: Duration,
    parallel: bool,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry, workspace: Workspace, default_timeout: Duration) -> Self {
        Self {
            registry,
            workspace,
            default_timeout,
            parallel: false,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run `calls` in order and record every outcome in `state`.
    pub async fn dispatch(
        &self,
        state: &mut PipelineState,
        ctx: &DispatchContext,
        calls: &[ToolCall],
    ) -> BatchReport {
        let scope = ctx.scope();
        let pending: Vec<Pending> = calls
            .iter()
            .map(|call| self.prepare(state, ctx.phase, call))
            .collect();

        let mut report = BatchReport::default();
        if self.can_run_parallel(&pending) {
            debug!(calls = pending.len(), "Dispatching read-only batch concurrently");
            let outcomes = join_all(pending.iter().map(|p| async move {
                match &p.prepared {
                    Ok(spec) => Some(self.execute_detached(spec, &p.args, p.seq).await),
                    Err(_) => None,
                }
            }))
            .await;
            for (p, ran) in pending.into_iter().zip(outcomes) {
                let (spec, outcome) = match (p.prepared, ran) {
                    (Ok(spec), Some(outcome)) => (Some(spec), outcome),
                    (Ok(spec), None) => (Some(spec), Err(ToolError::failed(&p.name, "not executed"))),
                    (Err(e), _) => (None, Err(e)),
                };
                self.record(state, ctx, &scope, p.seq, &p.name, &p.args, spec, outcome, &mut report);
            }
        } else {
            for p in pending {
                let (spec, outcome) = match p.prepared {
                    Ok(spec) => {
                        let outcome = self
                            .execute(state, ctx.phase, &scope, spec, &p.args, p.seq)
                            .await;
                        (Some(spec), outcome)
                    }
                    Err(e) => (None, Err(e)),
                };
                self.record(state, ctx, &scope, p.seq, &p.name, &p.args, spec, outcome, &mut report);
            }
        }
        report
    }

    fn prepare(&self, state: &mut PipelineState, phase: Phase, call: &ToolCall) -> Pending<'_> {
        let seq = state.next_seq();
        let (prepared, args) = match self.registry.get(&call.name).filter(|s| s.allowed_in(phase)) {
            None => (
                Err(ToolError::UnknownTool {
                    name: call.name.clone(),
                    phase: phase.to_string(),
                    available: self.registry.names_for_phase(phase),
                }),
                call.arguments.clone(),
            ),
            Some(spec) => match validate_args(spec, &call.arguments) {
                Ok(args) => (Ok(spec), args),
                Err(e) => (Err(e), call.arguments.clone()),
            },
        };
        Pending {
            seq,
            name: call.name.clone(),
            args,
            prepared,
        }
    }

    /// Concurrent execution is allowed only for read-only or analysis calls
    /// without prerequisites that target distinct files.
    fn can_run_parallel(&self, pending: &[Pending]) -> bool {
        if !self.parallel || pending.len() < 2 {
            return false;
        }
        let mut targets = HashSet::new();
        pending.iter().all(|p| match &p.prepared {
            Err(_) => true,
            Ok(spec) => {
                matches!(spec.effect, ToolEffect::ReadOnly | ToolEffect::Analysis)
                    && spec.prerequisite.is_none()
                    && spec.target_file(&p.args).is_none_or(|t| targets.insert(t))
            }
        })
    }

    async fn execute(
        &self,
        state: &mut PipelineState,
        phase: Phase,
        scope: &str,
        spec: &ToolSpec,
        args: &Value,
        seq: u64,
    ) -> Result<ToolOutput, ToolError> {
        check_prerequisite(state, scope, spec, args)?;
        match &spec.source {
            ToolSource::Builtin(tool) if tool.is_stateful() => {
                run_state(*tool, &spec.name, state, phase, args)
            }
            _ => self.execute_detached(spec, args, seq).await,
        }
    }

    /// Run a tool off the coordinator task with a timeout. A panic inside a
    /// built-in tool is reported as an execution failure.
    async fn execute_detached(
        &self,
        spec: &ToolSpec,
        args: &Value,
        seq: u64,
    ) -> Result<ToolOutput, ToolError> {
        let limit = spec.timeout.unwrap_or(self.default_timeout);
        match &spec.source {
            ToolSource::Builtin(tool) => {
                let tool = *tool;
                let name = spec.name.clone();
                let ws = self.workspace.clone();
                let args = args.clone();
                let handle = tokio::task::spawn_blocking(move || run_fs(tool, &name, &ws, seq, &args));
                match timeout(limit, handle).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(join)) => Err(ToolError::failed(
                        &spec.name,
                        format!("tool crashed: {}", join),
                    )),
                    Err(_) => Err(ToolError::Timeout {
                        tool: spec.name.clone(),
                        secs: limit.as_secs(),
                    }),
                }
            }
            ToolSource::External(cfg) => {
                run_external(cfg, &self.workspace.project_dir, args, limit).await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        state: &mut PipelineState,
        ctx: &DispatchContext,
        scope: &str,
        seq: u64,
        name: &str,
        args: &Value,
        spec: Option<&ToolSpec>,
        outcome: Result<ToolOutput, ToolError>,
        report: &mut BatchReport,
    ) {
        let target_file = spec.and_then(|s| s.target_file(args));
        let mut mutated = false;

        let result = match outcome {
            Ok(output) => {
                for write in &output.writes {
                    let changed = match &write.hash {
                        Some(hash) => state.record_file_write(&write.path, hash, ctx.task_id.as_deref()),
                        None => {
                            state.record_file_removed(&write.path);
                            true
                        }
                    };
                    if changed {
                        mutated = true;
                        report.files_changed += 1;
                    }
                }
                report.tasks_changed |= output.tasks_changed;

                if spec.is_some_and(|s| s.checkpoint) {
                    state
                        .checkpoints
                        .record_step(scope, seq, name, args, &output.summary);
                }
                debug!(seq, tool = name, summary = %output.summary, "Tool call succeeded");
                ToolResult {
                    seq,
                    tool: name.to_string(),
                    success: true,
                    result: Some(output.value),
                    error: None,
                    error_kind: None,
                    available_tools: None,
                }
            }
            Err(err) => {
                warn!(seq, tool = name, kind = %err.kind(), error = %err, "Tool call failed");
                let available_tools = match &err {
                    ToolError::UnknownTool { available, .. } => Some(available.clone()),
                    _ => None,
                };
                ToolResult {
                    seq,
                    tool: name.to_string(),
                    success: false,
                    result: None,
                    error: Some(err.to_string()),
                    error_kind: Some(err.kind()),
                    available_tools,
                }
            }
        };

        state.actions.append(ActionRecord {
            seq,
            phase: ctx.phase,
            task_id: ctx.task_id.clone(),
            tool: name.to_string(),
            args: args.clone(),
            success: result.success,
            target_file,
            mutated,
            timestamp: Utc::now(),
        });
        report.results.push(result);
    }
}

fn check_prerequisite(
    state: &PipelineState,
    scope: &str,
    spec: &ToolSpec,
    args: &Value,
) -> Result<(), ToolError> {
    let Some(Prerequisite::ComparedSources { param }) = spec.prerequisite else {
        return Ok(());
    };
    let sources: Vec<&str> = args
        .get(param)
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let missing: Vec<&str> = sources
        .into_iter()
        .filter(|source| {
            !state
                .checkpoints
                .has_completed_where(scope, "compare_files", |a| {
                    a.get("file_a").and_then(Value::as_str) == Some(*source)
                        || a.get("file_b").and_then(Value::as_str) == Some(*source)
                })
        })
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ToolError::MissingPrerequisite {
            tool: spec.name.clone(),
            requires: "compare_files".to_string(),
            detail: format!("no comparison recorded for {}", missing.join(", ")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskStatus;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    fn setup() -> (TempDir, Dispatcher) {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path(), dir.path().join(".crucible/backups"));
        let dispatcher = Dispatcher::new(ToolRegistry::builtin(), ws, Duration::from_secs(10));
        (dir, dispatcher)
    }

    #[tokio::test]
    async fn test_unknown_tool_returns_available_list() {
        let (_dir, dispatcher) = setup();
        let mut state = PipelineState::new();
        let ctx = DispatchContext::new(Phase::Coding, None);

        let report = dispatcher
            .dispatch(&mut state, &ctx, &[ToolCall::new("frobnicate", json!({}))])
            .await;

        let result = &report.results[0];
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::UnknownTool));
        let available = result.available_tools.as_ref().unwrap();
        assert!(available.contains(&"modify_file".to_string()));
        assert_eq!(state.actions.len(), 1);
        assert!(!state.actions.records()[0].success);
    }

    #[tokio::test]
    async fn test_tool_outside_phase_is_unknown() {
        let (_dir, dispatcher) = setup();
        let mut state = PipelineState::new();
        let ctx = DispatchContext::new(Phase::Planning, None);
        let report = dispatcher
            .dispatch(
                &mut state,
                &ctx,
                &[ToolCall::new("create_file", json!({"path": "a.py", "content": ""}))],
            )
            .await;
        assert_eq!(report.results[0].error_kind, Some(ErrorKind::UnknownTool));
    }

    #[tokio::test]
    async fn test_failures_do_not_affect_other_calls() {
        let (dir, dispatcher) = setup();
        let mut state = PipelineState::new();
        let ctx = DispatchContext::new(Phase::Coding, Some("t1"));

        let report = dispatcher
            .dispatch(
                &mut state,
                &ctx,
                &[
                    ToolCall::new("modify_file", json!({"path": "missing.py"})),
                    ToolCall::new("create_file", json!({"path": "ok.py", "content": "X = 1\n"})),
                    ToolCall::new("read_file", json!({"path": "nope.py"})),
                ],
            )
            .await;

        let kinds: Vec<Option<ErrorKind>> = report.results.iter().map(|r| r.error_kind).collect();
        assert_eq!(
            kinds,
            vec![
                Some(ErrorKind::InvalidArguments),
                None,
                Some(ErrorKind::ToolExecutionFailure)
            ]
        );
        assert_eq!(report.files_changed, 1);
        assert!(dir.path().join("ok.py").is_file());
        assert_eq!(state.files["ok.py"].task_id.as_deref(), Some("t1"));

        let seqs: Vec<u64> = state.actions.records().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(state.actions.records()[1].mutated);

        let encoded = serde_json::to_string(&report.results).unwrap();
        assert!(encoded.contains("\"error_kind\":\"invalid_arguments\""));
    }

    #[tokio::test]
    async fn test_merge_requires_compare_checkpoints() {
        let (dir, dispatcher) = setup();
        std::fs::write(dir.path().join("a.py"), "import os\n\ndef a():\n    pass\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "import os\n\ndef b():\n    pass\n").unwrap();
        let mut state = PipelineState::new();
        let ctx = DispatchContext::new(Phase::Refactoring, Some("t1"));
        let merge = ToolCall::new(
            "merge_files",
            json!({"sources": ["a.py", "b.py"], "target": "merged.py"}),
        );

        let report = dispatcher.dispatch(&mut state, &ctx, &[merge.clone()]).await;
        assert_eq!(report.results[0].error_kind, Some(ErrorKind::InvalidArguments));
        assert!(report.results[0].error.as_ref().unwrap().contains("a.py, b.py"));
        assert!(!dir.path().join("merged.py").exists());

        let report = dispatcher
            .dispatch(
                &mut state,
                &ctx,
                &[
                    ToolCall::new("compare_files", json!({"file_a": "a.py", "file_b": "b.py"})),
                    merge,
                ],
            )
            .await;
        assert!(report.results.iter().all(|r| r.success), "{:?}", report.results);
        assert!(state.checkpoints.has_completed("t1", "compare_files", None));
        let merged = std::fs::read_to_string(dir.path().join("merged.py")).unwrap();
        assert!(merged.contains("def a():") && merged.contains("def b():"));
    }

    #[tokio::test]
    async fn test_state_tools_report_task_changes() {
        let (_dir, dispatcher) = setup();
        let mut state = PipelineState::new();
        let ctx = DispatchContext::new(Phase::Planning, None);
        let report = dispatcher
            .dispatch(
                &mut state,
                &ctx,
                &[ToolCall::new(
                    "create_task",
                    json!({"description": "Add cli", "target": "cli.py", "priority": 2}),
                )],
            )
            .await;
        assert!(report.tasks_changed);
        let task = state.tasks.tasks().next().unwrap();
        assert_eq!(task.status, TaskStatus::New);
        assert_eq!(task.priority, 2);
    }

    #[tokio::test]
    async fn test_parallel_batch_keeps_order() {
        let (dir, dispatcher) = setup();
        let dispatcher = dispatcher.with_parallel(true);
        for name in ["a.py", "b.py", "c.py"] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }
        let mut state = PipelineState::new();
        let ctx = DispatchContext::new(Phase::Qa, None);
        let calls: Vec<ToolCall> = ["a.py", "b.py", "c.py"]
            .iter()
            .map(|p| ToolCall::new("read_file", json!({"path": p})))
            .collect();

        let report = dispatcher.dispatch(&mut state, &ctx, &calls).await;
        let contents: Vec<&str> = report
            .results
            .iter()
            .map(|r| r.result.as_ref().unwrap()["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["a.py", "b.py", "c.py"]);
        let seqs: Vec<u64> = state.actions.records().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_parallel_requires_distinct_targets() {
        let (_dir, dispatcher) = setup();
        let dispatcher = dispatcher.with_parallel(true);
        let mut state = PipelineState::new();
        let same = [
            ToolCall::new("read_file", json!({"path": "a.py"})),
            ToolCall::new("read_file", json!({"path": "a.py"})),
        ];
        let pending: Vec<Pending> = same
            .iter()
            .map(|c| dispatcher.prepare(&mut state, Phase::Qa, c))
            .collect();
        assert!(!dispatcher.can_run_parallel(&pending));

        let mixed = [
            ToolCall::new("read_file", json!({"path": "a.py"})),
            ToolCall::new("create_file", json!({"path": "b.py", "content": ""})),
        ];
        let pending: Vec<Pending> = mixed
            .iter()
            .map(|c| dispatcher.prepare(&mut state, Phase::Coding, c))
            .collect();
        assert!(!dispatcher.can_run_parallel(&pending));
    }
}
