//! Checkpoint tracking for multi-step tasks.
//!
//! Each model invocation starts with no memory of earlier iterations, so the
//! sub-steps already performed for a task (comparisons, analyses) are recorded
//! here and persisted with the rest of the pipeline state. Validation logic
//! asks this log whether a prerequisite step happened; it never consults
//! transcripts or per-iteration objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A single recorded sub-step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Dispatch sequence number of the first execution.
    pub seq: u64,
    pub tool: String,
    /// Arguments after normalization; comparisons use this form.
    pub args: Value,
    pub result_summary: String,
    pub first_recorded_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub repeats: u32,
}

/// Per-scope append-only checkpoint logs.
///
/// The scope is a task id, or `phase:<name>` for iterations that run
/// without a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointLog {
    #[serde(default)]
    entries: BTreeMap<String, Vec<CheckpointEntry>>,
}

impl CheckpointLog {
    /// Record that `tool` ran with `args` for `scope`.
    ///
    /// An identical (tool, args) pair refreshes the existing entry's timestamp
    /// and summary instead of appending; returns `true` only when a new entry
    /// was appended.
    pub fn record_step(
        &mut self,
        scope: &str,
        seq: u64,
        tool: &str,
        args: &Value,
        result_summary: &str,
    ) -> bool {
        let now = Utc::now();
        let log = self.entries.entry(scope.to_string()).or_default();

        if let Some(existing) = log.iter_mut().find(|e| e.tool == tool && &e.args == args) {
            existing.recorded_at = now;
            existing.result_summary = result_summary.to_string();
            existing.repeats += 1;
            return false;
        }

        log.push(CheckpointEntry {
            seq,
            tool: tool.to_string(),
            args: args.clone(),
            result_summary: result_summary.to_string(),
            first_recorded_at: now,
            recorded_at: now,
            repeats: 0,
        });
        true
    }

    /// Whether `tool` has run for `scope`, optionally with exactly `args`.
    pub fn has_completed(&self, scope: &str, tool: &str, args: Option<&Value>) -> bool {
        self.steps(scope)
            .iter()
            .any(|e| e.tool == tool && args.is_none_or(|a| &e.args == a))
    }

    /// Whether some `tool` step for `scope` satisfies `predicate`.
    pub fn has_completed_where<F>(&self, scope: &str, tool: &str, predicate: F) -> bool
    where
        F: Fn(&Value) -> bool,
    {
        self.steps(scope)
            .iter()
            .any(|e| e.tool == tool && predicate(&e.args))
    }

    pub fn steps(&self, scope: &str) -> &[CheckpointEntry] {
        self.entries.get(scope).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn scopes(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn total(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// Scope key for a checkpoint: the task id, or a phase-level key.
pub fn scope_key(task_id: Option<&str>, phase: crate::phase::Phase) -> String {
    match task_id {
        Some(id) => id.to_string(),
        None => format!("phase:{}", phase),
    }
}
