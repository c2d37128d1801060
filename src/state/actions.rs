//! Global action history used for repetition detection.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::phase::Phase;

/// One dispatched tool call, as seen by the loop detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Monotonic sequence number assigned at dispatch time.
    pub seq: u64,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub tool: String,
    pub args: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_file: Option<String>,
    /// Whether the action changed a file on disk.
    #[serde(default)]
    pub mutated: bool,
    pub timestamp: DateTime<Utc>,
}

impl ActionRecord {
    /// Identity used for repetition: tool plus canonical arguments.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.tool, self.args)
    }
}

/// Append-only action history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    #[serde(default)]
    records: Vec<ActionRecord>,
}

impl ActionLog {
    pub fn append(&mut self, record: ActionRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[ActionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The most recent `size` records for `phase` and `task_id`, oldest first.
    pub fn window(&self, phase: Phase, task_id: Option<&str>, size: usize) -> Vec<&ActionRecord> {
        let mut window: Vec<&ActionRecord> = self
            .records
            .iter()
            .rev()
            .filter(|r| r.phase == phase && r.task_id.as_deref() == task_id)
            .take(size)
            .collect();
        window.reverse();
        window
    }

    /// Drop records older than `max_age`, always keeping the newest
    /// `keep_last` of every (phase, task) window so live loop detection is
    /// unaffected. Returns the number of records removed.
    pub fn prune_older_than(&mut self, max_age: Duration, keep_last: usize) -> usize {
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };

        let mut seen: HashMap<(Phase, Option<&str>), usize> = HashMap::new();
        let mut protected = vec![false; self.records.len()];
        for (i, r) in self.records.iter().enumerate().rev() {
            let count = seen.entry((r.phase, r.task_id.as_deref())).or_insert(0);
            if *count < keep_last {
                protected[i] = true;
                *count += 1;
            }
        }

        let before = self.records.len();
        let mut index = 0;
        self.records.retain(|r| {
            let keep = protected[index] || r.timestamp >= cutoff;
            index += 1;
            keep
        });
        before - self.records.len()
    }
}
