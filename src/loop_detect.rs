//! Loop and pattern detection over the action history.
//!
//! The detector is a pure function of the recent action window and the
//! no-progress counter. It reports at most one [`Intervention`] per call and
//! never touches task state; the retry policy decides what to do with it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::checkpoint::scope_key;
use crate::phase::Phase;
use crate::state::{ActionRecord, PipelineState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPattern {
    /// The same (tool, args) call repeated beyond the threshold.
    ExactRepeat,
    /// Two calls alternating without net progress.
    Oscillation,
    /// Iterations in a row that changed nothing.
    NoProgress,
    /// The same file rewritten over and over with different edits.
    ModificationChurn,
}

impl std::fmt::Display for LoopPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopPattern::ExactRepeat => "exact_repeat",
            LoopPattern::Oscillation => "oscillation",
            LoopPattern::NoProgress => "no_progress",
            LoopPattern::ModificationChurn => "modification_churn",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Corrective payload surfaced to the next model invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub pattern: LoopPattern,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub instruction: String,
    /// Phase in which the pattern was observed.
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub detected_at_seq: u64,
}

#[derive(Debug, Clone)]
pub struct LoopDetector {
    window: usize,
    repeat_threshold: usize,
    oscillation_cycles: usize,
    no_progress_threshold: u32,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(20, 3, 3, 3)
    }
}

impl LoopDetector {
    pub fn new(
        window: usize,
        repeat_threshold: usize,
        oscillation_cycles: usize,
        no_progress_threshold: u32,
    ) -> Self {
        Self {
            window: window.max(2),
            repeat_threshold: repeat_threshold.max(1),
            oscillation_cycles: oscillation_cycles.max(2),
            no_progress_threshold,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window
    }

    /// Inspect the pipeline state's action window for `phase` and `task_id`.
    /// `made_progress` describes the iteration just dispatched; it is folded
    /// into the no-progress streak of the same scope before detection.
    pub fn detect_in(
        &self,
        state: &PipelineState,
        phase: Phase,
        task_id: Option<&str>,
        made_progress: bool,
    ) -> Option<Intervention> {
        let window = state.actions.window(phase, task_id, self.window);
        let streak = state.streak_after(&scope_key(task_id, phase), made_progress);
        self.detect(&window, phase, task_id, streak)
    }

    /// Inspect an explicit window (oldest first).
    pub fn detect(
        &self,
        window: &[&ActionRecord],
        phase: Phase,
        task_id: Option<&str>,
        no_progress_iterations: u32,
    ) -> Option<Intervention> {
        let seq = window.last().map(|r| r.seq).unwrap_or(0);
        let build = |pattern, severity, description: String, lines, instruction: &str, suggested| {
            Intervention {
                pattern,
                severity,
                description,
                evidence: lines,
                instruction: instruction.to_string(),
                phase,
                suggested_phase: suggested,
                task_id: task_id.map(str::to_string),
                detected_at_seq: seq,
            }
        };

        if let Some((latest, count)) = self.exact_repeat(window) {
            let severity = if count >= self.repeat_threshold * 2 {
                Severity::Critical
            } else {
                Severity::High
            };
            let suggested = (!latest.success && phase == Phase::Coding).then_some(Phase::Debugging);
            return Some(build(
                LoopPattern::ExactRepeat,
                severity,
                format!(
                    "{} was called {} times with identical arguments",
                    latest.tool, count
                ),
                evidence(window.iter().filter(|r| r.signature() == latest.signature())),
                "Do not repeat this call. Use the earlier result, try a different approach, or report the blocker with create_issue_report.",
                suggested,
            ));
        }

        if let Some((a, b)) = self.oscillation(window) {
            let span = self.oscillation_cycles * 2;
            return Some(build(
                LoopPattern::Oscillation,
                Severity::High,
                format!(
                    "Alternating between {} and {} for {} cycles",
                    a.tool, b.tool, self.oscillation_cycles
                ),
                evidence(window[window.len() - span..].iter()),
                "You are alternating between two actions without progress. Commit to one concrete change.",
                None,
            ));
        }

        if no_progress_iterations > self.no_progress_threshold {
            let severity = if no_progress_iterations > self.no_progress_threshold * 2 {
                Severity::High
            } else {
                Severity::Medium
            };
            return Some(build(
                LoopPattern::NoProgress,
                severity,
                format!(
                    "{} iterations in a row changed no file and no task",
                    no_progress_iterations
                ),
                evidence(window.iter().rev().take(5).rev()),
                "Make a concrete change to the target file, or escalate with create_issue_report if the task cannot be completed.",
                None,
            ));
        }

        if let Some((file, count)) = self.churn(window) {
            return Some(build(
                LoopPattern::ModificationChurn,
                Severity::Low,
                format!("{} was rewritten {} times", file, count),
                evidence(
                    window
                        .iter()
                        .filter(|r| r.mutated && r.target_file.as_deref() == Some(file.as_str())),
                ),
                "Stop editing piecemeal. Read the whole file once and make a single complete change.",
                None,
            ));
        }

        None
    }

    /// The latest action and its occurrence count, if that count exceeds the
    /// threshold.
    fn exact_repeat<'a>(&self, window: &[&'a ActionRecord]) -> Option<(&'a ActionRecord, usize)> {
        let latest = *window.last()?;
        let sig = latest.signature();
        let count = window.iter().filter(|r| r.signature() == sig).count();
        (count > self.repeat_threshold).then_some((latest, count))
    }

    fn oscillation<'a>(
        &self,
        window: &[&'a ActionRecord],
    ) -> Option<(&'a ActionRecord, &'a ActionRecord)> {
        let span = self.oscillation_cycles * 2;
        if window.len() < span {
            return None;
        }
        let tail = &window[window.len() - span..];
        let (a, b) = (tail[0], tail[1]);
        if a.signature() == b.signature() {
            return None;
        }
        let alternating = tail.iter().enumerate().all(|(i, r)| {
            let expected = if i % 2 == 0 { a } else { b };
            r.signature() == expected.signature()
        });
        alternating.then_some((a, b))
    }

    fn churn(&self, window: &[&ActionRecord]) -> Option<(String, usize)> {
        let mut edits: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for r in window.iter().filter(|r| r.mutated && r.success) {
            if let Some(file) = r.target_file.as_deref() {
                edits.entry(file).or_default().insert(r.signature());
            }
        }
        edits
            .into_iter()
            .map(|(file, sigs)| (file.to_string(), sigs.len()))
            .filter(|(_, n)| *n > self.repeat_threshold)
            .max_by_key(|(_, n)| *n)
    }
}

fn evidence<'a, 'b: 'a>(records: impl Iterator<Item = &'a &'b ActionRecord>) -> Vec<String> {
    records
        .map(|r| {
            format!(
                "#{} {} {} -> {}",
                r.seq,
                r.tool,
                crate::util::truncate(&r.args.to_string(), 120),
                if r.success { "ok" } else { "failed" }
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn action(seq: u64, tool: &str, path: &str) -> ActionRecord {
        ActionRecord {
            seq,
            phase: Phase::Coding,
            task_id: Some("t1".into()),
            tool: tool.into(),
            args: json!({ "path": path }),
            success: true,
            target_file: Some(path.into()),
            mutated: false,
            timestamp: Utc::now(),
        }
    }

    fn run(detector: &LoopDetector, records: &[ActionRecord], no_progress: u32) -> Option<Intervention> {
        let window: Vec<&ActionRecord> = records.iter().collect();
        detector.detect(&window, Phase::Coding, Some("t1"), no_progress)
    }

    #[test]
    fn test_exact_repeat_flags_on_threshold_plus_one() {
        let threshold = 3;
        let detector = LoopDetector::new(20, threshold, 3, 100);
        let mut records = Vec::new();
        for seq in 1..=threshold as u64 {
            records.push(action(seq, "read_file", "a.py"));
            assert!(run(&detector, &records, 0).is_none(), "flagged early at {}", seq);
        }
        records.push(action(threshold as u64 + 1, "read_file", "a.py"));
        let hit = run(&detector, &records, 0).expect("loop flagged");
        assert_eq!(hit.pattern, LoopPattern::ExactRepeat);
        assert_eq!(hit.detected_at_seq, 4);
        assert_eq!(hit.evidence.len(), 4);
        assert_eq!(hit.task_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_distinct_reads_are_not_a_loop() {
        let detector = LoopDetector::default();
        let records: Vec<_> = (1..=10)
            .map(|i| action(i, "read_file", &format!("f{}.py", i)))
            .collect();
        assert!(run(&detector, &records, 0).is_none());
    }

    #[test]
    fn test_failed_repeat_in_coding_suggests_debugging() {
        let detector = LoopDetector::new(20, 2, 3, 100);
        let records: Vec<_> = (1..=3)
            .map(|i| {
                let mut a = action(i, "modify_file", "a.py");
                a.success = false;
                a
            })
            .collect();
        let hit = run(&detector, &records, 0).unwrap();
        assert_eq!(hit.suggested_phase, Some(Phase::Debugging));
    }

    #[test]
    fn test_oscillation_detected() {
        let detector = LoopDetector::new(20, 10, 3, 100);
        let records: Vec<_> = (1..=6)
            .map(|i| {
                if i % 2 == 1 {
                    action(i, "read_file", "a.py")
                } else {
                    action(i, "read_file", "b.py")
                }
            })
            .collect();
        let hit = run(&detector, &records, 0).unwrap();
        assert_eq!(hit.pattern, LoopPattern::Oscillation);
        assert_eq!(hit.evidence.len(), 6);

        assert!(run(&detector, &records[..5], 0).is_none());
    }

    #[test]
    fn test_no_progress_beyond_threshold() {
        let detector = LoopDetector::new(20, 10, 3, 3);
        let records = vec![action(1, "read_file", "a.py")];
        assert!(run(&detector, &records, 3).is_none());
        let hit = run(&detector, &records, 4).unwrap();
        assert_eq!(hit.pattern, LoopPattern::NoProgress);
        assert_eq!(hit.severity, Severity::Medium);
    }

    #[test]
    fn test_modification_churn() {
        let detector = LoopDetector::new(20, 2, 3, 100);
        let records: Vec<_> = (1..=3)
            .map(|i| {
                let mut a = action(i, "modify_file", "a.py");
                a.args = json!({"path": "a.py", "original": format!("v{}", i)});
                a.mutated = true;
                a
            })
            .collect();
        let hit = run(&detector, &records, 0).unwrap();
        assert_eq!(hit.pattern, LoopPattern::ModificationChurn);
        assert!(hit.description.contains("a.py"));
    }

    #[test]
    fn test_detect_in_uses_state_window() {
        let mut state = PipelineState::new();
        for seq in 1..=4 {
            state.actions.append(action(seq, "read_file", "a.py"));
        }
        let detector = LoopDetector::new(20, 3, 3, 100);
        assert!(detector.detect_in(&state, Phase::Coding, Some("t1"), true).is_some());
        assert!(detector.detect_in(&state, Phase::Qa, Some("t1"), true).is_none());
    }

    #[test]
    fn test_no_progress_streak_of_other_task_is_ignored() {
        let mut state = PipelineState::new();
        state.actions.append(action(1, "read_file", "a.py"));
        state.counters.consecutive_no_progress = 9;
        state.counters.streak_scope = Some("t0".into());
        let detector = LoopDetector::new(20, 10, 3, 3);
        assert!(detector.detect_in(&state, Phase::Coding, Some("t1"), false).is_none());

        state.counters.streak_scope = Some("t1".into());
        let hit = detector.detect_in(&state, Phase::Coding, Some("t1"), false).unwrap();
        assert_eq!(hit.pattern, LoopPattern::NoProgress);
        assert!(detector.detect_in(&state, Phase::Coding, Some("t1"), true).is_none());
    }

    #[test]
    fn test_detection_does_not_mutate_state() {
        let mut state = PipelineState::new();
        let id = state.tasks.create_task("x", "a.py", 5);
        for seq in 1..=5 {
            let mut a = action(seq, "read_file", "a.py");
            a.task_id = Some(id.clone());
            state.actions.append(a);
        }
        let before = state.clone();
        let _ = LoopDetector::default().detect_in(&state, Phase::Coding, Some(&id), false);
        assert_eq!(state, before);
    }
}
