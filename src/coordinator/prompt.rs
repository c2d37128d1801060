//! Phase instructions and the state summary sent with every model request.

use crate::loop_detect::Intervention;
use crate::phase::Phase;
use crate::state::{PipelineState, ReviewStatus, Task, TaskFilter, TaskStatus};

/// Tasks listed in the state summary.
const SUMMARY_TASKS: usize = 8;

fn phase_goal(phase: Phase, task: Option<&Task>) -> String {
    match (phase, task) {
        (Phase::Planning, _) => "Break the project goal into concrete tasks. Call create_task once per task \
             with a one-line description and the file it targets. Link related tasks with an objective. \
             Do not create tasks that already exist. If nothing is left to plan, call no tools."
            .to_string(),
        (Phase::Coding, Some(t)) => format!(
            "Implement the task below in {}. Read the file first if it exists, then use create_file or \
             modify_file. Keep the change focused on this task.",
            t.target
        ),
        (Phase::Qa, Some(t)) => format!(
            "Review {} for the task below. Call approve_code if the work is correct and complete, or \
             report_issue with a precise description of each defect.",
            t.target
        ),
        (Phase::Debugging, Some(t)) => format!(
            "The task below was sent back with issues. Fix {} so every recorded error is resolved. If the \
             task cannot be completed, call create_issue_report with a summary of the blocker.",
            t.target
        ),
        (Phase::Refactoring, Some(t)) => format!(
            "Restructure {} as the task below describes without changing behavior. Before merging files, \
             compare each source with compare_files.",
            t.target
        ),
        (Phase::Documentation, Some(t)) => format!(
            "Write or update {} as the task below describes.",
            t.target
        ),
        (Phase::Refactoring, None) => "Look for duplicated or misplaced code across the project. Compare \
             candidate files with compare_files, merge them with merge_files when it simplifies the code, \
             or create refactor tasks for larger changes."
            .to_string(),
        (Phase::Documentation, None) => "Bring the project documentation up to date with the completed \
             work. Update existing documents with modify_file or create new ones with create_file."
            .to_string(),
        (phase, None) => format!("Continue the {} phase.", phase),
    }
}

fn describe_task(task: &Task) -> String {
    let mut out = format!(
        "## Task {}\n\n{}\n\n- Target: {}\n- Kind: {}\n- Status: {}\n- Retries used: {}\n",
        task.id, task.description, task.target, task.kind, task.status, task.attempt_count
    );
    if !task.errors.is_empty() {
        out.push_str("\n### Recorded errors\n\n");
        for err in &task.errors {
            out.push_str(&format!("- Attempt {}: {}\n", err.attempt_number, err.message));
        }
    }
    out
}

fn describe_intervention(hint: &Intervention) -> String {
    let mut out = format!(
        "## Loop detected ({}, {:?})\n\n{}\n\n{}\n",
        hint.pattern, hint.severity, hint.description, hint.instruction
    );
    for line in &hint.evidence {
        out.push_str(&format!("- {}\n", line));
    }
    out
}

/// Instructions for one iteration: the phase goal, the task, and any
/// intervention raised against the previous iteration.
pub fn instructions(phase: Phase, task: Option<&Task>, intervention: Option<&Intervention>) -> String {
    let mut out = format!("# Phase: {}\n\n{}\n", phase, phase_goal(phase, task));
    if let Some(hint) = intervention {
        out.push('\n');
        out.push_str(&describe_intervention(hint));
    }
    if let Some(task) = task {
        out.push('\n');
        out.push_str(&describe_task(task));
    }
    out.push_str(
        "\nRespond with tool calls. Steps listed under checkpoints were already performed; \
         do not repeat them.\n",
    );
    out
}

/// Compact description of the pipeline state for the model.
pub fn state_summary(state: &PipelineState) -> String {
    let store = &state.tasks;
    if store.is_empty() {
        return "No tasks exist yet.".to_string();
    }

    let counts = store.count_by_status();
    let mut out = format!(
        "{} tasks ({:.0}% completed):",
        store.len(),
        store.completion_ratio() * 100.0
    );
    for status in TaskStatus::ALL {
        if let Some(n) = counts.get(&status) {
            out.push_str(&format!(" {} {},", n, status));
        }
    }
    out.pop();
    out.push('\n');

    let open = store.ordered(&TaskFilter::status(&[
        TaskStatus::New,
        TaskStatus::InProgress,
        TaskStatus::AwaitingReview,
        TaskStatus::NeedsFixes,
    ]));
    if !open.is_empty() {
        out.push_str("\nOpen tasks:\n");
        for task in open.iter().take(SUMMARY_TASKS) {
            out.push_str(&format!(
                "- [{}] p{} {} ({})\n",
                task.status, task.priority, task.description, task.target
            ));
        }
        if open.len() > SUMMARY_TASKS {
            out.push_str(&format!("- ... and {} more\n", open.len() - SUMMARY_TASKS));
        }
    }

    let pending = state.files_with_review(ReviewStatus::Pending);
    if !pending.is_empty() {
        out.push_str(&format!("\nFiles pending review: {}\n", pending.join(", ")));
    }

    let objectives: Vec<String> = store
        .objectives()
        .map(|o| {
            let progress = store.objective_progress(&o.id).unwrap_or(0.0);
            format!("- {} ({:.0}% done)", o.title, progress * 100.0)
        })
        .collect();
    if !objectives.is_empty() {
        out.push_str("\nObjectives:\n");
        out.push_str(&objectives.join("\n"));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_detect::{LoopPattern, Severity};

    #[test]
    fn test_instructions_include_task_and_hint() {
        let mut state = PipelineState::new();
        let id = state.tasks.create_task("Add parser", "parser.py", 3);
        state.tasks.update_task(&id, TaskStatus::InProgress, None).unwrap();
        let task = state.tasks.get(&id).unwrap();
        let hint = Intervention {
            pattern: LoopPattern::ExactRepeat,
            severity: Severity::High,
            description: "read_file was called 4 times with identical arguments".into(),
            evidence: vec!["#3 read_file parser.py".into()],
            instruction: "Do not repeat this call.".into(),
            phase: Phase::Coding,
            suggested_phase: None,
            task_id: Some(id.clone()),
            detected_at_seq: 3,
        };

        let text = instructions(Phase::Coding, Some(task), Some(&hint));
        assert!(text.starts_with("# Phase: coding"));
        assert!(text.contains("Implement the task below in parser.py"));
        assert!(text.contains("## Loop detected (exact_repeat, High)"));
        assert!(text.contains("#3 read_file parser.py"));
        assert!(text.contains(&format!("## Task {}", id)));
    }

    #[test]
    fn test_state_summary() {
        let mut state = PipelineState::new();
        assert_eq!(state_summary(&state), "No tasks exist yet.");

        state.tasks.create_task("Add parser", "parser.py", 3);
        state.tasks.create_task("Add lexer", "lexer.py", 1);
        state.record_file_write("lexer.py", "h", None);
        let summary = state_summary(&state);
        assert!(summary.starts_with("2 tasks (0% completed): 2 NEW\n"));
        let lexer = summary.find("Add lexer").unwrap();
        let parser = summary.find("Add parser").unwrap();
        assert!(lexer < parser);
        assert!(summary.contains("Files pending review: lexer.py"));
    }
}
