//! Phases and the phase selector.
//!
//! The selector applies an explicit, total priority order to the pipeline
//! state and names the phase (and task) for the next iteration:
//!
//! 1. a pending loop intervention for a still-live task
//! 2. planning when no task exists
//! 3. the configured work order, by default development (NEW/IN_PROGRESS)
//!    before review (AWAITING_REVIEW) before fixes (NEEDS_FIXES)
//! 4. maintenance (documentation, then refactoring) once the completion
//!    threshold is reached
//! 5. expansion planning, or completion when planning has nothing to add

use serde::{Deserialize, Serialize};

use crate::state::{PipelineState, TaskFilter, TaskId, TaskKind, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Coding,
    Qa,
    Debugging,
    Refactoring,
    Documentation,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Planning,
        Phase::Coding,
        Phase::Qa,
        Phase::Debugging,
        Phase::Refactoring,
        Phase::Documentation,
    ];

    /// Phases whose iterations are expected to change files.
    pub fn is_productive(self) -> bool {
        matches!(
            self,
            Phase::Coding | Phase::Debugging | Phase::Refactoring | Phase::Documentation
        )
    }

    /// The development phase for tasks of `kind`.
    pub fn for_kind(kind: TaskKind) -> Phase {
        match kind {
            TaskKind::Refactor => Phase::Refactoring,
            TaskKind::Documentation => Phase::Documentation,
            TaskKind::Feature | TaskKind::Fix => Phase::Coding,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Planning => "planning",
            Phase::Coding => "coding",
            Phase::Qa => "qa",
            Phase::Debugging => "debugging",
            Phase::Refactoring => "refactoring",
            Phase::Documentation => "documentation",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "planning" => Ok(Phase::Planning),
            "coding" => Ok(Phase::Coding),
            "qa" | "review" => Ok(Phase::Qa),
            "debugging" => Ok(Phase::Debugging),
            "refactoring" => Ok(Phase::Refactoring),
            "documentation" => Ok(Phase::Documentation),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: planning, coding, qa, debugging, refactoring, documentation",
                s
            ),
        }
    }
}

/// A class of pending work, ordered by the scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkClass {
    /// NEW and IN_PROGRESS tasks.
    Development,
    /// AWAITING_REVIEW tasks.
    Review,
    /// NEEDS_FIXES tasks.
    Fixes,
}

impl WorkClass {
    pub const DEFAULT_ORDER: [WorkClass; 3] =
        [WorkClass::Development, WorkClass::Review, WorkClass::Fixes];

    fn statuses(self) -> &'static [TaskStatus] {
        match self {
            WorkClass::Development => &[TaskStatus::New, TaskStatus::InProgress],
            WorkClass::Review => &[TaskStatus::AwaitingReview],
            WorkClass::Fixes => &[TaskStatus::NeedsFixes],
        }
    }
}

/// What the next iteration should do.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Run {
        phase: Phase,
        task_id: Option<TaskId>,
        reason: String,
    },
    Complete,
}

impl Selection {
    fn run(phase: Phase, task_id: Option<TaskId>, reason: impl Into<String>) -> Self {
        Selection::Run {
            phase,
            task_id,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseSelector {
    order: Vec<WorkClass>,
    completion_threshold: f64,
    refactor_interval: u64,
}

impl Default for PhaseSelector {
    fn default() -> Self {
        Self::new(WorkClass::DEFAULT_ORDER.to_vec(), 0.8, 5)
    }
}

impl PhaseSelector {
    /// `order` must name every work class exactly once; configuration
    /// validation enforces this before a selector is built.
    pub fn new(order: Vec<WorkClass>, completion_threshold: f64, refactor_interval: u64) -> Self {
        Self {
            order,
            completion_threshold,
            refactor_interval,
        }
    }

    pub fn select(&self, state: &PipelineState) -> Selection {
        let store = &state.tasks;

        if let Some(hint) = &state.pending_intervention {
            let live_task = hint
                .task_id
                .as_deref()
                .and_then(|id| store.get(id))
                .filter(|t| !t.status.is_terminal());
            if let Some(task) = live_task {
                let phase = hint.suggested_phase.unwrap_or(hint.phase);
                return Selection::run(
                    phase,
                    Some(task.id.clone()),
                    format!("applying {} intervention", hint.pattern),
                );
            }
        }

        if store.is_empty() {
            return Selection::run(Phase::Planning, None, "no tasks exist");
        }

        for class in &self.order {
            if let Some(task) = store.get_next_task(&TaskFilter::status(class.statuses())) {
                let phase = match class {
                    WorkClass::Development => Phase::for_kind(task.kind),
                    WorkClass::Review => Phase::Qa,
                    WorkClass::Fixes => Phase::Debugging,
                };
                return Selection::run(
                    phase,
                    Some(task.id.clone()),
                    format!("{} task is {}", task.id, task.status),
                );
            }
        }

        let counts = store.count_by_status();
        let completed = counts.get(&TaskStatus::Completed).copied().unwrap_or(0);
        if store.completion_ratio() >= self.completion_threshold {
            if completed > state.counters.documented_at_completed {
                return Selection::run(
                    Phase::Documentation,
                    None,
                    "completion threshold reached; documentation is stale",
                );
            }
            let since_refactor = state
                .counters
                .iteration
                .saturating_sub(state.counters.last_refactor_iteration);
            if completed > state.counters.refactored_at_completed
                && since_refactor >= self.refactor_interval
            {
                return Selection::run(
                    Phase::Refactoring,
                    None,
                    "completion threshold reached; refactoring pass due",
                );
            }
        }

        if state.counters.idle_planning_passes == 0 {
            return Selection::run(Phase::Planning, None, "all tasks finished; planning expansion");
        }

        Selection::Complete
    }
}
