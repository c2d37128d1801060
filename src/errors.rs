//! Typed error hierarchy for the Crucible coordinator.
//!
//! Four enums cover the four subsystems that can fail:
//! - `StoreError`: task store and task state machine
//! - `ToolError`: tool validation and execution inside the dispatcher
//! - `PersistError`: the durable pipeline state file
//! - `ModelError`: the external model service
//!
//! Every store and tool error maps onto an [`ErrorKind`], the serializable
//! taxonomy that travels inside tool results and error histories.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::state::TaskStatus;

/// Serializable error taxonomy shared by tool results and task error records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidTransition,
    UnknownTool,
    InvalidArguments,
    ToolExecutionFailure,
    Timeout,
    SerializationFailure,
    /// Not a failure: a control signal consumed by the retry policy.
    LoopDetected,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::InvalidArguments => "invalid_arguments",
            ErrorKind::ToolExecutionFailure => "tool_execution_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SerializationFailure => "serialization_failure",
            ErrorKind::LoopDetected => "loop_detected",
        };
        write!(f, "{}", s)
    }
}

/// Errors from the task store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error(
        "Task {task_id} reached its retry ceiling ({attempts}/{ceiling} attempts) and must be escalated"
    )]
    RetryCeilingReached {
        task_id: String,
        attempts: u32,
        ceiling: u32,
    },

    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: String },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidTransition { .. } | StoreError::RetryCeilingReached { .. } => {
                ErrorKind::InvalidTransition
            }
            StoreError::TaskNotFound { .. } => ErrorKind::InvalidArguments,
        }
    }
}

/// Errors from a single tool dispatch. These never escape the dispatcher;
/// they are converted into structured results.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool '{name}' in phase {phase}. Available tools: {}", available.join(", "))]
    UnknownTool {
        name: String,
        phase: String,
        available: Vec<String>,
    },

    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("{tool} requires {requires} first: {detail}")]
    MissingPrerequisite {
        tool: String,
        requires: String,
        detail: String,
    },

    #[error("{tool} failed: {message}")]
    ExecutionFailure { tool: String, message: String },

    #[error("{tool} timed out after {secs} seconds")]
    Timeout { tool: String, secs: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::UnknownTool { .. } => ErrorKind::UnknownTool,
            ToolError::InvalidArguments { .. } | ToolError::MissingPrerequisite { .. } => {
                ErrorKind::InvalidArguments
            }
            ToolError::ExecutionFailure { .. } => ErrorKind::ToolExecutionFailure,
            ToolError::Timeout { .. } => ErrorKind::Timeout,
            ToolError::Store(e) => e.kind(),
        }
    }

    pub fn invalid(tool: &str, message: impl Into<String>) -> Self {
        ToolError::InvalidArguments {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    pub fn failed(tool: &str, message: impl Into<String>) -> Self {
        ToolError::ExecutionFailure {
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}

/// Errors reading or writing the durable pipeline state.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Failed to serialize pipeline state: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Pipeline state at {path} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Another coordinator holds the lock at {path}")]
    Locked { path: PathBuf },
}

impl PersistError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SerializationFailure
    }
}

/// Errors from the external model service.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to spawn model command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Model command timed out after {secs} seconds")]
    Timeout { secs: u64 },

    #[error("Model command exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Model I/O failed: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to encode model request: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelError::Timeout { .. } => ErrorKind::Timeout,
            ModelError::Encode(_) => ErrorKind::SerializationFailure,
            _ => ErrorKind::ToolExecutionFailure,
        }
    }
}
