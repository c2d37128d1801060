//! Boundary to the external model service.
//!
//! Each iteration sends one [`ModelRequest`] and receives one
//! [`ModelResponse`]. The request carries everything the model needs from
//! the durable state; the model keeps no memory between iterations.

mod command;
mod parse;

pub use command::CommandModel;
pub use parse::tool_calls_from_text;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::checkpoint::CheckpointEntry;
use crate::errors::ModelError;
use crate::loop_detect::Intervention;
use crate::phase::Phase;
use crate::state::{ActionRecord, Task};
use crate::tools::ToolCall;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub phase: Phase,
    pub iteration: u64,
    pub instructions: String,
    pub state_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    /// Steps already performed for this task in earlier iterations.
    #[serde(default)]
    pub checkpoints: Vec<CheckpointEntry>,
    /// Most recent actions for this task and phase, oldest first.
    #[serde(default)]
    pub recent_actions: Vec<ActionRecord>,
    /// Tool schemas offered in this phase.
    pub tools: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intervention: Option<Intervention>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            text: String::new(),
            tool_calls: calls,
        }
    }

    /// Structured tool calls, or calls recovered from the free text when the
    /// response has none.
    pub fn into_calls(self) -> Vec<ToolCall> {
        if !self.tool_calls.is_empty() {
            return self.tool_calls;
        }
        let recovered = tool_calls_from_text(&self.text);
        if !recovered.is_empty() {
            warn!(
                calls = recovered.len(),
                "Model response had no structured tool calls; parsed calls from text"
            );
        }
        recovered
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_calls_win_over_text() {
        let response = ModelResponse {
            text: r#"{"name": "read_file", "arguments": {"path": "b.py"}}"#.to_string(),
            tool_calls: vec![ToolCall::new("read_file", json!({"path": "a.py"}))],
        };
        let calls = response.into_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["path"], "a.py");
    }

    #[test]
    fn test_response_parses_with_missing_fields() {
        let response: ModelResponse = serde_json::from_str(r#"{"text": "done"}"#).unwrap();
        assert!(response.tool_calls.is_empty());

        let response: ModelResponse = serde_json::from_str(
            r#"{"tool_calls": [{"tool": "read_file", "args": {"path": "a.py"}}]}"#,
        )
        .unwrap();
        assert_eq!(response.tool_calls[0].name, "read_file");
        assert_eq!(response.tool_calls[0].arguments["path"], "a.py");
    }
}
