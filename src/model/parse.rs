//! Degraded-mode recovery of tool calls from free text.

use serde_json::Value;

use crate::tools::ToolCall;
use crate::util::json_objects;

fn call_from_value(value: &Value, out: &mut Vec<ToolCall>) {
    if let Some(calls) = value.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            call_from_value(call, out);
        }
        return;
    }

    let Some(name) = value
        .get("name")
        .or_else(|| value.get("tool"))
        .and_then(Value::as_str)
    else {
        return;
    };
    let arguments = match value.get("arguments").or_else(|| value.get("args")) {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        // Some models encode arguments as a JSON string.
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed @ Value::Object(_)) => parsed,
            _ => return,
        },
        _ => return,
    };
    out.push(ToolCall::new(name.trim(), arguments));
}

/// Find `{name|tool, arguments|args}` objects embedded in `text`, fenced or
/// bare, in order of appearance.
pub fn tool_calls_from_text(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    for raw in json_objects(text) {
        if let Ok(value) = serde_json::from_str::<Value>(raw) {
            call_from_value(&value, &mut calls);
        }
    }
    calls
}
