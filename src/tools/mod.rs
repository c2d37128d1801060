//! Typed tool-registration manifest and argument validation.
//!
//! Every tool the model may call is declared here as a [`ToolSpec`]: its
//! parameters, the phases it is offered in, what it touches, whether a
//! successful call is checkpointed, and which earlier steps it depends on.
//! External tools from `crucible.toml` are added to the same registry.

pub mod builtin;
pub mod dispatcher;
pub mod external;
pub mod merge;
pub mod outline;

pub use builtin::{FileWrite, ToolOutput};
pub use dispatcher::{BatchReport, DispatchContext, Dispatcher, ToolCall, ToolResult};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::time::Duration;

use crate::crucible_config::ExternalToolConfig;
use crate::errors::ToolError;
use crate::phase::Phase;
use crate::util::{escapes_root, normalize_path};

/// Shape of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Short single-line string.
    #[default]
    String,
    /// Free text, may be empty or multi-line.
    Text,
    /// Project-relative path.
    Path,
    PathList,
    Integer,
    Boolean,
}

impl ParamKind {
    fn json_schema(self) -> Value {
        match self {
            ParamKind::String | ParamKind::Text | ParamKind::Path => json!({"type": "string"}),
            ParamKind::PathList => json!({"type": "array", "items": {"type": "string"}}),
            ParamKind::Integer => json!({"type": "integer"}),
            ParamKind::Boolean => json!({"type": "boolean"}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl ParamSpec {
    fn new(name: &str, kind: ParamKind, required: bool, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required,
            description: description.to_string(),
        }
    }
}

/// What a tool touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEffect {
    ReadOnly,
    /// Reads files and produces a result worth checkpointing.
    Analysis,
    /// Writes project files.
    Mutating,
    /// Changes the task store.
    State,
}

/// A step that must already be in the checkpoint log before a tool may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prerequisite {
    /// Every path in `param` must appear in a successful `compare_files`
    /// checkpoint for the current scope.
    ComparedSources { param: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinTool {
    ReadFile,
    ListDirectory,
    SearchCode,
    CreateFile,
    ModifyFile,
    CompareFiles,
    MergeFiles,
    CreateTask,
    ApproveCode,
    ReportIssue,
    CreateIssueReport,
}

impl BuiltinTool {
    /// Tools that mutate the pipeline state and run on the coordinator thread.
    pub fn is_stateful(self) -> bool {
        matches!(
            self,
            BuiltinTool::CreateTask
                | BuiltinTool::ApproveCode
                | BuiltinTool::ReportIssue
                | BuiltinTool::CreateIssueReport
        )
    }
}

#[derive(Debug, Clone)]
pub enum ToolSource {
    Builtin(BuiltinTool),
    External(ExternalToolConfig),
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    /// Phases the tool is offered in; empty means every phase.
    pub phases: Vec<Phase>,
    pub effect: ToolEffect,
    /// Record a checkpoint after each successful call.
    pub checkpoint: bool,
    pub prerequisite: Option<Prerequisite>,
    /// Overrides the dispatcher's default timeout.
    pub timeout: Option<Duration>,
    pub source: ToolSource,
}

impl ToolSpec {
    pub fn allowed_in(&self, phase: Phase) -> bool {
        self.phases.is_empty() || self.phases.contains(&phase)
    }

    /// JSON schema handed to the model.
    pub fn schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.params {
            let mut schema = p.kind.json_schema();
            if !p.description.is_empty()
                && let Some(obj) = schema.as_object_mut()
            {
                obj.insert("description".into(), Value::String(p.description.clone()));
            }
            properties.insert(p.name.clone(), schema);
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }

    /// The file a call targets: the value of the first path parameter.
    pub fn target_file(&self, args: &Value) -> Option<String> {
        self.params
            .iter()
            .find(|p| p.kind == ParamKind::Path)
            .and_then(|p| args.get(&p.name))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

const EDIT_PHASES: [Phase; 4] = [
    Phase::Coding,
    Phase::Debugging,
    Phase::Refactoring,
    Phase::Documentation,
];

fn builtin(
    tool: BuiltinTool,
    name: &str,
    description: &str,
    params: Vec<ParamSpec>,
    phases: &[Phase],
    effect: ToolEffect,
) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        params,
        phases: phases.to_vec(),
        effect,
        checkpoint: false,
        prerequisite: None,
        timeout: None,
        source: ToolSource::Builtin(tool),
    }
}

/// The set of tools the dispatcher knows about, in declaration order.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
}

impl ToolRegistry {
    pub fn builtin() -> Self {
        use BuiltinTool as B;
        use ParamKind as K;
        let p = ParamSpec::new;

        let mut compare = builtin(
            B::CompareFiles,
            "compare_files",
            "Compare two files: similarity and shared or unique declarations",
            vec![
                p("file_a", K::Path, true, ""),
                p("file_b", K::Path, true, ""),
            ],
            &[Phase::Qa, Phase::Debugging, Phase::Refactoring],
            ToolEffect::Analysis,
        );
        compare.checkpoint = true;

        let mut merge = builtin(
            B::MergeFiles,
            "merge_files",
            "Merge source files into target, deduplicating imports and keeping every distinct declaration",
            vec![
                p("sources", K::PathList, true, "Files to merge, in order"),
                p("target", K::Path, true, "File receiving the merged content"),
                p("remove_sources", K::Boolean, false, "Delete sources other than target afterwards"),
            ],
            &[Phase::Refactoring],
            ToolEffect::Mutating,
        );
        merge.prerequisite = Some(Prerequisite::ComparedSources { param: "sources" });

        let tools = vec![
            builtin(
                B::ReadFile,
                "read_file",
                "Read a project file",
                vec![p("path", K::Path, true, "")],
                &[],
                ToolEffect::ReadOnly,
            ),
            builtin(
                B::ListDirectory,
                "list_directory",
                "List a project directory",
                vec![p("path", K::Path, false, "Defaults to the project root")],
                &[],
                ToolEffect::ReadOnly,
            ),
            builtin(
                B::SearchCode,
                "search_code",
                "Search project files with a regular expression",
                vec![
                    p("pattern", K::String, true, "Regular expression"),
                    p("glob", K::String, false, "Only search paths matching this glob"),
                ],
                &[],
                ToolEffect::ReadOnly,
            ),
            builtin(
                B::CreateFile,
                "create_file",
                "Create or overwrite a file",
                vec![
                    p("path", K::Path, true, ""),
                    p("content", K::Text, true, ""),
                ],
                &EDIT_PHASES,
                ToolEffect::Mutating,
            ),
            builtin(
                B::ModifyFile,
                "modify_file",
                "Replace the first occurrence of an exact snippet in a file",
                vec![
                    p("path", K::Path, true, ""),
                    p("original", K::Text, true, "Exact text to replace"),
                    p("replacement", K::Text, true, ""),
                ],
                &EDIT_PHASES,
                ToolEffect::Mutating,
            ),
            compare,
            merge,
            builtin(
                B::CreateTask,
                "create_task",
                "Create a task; identical description and target return the existing task",
                vec![
                    p("description", K::String, true, ""),
                    p("target", K::Path, true, "File the task produces or changes"),
                    p("priority", K::Integer, false, "1 (urgent) to 10"),
                    p("kind", K::String, false, "feature, fix, refactor or documentation"),
                    p("objective", K::String, false, "Objective title to group the task under"),
                ],
                &[
                    Phase::Planning,
                    Phase::Qa,
                    Phase::Refactoring,
                    Phase::Documentation,
                ],
                ToolEffect::State,
            ),
            builtin(
                B::ApproveCode,
                "approve_code",
                "Approve a reviewed file",
                vec![p("path", K::Path, true, "")],
                &[Phase::Qa],
                ToolEffect::State,
            ),
            builtin(
                B::ReportIssue,
                "report_issue",
                "Report a problem found in a reviewed file",
                vec![
                    p("path", K::Path, true, ""),
                    p("description", K::Text, true, ""),
                    p("severity", K::String, false, "low, medium, high or critical"),
                ],
                &[Phase::Qa],
                ToolEffect::State,
            ),
            builtin(
                B::CreateIssueReport,
                "create_issue_report",
                "Give up on a task: mark it failed and write an issue report for a human",
                vec![
                    p("task_id", K::String, true, ""),
                    p("summary", K::Text, true, ""),
                ],
                &[Phase::Qa, Phase::Debugging, Phase::Refactoring],
                ToolEffect::State,
            ),
        ];
        Self { tools }
    }

    /// Register external tools. Names must not shadow existing tools.
    pub fn with_external(mut self, external: &[ExternalToolConfig]) -> Result<Self> {
        for ext in external {
            if self.get(&ext.name).is_some() {
                bail!("External tool '{}' shadows an existing tool", ext.name);
            }
            self.tools.push(ToolSpec {
                name: ext.name.clone(),
                description: ext.description.clone(),
                params: ext.parameters.clone(),
                phases: ext.phases.clone(),
                effect: ToolEffect::Analysis,
                checkpoint: true,
                prerequisite: None,
                timeout: ext.timeout_secs.map(Duration::from_secs),
                source: ToolSource::External(ext.clone()),
            });
        }
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn for_phase(&self, phase: Phase) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter().filter(move |t| t.allowed_in(phase))
    }

    pub fn names_for_phase(&self, phase: Phase) -> Vec<String> {
        self.for_phase(phase).map(|t| t.name.clone()).collect()
    }

    pub fn schemas_for_phase(&self, phase: Phase) -> Vec<Value> {
        self.for_phase(phase).map(ToolSpec::schema).collect()
    }
}

fn validate_path(tool: &str, param: &str, raw: &str) -> Result<String, ToolError> {
    let path = normalize_path(raw);
    if escapes_root(&path) {
        return Err(ToolError::invalid(
            tool,
            format!("'{}' escapes the project root: {}", param, raw),
        ));
    }
    Ok(path)
}

fn validate_value(tool: &str, param: &ParamSpec, value: &Value) -> Result<Value, ToolError> {
    let name = param.name.as_str();
    let wrong = |expected: &str| {
        ToolError::invalid(tool, format!("'{}' must be {}, got {}", name, expected, value))
    };
    match param.kind {
        ParamKind::String => {
            let s = value.as_str().ok_or_else(|| wrong("a string"))?.trim();
            if s.is_empty() && param.required {
                return Err(ToolError::invalid(tool, format!("'{}' must not be empty", name)));
            }
            Ok(Value::String(s.to_string()))
        }
        ParamKind::Text => value
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| wrong("a string")),
        ParamKind::Path => {
            let raw = value.as_str().ok_or_else(|| wrong("a path string"))?;
            let path = validate_path(tool, name, raw)?;
            if path.is_empty() && param.required {
                return Err(ToolError::invalid(tool, format!("'{}' must not be empty", name)));
            }
            Ok(Value::String(path))
        }
        ParamKind::PathList => {
            let items = value.as_array().ok_or_else(|| wrong("a list of paths"))?;
            if items.is_empty() && param.required {
                return Err(ToolError::invalid(tool, format!("'{}' must not be empty", name)));
            }
            let mut paths = Vec::with_capacity(items.len());
            for item in items {
                let raw = item.as_str().ok_or_else(|| wrong("a list of paths"))?;
                let path = validate_path(tool, name, raw)?;
                if path.is_empty() {
                    return Err(ToolError::invalid(
                        tool,
                        format!("'{}' contains an empty path", name),
                    ));
                }
                paths.push(Value::String(path));
            }
            Ok(Value::Array(paths))
        }
        ParamKind::Integer => match value {
            Value::Number(n) if n.is_i64() => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| wrong("an integer")),
            _ => Err(wrong("an integer")),
        },
        ParamKind::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            _ => Err(wrong("a boolean")),
        },
    }
}

/// Check `raw` against the tool's parameters and return the canonical
/// argument object: declared parameters only, paths normalized.
pub fn validate_args(spec: &ToolSpec, raw: &Value) -> Result<Value, ToolError> {
    let empty = Map::new();
    let given = match raw {
        Value::Null => &empty,
        Value::Object(map) => map,
        other => {
            return Err(ToolError::invalid(
                &spec.name,
                format!("arguments must be a JSON object, got {}", other),
            ));
        }
    };

    let mut canonical = Map::new();
    for param in &spec.params {
        match given.get(&param.name) {
            None | Some(Value::Null) => {
                if param.required {
                    return Err(ToolError::invalid(
                        &spec.name,
                        format!("missing required parameter '{}'", param.name),
                    ));
                }
            }
            Some(value) => {
                let checked = validate_value(&spec.name, param, value)?;
                canonical.insert(param.name.clone(), checked);
            }
        }
    }
    Ok(Value::Object(canonical))
}
