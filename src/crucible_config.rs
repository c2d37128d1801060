//! Project configuration read from `.crucible/crucible.toml`.
//!
//! Settings are layered: file, then environment, then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-project"
//! model_cmd = "crucible-model"
//! model_args = ["--json"]
//!
//! [model]
//! timeout_secs = 600
//!
//! [retry]
//! ceiling = 2
//! stall_limit = 3
//! persist_attempts = 3
//!
//! [loop_detection]
//! window = 20
//! repeat_threshold = 3
//! oscillation_cycles = 3
//! no_progress_threshold = 3
//!
//! [tools]
//! timeout_secs = 60
//! parallel = false
//!
//! [[tools.external]]
//! name = "complexity"
//! description = "Cyclomatic complexity of a file"
//! command = "radon cc -j"
//! phases = ["qa", "refactoring"]
//! parameters = [{ name = "path", kind = "path", required = true }]
//!
//! [scheduling]
//! order = ["development", "review", "fixes"]
//! completion_threshold = 0.8
//! refactor_interval = 5
//!
//! [history]
//! max_age_hours = 72
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::phase::{Phase, WorkClass};
use crate::tools::{ParamSpec, ToolRegistry};

pub const CONFIG_FILE: &str = "crucible.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project name (optional, defaults to directory name)
    #[serde(default)]
    pub name: Option<String>,
    /// Command that answers model requests (JSON on stdin, JSON on stdout)
    #[serde(default = "default_model_cmd")]
    pub model_cmd: String,
    #[serde(default)]
    pub model_args: Vec<String>,
}

fn default_model_cmd() -> String {
    "crucible-model".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: None,
            model_cmd: default_model_cmd(),
            model_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
}

fn default_model_timeout() -> u64 {
    600
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_model_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Retries a task may use before it is escalated
    #[serde(default = "default_ceiling")]
    pub ceiling: u32,
    /// No-progress iterations in a row before a task is escalated
    #[serde(default = "default_stall_limit")]
    pub stall_limit: u32,
    /// Attempts at writing the state file before the iteration fails
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,
}

fn default_ceiling() -> u32 {
    2
}

fn default_stall_limit() -> u32 {
    3
}

fn default_persist_attempts() -> u32 {
    3
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            ceiling: default_ceiling(),
            stall_limit: default_stall_limit(),
            persist_attempts: default_persist_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDetectionSection {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_three")]
    pub repeat_threshold: usize,
    #[serde(default = "default_three")]
    pub oscillation_cycles: usize,
    #[serde(default = "default_no_progress")]
    pub no_progress_threshold: u32,
}

fn default_window() -> usize {
    20
}

fn default_three() -> usize {
    3
}

fn default_no_progress() -> u32 {
    3
}

impl Default for LoopDetectionSection {
    fn default() -> Self {
        Self {
            window: default_window(),
            repeat_threshold: default_three(),
            oscillation_cycles: default_three(),
            no_progress_threshold: default_no_progress(),
        }
    }
}

/// An analysis tool run out-of-process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Shell command; receives `{tool, arguments, project_dir}` as JSON on stdin
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Phases the tool is offered in (empty = all)
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    /// Run independent read-only calls of one batch concurrently
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub external: Vec<ExternalToolConfig>,
}

fn default_tool_timeout() -> u64 {
    60
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout(),
            parallel: false,
            external: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingSection {
    /// Work classes in priority order
    #[serde(default = "default_order")]
    pub order: Vec<String>,
    /// Share of COMPLETED tasks that unlocks documentation and refactoring
    #[serde(default = "default_completion_threshold")]
    pub completion_threshold: f64,
    /// Minimum iterations between refactoring passes
    #[serde(default = "default_refactor_interval")]
    pub refactor_interval: u64,
}

fn default_order() -> Vec<String> {
    vec![
        "development".to_string(),
        "review".to_string(),
        "fixes".to_string(),
    ]
}

fn default_completion_threshold() -> f64 {
    0.8
}

fn default_refactor_interval() -> u64 {
    5
}

impl Default for SchedulingSection {
    fn default() -> Self {
        Self {
            order: default_order(),
            completion_threshold: default_completion_threshold(),
            refactor_interval: default_refactor_interval(),
        }
    }
}

fn parse_work_class(name: &str) -> Option<WorkClass> {
    match name.to_lowercase().as_str() {
        "development" => Some(WorkClass::Development),
        "review" => Some(WorkClass::Review),
        "fixes" => Some(WorkClass::Fixes),
        _ => None,
    }
}

impl SchedulingSection {
    /// The configured order as work classes.
    pub fn work_order(&self) -> Result<Vec<WorkClass>> {
        let mut order = Vec::with_capacity(self.order.len());
        for name in &self.order {
            let Some(class) = parse_work_class(name) else {
                bail!(
                    "Unknown scheduling entry '{}'. Valid values: development, review, fixes",
                    name
                );
            };
            if order.contains(&class) {
                bail!("Duplicate scheduling entry '{}'", name);
            }
            order.push(class);
        }
        if order.len() != WorkClass::DEFAULT_ORDER.len() {
            bail!("Scheduling order must name development, review and fixes exactly once");
        }
        Ok(order)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySection {
    /// Action records older than this are pruned at run start
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
}

fn default_max_age_hours() -> u64 {
    72
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            max_age_hours: default_max_age_hours(),
        }
    }
}

/// The complete crucible.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrucibleToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub loop_detection: LoopDetectionSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub scheduling: SchedulingSection,
    #[serde(default)]
    pub history: HistorySection,
}

impl CrucibleToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse crucible.toml")
    }

    /// Load `.crucible/crucible.toml`, or defaults if it does not exist.
    pub fn load_or_default(crucible_dir: &Path) -> Result<Self> {
        let path = crucible_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize crucible.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CRUCIBLE_MODEL_CMD`, `CRUCIBLE_RETRY_CEILING` and
    /// `CRUCIBLE_TOOL_TIMEOUT` on top of the file values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(cmd) = lookup("CRUCIBLE_MODEL_CMD")
            && !cmd.trim().is_empty()
        {
            self.project.model_cmd = cmd;
        }
        if let Some(raw) = lookup("CRUCIBLE_RETRY_CEILING") {
            self.retry.ceiling = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid CRUCIBLE_RETRY_CEILING '{}'", raw))?;
        }
        if let Some(raw) = lookup("CRUCIBLE_TOOL_TIMEOUT") {
            self.tools.timeout_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid CRUCIBLE_TOOL_TIMEOUT '{}'", raw))?;
        }
        Ok(())
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.retry.ceiling == 0 {
            problems.push("retry.ceiling must be at least 1".to_string());
        }
        if self.retry.persist_attempts == 0 {
            problems.push("retry.persist_attempts must be at least 1".to_string());
        }
        if self.loop_detection.window == 0 {
            problems.push("loop_detection.window must be at least 1".to_string());
        }
        if self.loop_detection.repeat_threshold == 0 {
            problems.push("loop_detection.repeat_threshold must be at least 1".to_string());
        }
        if self.model.timeout_secs == 0 || self.tools.timeout_secs == 0 {
            problems.push("timeouts must be at least 1 second".to_string());
        }
        if !(0.0..=1.0).contains(&self.scheduling.completion_threshold) {
            problems.push(format!(
                "scheduling.completion_threshold {} must be between 0 and 1",
                self.scheduling.completion_threshold
            ));
        }
        if let Err(e) = self.scheduling.work_order() {
            problems.push(e.to_string());
        }

        let builtin = ToolRegistry::builtin();
        let mut seen = HashSet::new();
        for ext in &self.tools.external {
            if builtin.get(&ext.name).is_some() {
                problems.push(format!(
                    "External tool '{}' shadows a built-in tool",
                    ext.name
                ));
            }
            if !seen.insert(ext.name.as_str()) {
                problems.push(format!("External tool '{}' is defined twice", ext.name));
            }
            if ext.command.trim().is_empty() {
                problems.push(format!("External tool '{}' has no command", ext.name));
            }
        }

        problems
    }
}

/// Default file written by `crucible init`.
pub fn default_config_text(project_name: &str) -> String {
    format!(
        r#"[project]
name = "{}"
model_cmd = "crucible-model"

[retry]
ceiling = 2
stall_limit = 3

[loop_detection]
window = 20
repeat_threshold = 3

[tools]
timeout_secs = 60
parallel = false

[scheduling]
order = ["development", "review", "fixes"]
completion_threshold = 0.8
"#,
        project_name
    )
}
