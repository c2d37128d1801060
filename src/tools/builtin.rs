//! Built-in tool implementations.
//!
//! File-system tools are plain synchronous functions over a [`Workspace`]; the
//! dispatcher runs them on the blocking pool so a panic or a hang is contained.
//! State tools mutate the [`PipelineState`] directly through the task store
//! and run on the coordinator task.

use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use super::BuiltinTool;
use super::merge::{compare_sources, merge_sources};
use super::outline::Language;
use crate::errors::ToolError;
use crate::phase::Phase;
use crate::state::{NewTask, ObjectiveLevel, PipelineState, ReviewStatus, TaskError, TaskKind, TaskStatus};
use crate::util::{atomic_write, normalize_path, sha256_hex, truncate};

const MAX_READ_CHARS: usize = 200_000;
const MAX_SEARCH_MATCHES: usize = 200;
const SKIP_DIRS: [&str; 4] = [".crucible", ".git", "target", "node_modules"];
const DEFAULT_TASK_PRIORITY: u8 = 5;
const FIX_TASK_PRIORITY: u8 = 2;

/// A project file written or removed by a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct FileWrite {
    pub path: String,
    /// SHA-256 of the new content; `None` when the file was removed.
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub value: Value,
    /// One-line summary kept in checkpoints.
    pub summary: String,
    pub writes: Vec<FileWrite>,
    /// The call created or transitioned a task.
    pub tasks_changed: bool,
}

impl ToolOutput {
    fn new(value: Value, summary: impl Into<String>) -> Self {
        Self {
            value,
            summary: summary.into(),
            ..Default::default()
        }
    }
}

/// Project root plus the directory holding pre-write backups.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub project_dir: PathBuf,
    pub backup_dir: PathBuf,
}

impl Workspace {
    pub fn new(project_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            backup_dir: backup_dir.into(),
        }
    }

    pub fn resolve(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.project_dir.clone()
        } else {
            self.project_dir.join(rel)
        }
    }

    fn read(&self, tool: &str, rel: &str) -> Result<String, ToolError> {
        let path = self.resolve(rel);
        std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ToolError::failed(tool, format!("File not found: {}", rel)),
            _ => ToolError::failed(tool, format!("Failed to read {}: {}", rel, e)),
        })
    }

    /// Copy the current content of `rel`, if any, into the backup directory.
    fn backup(&self, tool: &str, seq: u64, rel: &str) -> Result<Option<PathBuf>, ToolError> {
        let source = self.resolve(rel);
        if !source.is_file() {
            return Ok(None);
        }
        let name = format!("{:06}-{}", seq, rel.replace('/', "__"));
        let dest = self.backup_dir.join(name);
        std::fs::create_dir_all(&self.backup_dir)
            .and_then(|_| std::fs::copy(&source, &dest))
            .map_err(|e| ToolError::failed(tool, format!("Failed to back up {}: {}", rel, e)))?;
        Ok(Some(dest))
    }

    /// Back up then atomically replace `rel`.
    fn write(&self, tool: &str, seq: u64, rel: &str, content: &str) -> Result<FileWrite, ToolError> {
        self.backup(tool, seq, rel)?;
        atomic_write(&self.resolve(rel), content.as_bytes())
            .map_err(|e| ToolError::failed(tool, format!("Failed to write {}: {}", rel, e)))?;
        Ok(FileWrite {
            path: rel.to_string(),
            hash: Some(sha256_hex(content.as_bytes())),
        })
    }

    fn remove(&self, tool: &str, seq: u64, rel: &str) -> Result<FileWrite, ToolError> {
        self.backup(tool, seq, rel)?;
        std::fs::remove_file(self.resolve(rel))
            .map_err(|e| ToolError::failed(tool, format!("Failed to remove {}: {}", rel, e)))?;
        Ok(FileWrite {
            path: rel.to_string(),
            hash: None,
        })
    }
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

fn required<'a>(tool: &str, args: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    str_arg(args, name)
        .ok_or_else(|| ToolError::invalid(tool, format!("missing required parameter '{}'", name)))
}

/// Run a file-system tool.
pub fn run_fs(
    tool: BuiltinTool,
    name: &str,
    ws: &Workspace,
    seq: u64,
    args: &Value,
) -> Result<ToolOutput, ToolError> {
    match tool {
        BuiltinTool::ReadFile => read_file(name, ws, args),
        BuiltinTool::ListDirectory => list_directory(name, ws, args),
        BuiltinTool::SearchCode => search_code(name, ws, args),
        BuiltinTool::CreateFile => create_file(name, ws, seq, args),
        BuiltinTool::ModifyFile => modify_file(name, ws, seq, args),
        BuiltinTool::CompareFiles => compare_files(name, ws, args),
        BuiltinTool::MergeFiles => merge_files(name, ws, seq, args),
        _ => Err(ToolError::failed(name, "not a file-system tool")),
    }
}

fn read_file(name: &str, ws: &Workspace, args: &Value) -> Result<ToolOutput, ToolError> {
    let path = required(name, args, "path")?;
    let content = ws.read(name, path)?;
    let lines = content.lines().count();
    let truncated = content.chars().count() > MAX_READ_CHARS;
    Ok(ToolOutput::new(
        json!({
            "path": path,
            "lines": lines,
            "truncated": truncated,
            "content": truncate(&content, MAX_READ_CHARS),
        }),
        format!("read {} ({} lines)", path, lines),
    ))
}

fn list_directory(name: &str, ws: &Workspace, args: &Value) -> Result<ToolOutput, ToolError> {
    let path = str_arg(args, "path").unwrap_or("");
    let dir = ws.resolve(path);
    let reader = std::fs::read_dir(&dir)
        .map_err(|e| ToolError::failed(name, format!("Failed to list '{}': {}", path, e)))?;

    let mut entries: Vec<String> = reader
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if path.is_empty() && file_name == ".crucible" {
                return None;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            Some(if is_dir {
                format!("{}/", file_name)
            } else {
                file_name
            })
        })
        .collect();
    entries.sort();

    let shown = if path.is_empty() { "." } else { path };
    Ok(ToolOutput::new(
        json!({"path": shown, "entries": entries}),
        format!("listed {} ({} entries)", shown, entries.len()),
    ))
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|p| normalize_path(&p.to_string_lossy()))
}

fn search_code(name: &str, ws: &Workspace, args: &Value) -> Result<ToolOutput, ToolError> {
    let pattern = required(name, args, "pattern")?;
    let regex = regex::Regex::new(pattern)
        .map_err(|e| ToolError::invalid(name, format!("invalid pattern: {}", e)))?;
    let filter = str_arg(args, "glob")
        .map(glob::Pattern::new)
        .transpose()
        .map_err(|e| ToolError::invalid(name, format!("invalid glob: {}", e)))?;

    let mut matches = Vec::new();
    let mut truncated = false;
    let walker = WalkDir::new(&ws.project_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || !SKIP_DIRS.iter().any(|d| e.file_name() == *d)
        });

    'files: for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative(&ws.project_dir, entry.path()) else {
            continue;
        };
        if let Some(glob) = &filter
            && !glob.matches(&rel)
        {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for (idx, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                if matches.len() >= MAX_SEARCH_MATCHES {
                    truncated = true;
                    break 'files;
                }
                matches.push(json!({
                    "path": rel,
                    "line": idx + 1,
                    "text": truncate(line.trim(), 200),
                }));
            }
        }
    }

    let summary = format!("{} matches for /{}/", matches.len(), pattern);
    Ok(ToolOutput::new(
        json!({"matches": matches, "truncated": truncated}),
        summary,
    ))
}

fn create_file(name: &str, ws: &Workspace, seq: u64, args: &Value) -> Result<ToolOutput, ToolError> {
    let path = required(name, args, "path")?;
    let content = required(name, args, "content")?;
    let existed = ws.resolve(path).is_file();
    let write = ws.write(name, seq, path, content)?;
    debug!(path, existed, "File written");

    let mut out = ToolOutput::new(
        json!({
            "path": path,
            "created": !existed,
            "bytes": content.len(),
        }),
        format!("{} {}", if existed { "overwrote" } else { "created" }, path),
    );
    out.writes.push(write);
    Ok(out)
}

/// Line window of `content` sharing the most trimmed lines with `snippet`.
fn closest_window(content: &str, snippet: &str) -> Option<(usize, String)> {
    let hay: Vec<&str> = content.lines().collect();
    let needle: Vec<&str> = snippet
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if hay.is_empty() || needle.is_empty() {
        return None;
    }
    let width = needle.len().min(hay.len());
    let mut best = (0usize, 0usize);
    for start in 0..=hay.len() - width {
        if hay[start].trim().is_empty() {
            continue;
        }
        let score = hay[start..start + width]
            .iter()
            .filter(|l| needle.contains(&l.trim()))
            .count();
        if score > best.1 {
            best = (start, score);
        }
    }
    (best.1 > 0).then(|| (best.0 + 1, hay[best.0..best.0 + width].join("\n")))
}

fn modify_file(name: &str, ws: &Workspace, seq: u64, args: &Value) -> Result<ToolOutput, ToolError> {
    let path = required(name, args, "path")?;
    let original = required(name, args, "original")?;
    let replacement = required(name, args, "replacement")?;
    if original.is_empty() {
        return Err(ToolError::invalid(name, "'original' must not be empty"));
    }

    let content = ws.read(name, path)?;
    let Some(at) = content.find(original) else {
        let hint = match closest_window(&content, original) {
            Some((line, window)) => format!(
                "closest match at line {}:\n{}",
                line,
                truncate(&window, 500)
            ),
            None => "no similar lines found".to_string(),
        };
        return Err(ToolError::failed(
            name,
            format!("original snippet not found in {}; {}", path, hint),
        ));
    };

    let mut updated = String::with_capacity(content.len() + replacement.len());
    updated.push_str(&content[..at]);
    updated.push_str(replacement);
    updated.push_str(&content[at + original.len()..]);

    let changed = updated != content;
    let mut out = ToolOutput::new(
        json!({
            "path": path,
            "changed": changed,
            "line": content[..at].lines().count() + 1,
        }),
        format!("modified {}", path),
    );
    if changed {
        out.writes.push(ws.write(name, seq, path, &updated)?);
    }
    Ok(out)
}

fn compare_files(name: &str, ws: &Workspace, args: &Value) -> Result<ToolOutput, ToolError> {
    let file_a = required(name, args, "file_a")?;
    let file_b = required(name, args, "file_b")?;
    let a = ws.read(name, file_a)?;
    let b = ws.read(name, file_b)?;

    let language = match (Language::from_path(file_a), Language::from_path(file_b)) {
        (Some(la), Some(lb)) if la == lb => Some(la),
        _ => None,
    };
    let cmp = compare_sources(language, &a, &b);
    let summary = format!(
        "{} vs {}: similarity {:.2}, {} shared declarations",
        file_a,
        file_b,
        cmp.similarity,
        cmp.shared_declarations.len()
    );
    let mut value = serde_json::to_value(&cmp)
        .map_err(|e| ToolError::failed(name, format!("Failed to encode comparison: {}", e)))?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("file_a".into(), json!(file_a));
        obj.insert("file_b".into(), json!(file_b));
    }
    Ok(ToolOutput::new(value, summary))
}

fn merge_files(name: &str, ws: &Workspace, seq: u64, args: &Value) -> Result<ToolOutput, ToolError> {
    let target = required(name, args, "target")?;
    let mut sources: Vec<&str> = Vec::new();
    for source in args
        .get("sources")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
    {
        if !sources.contains(&source) {
            sources.push(source);
        }
    }
    if sources.is_empty() {
        return Err(ToolError::invalid(name, "'sources' must not be empty"));
    }
    let remove_sources = args
        .get("remove_sources")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let language = Language::from_path(target).ok_or_else(|| {
        ToolError::invalid(name, format!("cannot merge {}: only Python and Rust files are supported", target))
    })?;
    if let Some(other) = sources
        .iter()
        .find(|s| Language::from_path(s) != Some(language))
    {
        return Err(ToolError::invalid(
            name,
            format!("{} is not the same language as {}", other, target),
        ));
    }

    let mut inputs: Vec<(String, String)> = Vec::new();
    if !sources.contains(&target) && ws.resolve(target).is_file() {
        inputs.push((target.to_string(), ws.read(name, target)?));
    }
    for source in &sources {
        inputs.push((source.to_string(), ws.read(name, source)?));
    }

    let merged = merge_sources(language, &inputs);
    let mut writes = vec![ws.write(name, seq, target, &merged.content)?];

    let mut removed = Vec::new();
    if remove_sources {
        for source in sources.iter().filter(|s| **s != target) {
            writes.push(ws.remove(name, seq, source)?);
            removed.push(source.to_string());
        }
    }

    let summary = format!(
        "merged {} files into {} ({} declarations, {} conflicts)",
        inputs.len(),
        target,
        merged.declarations.len(),
        merged.conflicts.len()
    );
    let mut out = ToolOutput::new(
        json!({
            "target": target,
            "sources": sources,
            "imports": merged.imports,
            "declarations": merged.declarations,
            "conflicts": merged.conflicts,
            "removed": removed,
        }),
        summary,
    );
    out.writes = writes;
    Ok(out)
}

/// Run a tool that changes the task store.
pub fn run_state(
    tool: BuiltinTool,
    name: &str,
    state: &mut PipelineState,
    phase: Phase,
    args: &Value,
) -> Result<ToolOutput, ToolError> {
    match tool {
        BuiltinTool::CreateTask => create_task(name, state, args),
        BuiltinTool::ApproveCode => approve_code(name, state, args),
        BuiltinTool::ReportIssue => report_issue(name, state, phase, args),
        BuiltinTool::CreateIssueReport => create_issue_report(name, state, phase, args),
        _ => Err(ToolError::failed(name, "not a state tool")),
    }
}

fn create_task(name: &str, state: &mut PipelineState, args: &Value) -> Result<ToolOutput, ToolError> {
    let description = required(name, args, "description")?;
    let target = required(name, args, "target")?;
    let priority = match args.get("priority").and_then(Value::as_i64) {
        Some(p) => u8::try_from(p.clamp(0, i64::from(u8::MAX))).unwrap_or(u8::MAX),
        None => DEFAULT_TASK_PRIORITY,
    };

    let mut new = NewTask::new(description, target, priority);
    if let Some(kind) = str_arg(args, "kind") {
        let kind: TaskKind = kind
            .parse()
            .map_err(|e: anyhow::Error| ToolError::invalid(name, e.to_string()))?;
        new = new.kind(kind);
    }
    if let Some(title) = str_arg(args, "objective").filter(|t| !t.is_empty()) {
        let objective_id = state.tasks.ensure_objective(title, ObjectiveLevel::Secondary);
        new = new.objective(objective_id);
    }

    let (task_id, created) = state.tasks.create(new);
    let mut out = ToolOutput::new(
        json!({"task_id": task_id, "created": created}),
        format!(
            "{} task {}",
            if created { "created" } else { "reused" },
            task_id
        ),
    );
    out.tasks_changed = created;
    Ok(out)
}

fn awaiting_review_for(state: &PipelineState, path: &str) -> Vec<String> {
    state
        .tasks
        .tasks()
        .filter(|t| t.status == TaskStatus::AwaitingReview && t.target == path)
        .map(|t| t.id.clone())
        .collect()
}

fn approve_code(name: &str, state: &mut PipelineState, args: &Value) -> Result<ToolOutput, ToolError> {
    let path = required(name, args, "path")?;
    state.set_review(path, ReviewStatus::Approved);

    let completed = awaiting_review_for(state, path);
    for id in &completed {
        state.tasks.update_task(id, TaskStatus::Completed, None)?;
    }

    let mut out = ToolOutput::new(
        json!({"path": path, "completed": completed}),
        format!("approved {}", path),
    );
    out.tasks_changed = !completed.is_empty();
    Ok(out)
}

fn report_issue(
    name: &str,
    state: &mut PipelineState,
    phase: Phase,
    args: &Value,
) -> Result<ToolOutput, ToolError> {
    let path = required(name, args, "path")?;
    let description = required(name, args, "description")?;
    let severity = str_arg(args, "severity").unwrap_or("medium");
    state.set_review(path, ReviewStatus::Rejected);

    let message = format!("[{}] {}", severity, description);
    let reopened = awaiting_review_for(state, path);
    for id in &reopened {
        state.tasks.update_task(
            id,
            TaskStatus::NeedsFixes,
            Some(TaskError::new(message.clone()).in_phase(phase)),
        )?;
    }

    let created = if reopened.is_empty() {
        let new = NewTask::new(format!("Fix: {}", description), path, FIX_TASK_PRIORITY)
            .kind(TaskKind::Fix);
        Some(state.tasks.create(new).0)
    } else {
        None
    };

    let mut out = ToolOutput::new(
        json!({
            "path": path,
            "severity": severity,
            "needs_fixes": reopened,
            "created_task": created,
        }),
        format!("reported issue in {}", path),
    );
    out.tasks_changed = true;
    Ok(out)
}

fn create_issue_report(
    name: &str,
    state: &mut PipelineState,
    phase: Phase,
    args: &Value,
) -> Result<ToolOutput, ToolError> {
    let task_id = required(name, args, "task_id")?;
    let summary = required(name, args, "summary")?;
    let task = state
        .tasks
        .escalate(task_id, TaskError::new(summary).in_phase(phase))?;

    let mut out = ToolOutput::new(
        json!({"task_id": task.id, "status": task.status}),
        format!("escalated {}", task.id),
    );
    out.tasks_changed = true;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use tempfile::tempdir;

    fn workspace(root: &Path) -> Workspace {
        Workspace::new(root, root.join(".crucible/backups"))
    }

    #[test]
    fn test_modify_file_replaces_first_occurrence_with_backup() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.py"), "x = 1\nx = 1\n").unwrap();
        let ws = workspace(dir.path());

        let out = run_fs(
            BuiltinTool::ModifyFile,
            "modify_file",
            &ws,
            7,
            &json!({"path": "f.py", "original": "x = 1", "replacement": "x = 2"}),
        )
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.py")).unwrap(),
            "x = 2\nx = 1\n"
        );
        assert_eq!(out.writes.len(), 1);
        assert_eq!(out.writes[0].path, "f.py");
        let backup = dir.path().join(".crucible/backups/000007-f.py");
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "x = 1\nx = 1\n");
    }

    #[test]
    fn test_modify_file_miss_reports_closest_window() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("f.py"),
            "def a():\n    return 1\n\ndef b():\n    return 2\n",
        )
        .unwrap();
        let ws = workspace(dir.path());

        let err = run_fs(
            BuiltinTool::ModifyFile,
            "modify_file",
            &ws,
            1,
            &json!({"path": "f.py", "original": "def b():\n    return 3", "replacement": ""}),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ToolExecutionFailure);
        assert!(err.to_string().contains("closest match at line 4"));
    }

    #[test]
    fn test_read_missing_file_fails() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        let err = run_fs(BuiltinTool::ReadFile, "read_file", &ws, 1, &json!({"path": "nope.py"}))
            .unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn test_create_file_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        let out = run_fs(
            BuiltinTool::CreateFile,
            "create_file",
            &ws,
            1,
            &json!({"path": "pkg/mod.py", "content": "X = 1\n"}),
        )
        .unwrap();
        assert_eq!(out.value["created"], true);
        assert_eq!(
            out.writes[0].hash.as_deref(),
            Some(sha256_hex(b"X = 1\n").as_str())
        );
        assert!(dir.path().join("pkg/mod.py").is_file());
    }

    #[test]
    fn test_list_and_search() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".crucible")).unwrap();
        std::fs::write(dir.path().join("src/a.py"), "def alpha():\n    pass\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "alpha notes\n").unwrap();
        std::fs::write(dir.path().join(".crucible/state.json"), "alpha\n").unwrap();
        let ws = workspace(dir.path());

        let listing = run_fs(BuiltinTool::ListDirectory, "list_directory", &ws, 1, &json!({}))
            .unwrap();
        assert_eq!(listing.value["entries"], json!(["notes.txt", "src/"]));

        let all = run_fs(BuiltinTool::SearchCode, "search_code", &ws, 1, &json!({"pattern": "alpha"}))
            .unwrap();
        assert_eq!(all.value["matches"].as_array().unwrap().len(), 2);

        let py = run_fs(
            BuiltinTool::SearchCode,
            "search_code",
            &ws,
            1,
            &json!({"pattern": "alpha", "glob": "**/*.py"}),
        )
        .unwrap();
        assert_eq!(py.value["matches"], json!([{"path": "src/a.py", "line": 1, "text": "def alpha():"}]));

        let bad = run_fs(BuiltinTool::SearchCode, "search_code", &ws, 1, &json!({"pattern": "("}));
        assert_eq!(bad.unwrap_err().kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn test_merge_files_removes_sources_after_backup() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "import os\n\ndef a():\n    return os.sep\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "import os\n\ndef b():\n    return 2\n").unwrap();
        let ws = workspace(dir.path());

        let out = run_fs(
            BuiltinTool::MergeFiles,
            "merge_files",
            &ws,
            3,
            &json!({"sources": ["a.py", "b.py"], "target": "a.py", "remove_sources": true}),
        )
        .unwrap();

        let merged = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert_eq!(merged.matches("import os").count(), 1);
        assert!(merged.contains("def a():"));
        assert!(merged.contains("def b():"));
        assert!(!dir.path().join("b.py").exists());
        assert!(dir.path().join(".crucible/backups/000003-b.py").is_file());
        assert_eq!(out.writes.len(), 2);
        assert_eq!(out.writes[1].hash, None);
    }

    #[test]
    fn test_merge_files_tolerates_repeated_sources() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "def a():\n    return 1\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "def b():\n    return 2\n").unwrap();
        let ws = workspace(dir.path());

        let out = run_fs(
            BuiltinTool::MergeFiles,
            "merge_files",
            &ws,
            4,
            &json!({"sources": ["a.py", "b.py", "b.py"], "target": "ab.py", "remove_sources": true}),
        )
        .unwrap();

        let merged = std::fs::read_to_string(dir.path().join("ab.py")).unwrap();
        assert_eq!(merged.matches("def b():").count(), 1);
        assert!(!dir.path().join("a.py").exists());
        assert!(!dir.path().join("b.py").exists());
        assert_eq!(out.writes.len(), 3);
        assert_eq!(out.value["sources"], json!(["a.py", "b.py"]));
        assert_eq!(out.value["removed"], json!(["a.py", "b.py"]));
    }

    #[test]
    fn test_merge_rejects_unsupported_language() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let ws = workspace(dir.path());
        let err = run_fs(
            BuiltinTool::MergeFiles,
            "merge_files",
            &ws,
            1,
            &json!({"sources": ["a.txt"], "target": "b.txt"}),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn test_create_task_tool_is_idempotent_and_links_objective() {
        let mut state = PipelineState::new();
        let args = json!({"description": "Add parser", "target": "parser.py", "objective": "Parsing"});
        let first = run_state(BuiltinTool::CreateTask, "create_task", &mut state, Phase::Planning, &args).unwrap();
        let second = run_state(BuiltinTool::CreateTask, "create_task", &mut state, Phase::Planning, &args).unwrap();

        assert!(first.tasks_changed);
        assert!(!second.tasks_changed);
        assert_eq!(first.value["task_id"], second.value["task_id"]);
        assert_eq!(state.tasks.len(), 1);
        let task_id = first.value["task_id"].as_str().unwrap();
        assert!(state.tasks.get(task_id).unwrap().objective.is_some());
    }

    #[test]
    fn test_review_tools_move_awaiting_tasks() {
        let mut state = PipelineState::new();
        let good = state.tasks.create_task("Add a", "a.py", 3);
        let bad = state.tasks.create_task("Add b", "b.py", 3);
        for id in [&good, &bad] {
            state.tasks.update_task(id, TaskStatus::InProgress, None).unwrap();
            state.tasks.update_task(id, TaskStatus::AwaitingReview, None).unwrap();
        }

        let approved = run_state(BuiltinTool::ApproveCode, "approve_code", &mut state, Phase::Qa, &json!({"path": "a.py"})).unwrap();
        assert!(approved.tasks_changed);
        assert_eq!(state.tasks.get(&good).unwrap().status, TaskStatus::Completed);
        assert_eq!(state.files["a.py"].review, ReviewStatus::Approved);

        run_state(
            BuiltinTool::ReportIssue,
            "report_issue",
            &mut state,
            Phase::Qa,
            &json!({"path": "b.py", "description": "off by one"}),
        )
        .unwrap();
        let task = state.tasks.get(&bad).unwrap();
        assert_eq!(task.status, TaskStatus::NeedsFixes);
        assert!(task.last_error().unwrap().message.contains("off by one"));
    }

    #[test]
    fn test_report_issue_without_task_creates_fix_task() {
        let mut state = PipelineState::new();
        let out = run_state(
            BuiltinTool::ReportIssue,
            "report_issue",
            &mut state,
            Phase::Qa,
            &json!({"path": "util.py", "description": "unused import", "severity": "low"}),
        )
        .unwrap();
        let id = out.value["created_task"].as_str().unwrap();
        let task = state.tasks.get(id).unwrap();
        assert_eq!(task.kind, TaskKind::Fix);
        assert_eq!(task.priority, FIX_TASK_PRIORITY);
        assert!(task.description.starts_with("Fix: "));
    }

    #[test]
    fn test_issue_report_is_terminal() {
        let mut state = PipelineState::new();
        let id = state.tasks.create_task("Add a", "a.py", 3);
        state.tasks.update_task(&id, TaskStatus::InProgress, None).unwrap();

        run_state(
            BuiltinTool::CreateIssueReport,
            "create_issue_report",
            &mut state,
            Phase::Debugging,
            &json!({"task_id": id, "summary": "cannot be done"}),
        )
        .unwrap();
        let task = state.tasks.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.report.is_some());

        let again = run_state(
            BuiltinTool::CreateIssueReport,
            "create_issue_report",
            &mut state,
            Phase::Debugging,
            &json!({"task_id": id, "summary": "again"}),
        );
        assert_eq!(again.unwrap_err().kind(), ErrorKind::InvalidTransition);
    }
}
