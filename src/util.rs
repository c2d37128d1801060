//! Shared utility functions for the Crucible crate.

use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;

/// Extract the first JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object, skipping braces
/// that appear inside string literals.
pub fn extract_json_object(text: &str) -> Option<String> {
    json_objects(text).into_iter().next().map(str::to_string)
}

/// Every balanced top-level `{...}` span in `text`, in order of appearance.
pub fn json_objects(text: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0
                    && let Some(s) = start.take()
                {
                    found.push(&text[s..=i]);
                }
            }
            _ => {}
        }
    }

    found
}

/// Normalize a model-supplied file path into a project-relative form.
///
/// Trims whitespace, converts backslashes, strips leading `/` and `./`
/// segments, and collapses repeated separators.
pub fn normalize_path(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    let parts: Vec<&str> = unified
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    parts.join("/")
}

/// True when a normalized path would escape the project directory.
pub fn escapes_root(normalized: &str) -> bool {
    normalized.split('/').any(|p| p == "..")
}

/// Hex SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Write `bytes` to `path` atomically: write a temp file in the same
/// directory, fsync it, then rename it over the destination.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Shorten `text` to at most `max` characters, appending an ellipsis.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"{"key": "value"}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"key": "value"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_with_prefix_and_suffix() {
        let text = r#"Here is the JSON: {"key": "value"} and more"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"key": "value"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_ignores_braces_in_strings() {
        let text = r#"x {"code": "fn main() { }", "n": 1} y"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"code": "fn main() { }", "n": 1}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
        assert_eq!(extract_json_object("No JSON here"), None);
    }

    #[test]
    fn test_json_objects_finds_all() {
        let text = r#"first {"a": 1} then {"b": {"c": 2}} done"#;
        assert_eq!(json_objects(text), vec![r#"{"a": 1}"#, r#"{"b": {"c": 2}}"#]);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("  ./src//main.py "), "src/main.py");
        assert_eq!(normalize_path("/abs/path.rs"), "abs/path.rs");
        assert_eq!(normalize_path("src\\lib\\mod.py"), "src/lib/mod.py");
        assert_eq!(normalize_path("././a/./b"), "a/b");
    }

    #[test]
    fn test_escapes_root() {
        assert!(escapes_root("../etc/passwd"));
        assert!(escapes_root("a/../../b"));
        assert!(!escapes_root("a/b..c"));
    }

    #[test]
    fn test_sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 5), "hello...");
    }
}
