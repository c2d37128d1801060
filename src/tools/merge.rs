//! Semantic merge and comparison of source files.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

use super::outline::{Block, BlockKind, Language, Outline};

/// Result of merging several sources into one file.
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    #[serde(skip)]
    pub content: String,
    pub imports: usize,
    pub declarations: Vec<String>,
    /// Later same-named declarations that were dropped in favor of the first.
    pub conflicts: Vec<String>,
    pub statements: usize,
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn import_rank(language: Language, import: &str) -> u8 {
    match language {
        Language::Python if import.starts_with("from __future__") => 0,
        _ => 1,
    }
}

/// Merge `sources` (path, content) in order. The first header wins, imports
/// are deduplicated and sorted, other statements keep first-seen order, and
/// every distinct declaration is kept with the first occurrence of a name
/// winning. Rust `impl` blocks with the same header but different bodies are
/// all kept.
pub fn merge_sources(language: Language, sources: &[(String, String)]) -> MergeOutcome {
    let outlines: Vec<Outline> = sources
        .iter()
        .map(|(_, content)| Outline::parse(language, content))
        .collect();

    let header = outlines
        .iter()
        .flat_map(|o| o.of_kind(BlockKind::Header))
        .next()
        .map(|b| b.text.clone());

    let mut imports: Vec<String> = Vec::new();
    let mut seen_imports = HashSet::new();
    for block in outlines.iter().flat_map(|o| o.of_kind(BlockKind::Import)) {
        if seen_imports.insert(normalize(&block.text)) {
            imports.push(block.text.clone());
        }
    }
    imports.sort_by(|a, b| {
        (import_rank(language, a), a.as_str()).cmp(&(import_rank(language, b), b.as_str()))
    });

    let mut statements: Vec<&Block> = Vec::new();
    let mut main_guards: Vec<&Block> = Vec::new();
    let mut seen_statements = HashSet::new();
    let mut decls: Vec<&Block> = Vec::new();
    let mut seen_names: HashSet<&str> = HashSet::new();
    let mut seen_decl_text = HashSet::new();
    let mut conflicts = Vec::new();

    for block in outlines.iter().flat_map(|o| o.blocks.iter()) {
        match block.kind {
            BlockKind::Header | BlockKind::Import => {}
            BlockKind::Other => {
                if seen_statements.insert(normalize(&block.text)) {
                    statements.push(block);
                }
            }
            BlockKind::MainGuard => {
                if main_guards.is_empty() {
                    main_guards.push(block);
                }
            }
            BlockKind::Declaration => {
                let name = block.name.as_deref().unwrap_or_default();
                let text_key = normalize(&block.text);
                if seen_decl_text.contains(&text_key) {
                    continue;
                }
                let is_impl = language == Language::Rust && name.starts_with("impl");
                if seen_names.contains(name) && !is_impl {
                    conflicts.push(name.to_string());
                    continue;
                }
                seen_names.insert(name);
                seen_decl_text.insert(text_key);
                decls.push(block);
            }
        }
    }

    let decl_gap = match language {
        Language::Python => "\n\n\n",
        Language::Rust => "\n\n",
    };

    let mut sections: Vec<String> = Vec::new();
    if let Some(h) = header {
        sections.push(h);
    }
    if !imports.is_empty() {
        sections.push(imports.join("\n"));
    }
    if !statements.is_empty() {
        sections.push(
            statements
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        );
    }
    if !decls.is_empty() {
        sections.push(
            decls
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join(decl_gap),
        );
    }
    for guard in &main_guards {
        sections.push(guard.text.clone());
    }

    let mut content = sections.join(decl_gap);
    content.push('\n');

    MergeOutcome {
        content,
        imports: imports.len(),
        declarations: decls.iter().filter_map(|b| b.name.clone()).collect(),
        conflicts,
        statements: statements.len(),
    }
}

/// Structural comparison of two files.
#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub identical: bool,
    /// Jaccard similarity of the sets of non-blank trimmed lines.
    pub similarity: f64,
    pub shared_declarations: Vec<String>,
    pub only_in_a: Vec<String>,
    pub only_in_b: Vec<String>,
}

pub fn compare_sources(language: Option<Language>, a: &str, b: &str) -> Comparison {
    let lines = |s: &str| -> BTreeSet<String> {
        s.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    };
    let (la, lb) = (lines(a), lines(b));
    let union = la.union(&lb).count();
    let similarity = if union == 0 {
        1.0
    } else {
        la.intersection(&lb).count() as f64 / union as f64
    };

    let (names_a, names_b): (BTreeSet<String>, BTreeSet<String>) = match language {
        Some(lang) => (
            Outline::parse(lang, a).declaration_names().into_iter().collect(),
            Outline::parse(lang, b).declaration_names().into_iter().collect(),
        ),
        None => (BTreeSet::new(), BTreeSet::new()),
    };

    Comparison {
        identical: a == b,
        similarity: (similarity * 1000.0).round() / 1000.0,
        shared_declarations: names_a.intersection(&names_b).cloned().collect(),
        only_in_a: names_a.difference(&names_b).cloned().collect(),
        only_in_b: names_b.difference(&names_a).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(path: &str, content: &str) -> (String, String) {
        (path.to_string(), content.to_string())
    }

    #[test]
    fn test_merge_python_unions_declarations_and_dedups_imports() {
        let a = "\"\"\"Utilities.\"\"\"\nimport os\nimport sys\n\n\ndef alpha():\n    return os.getcwd()\n";
        let b = "import sys\nimport json\n\n\ndef beta():\n    return json.dumps({})\n";
        let merged = merge_sources(Language::Python, &[src("a.py", a), src("b.py", b)]);

        assert_eq!(merged.imports, 3);
        assert_eq!(merged.declarations, vec!["alpha", "beta"]);
        assert!(merged.conflicts.is_empty());
        assert!(merged.content.starts_with("\"\"\"Utilities.\"\"\""));
        assert_eq!(merged.content.matches("import sys").count(), 1);
        assert!(merged.content.contains("def alpha():\n    return os.getcwd()"));
        assert!(merged.content.contains("def beta():\n    return json.dumps({})"));
        let json_at = merged.content.find("import json").unwrap();
        let os_at = merged.content.find("import os").unwrap();
        assert!(json_at < os_at);
    }

    #[test]
    fn test_merge_first_declaration_wins() {
        let a = "def f():\n    return 1\n";
        let b = "def f():\n    return 2\n\ndef g():\n    return 3\n";
        let merged = merge_sources(Language::Python, &[src("a.py", a), src("b.py", b)]);
        assert_eq!(merged.declarations, vec!["f", "g"]);
        assert_eq!(merged.conflicts, vec!["f"]);
        assert!(merged.content.contains("return 1"));
        assert!(!merged.content.contains("return 2"));
    }

    #[test]
    fn test_merge_identical_declarations_are_not_conflicts() {
        let a = "def f():\n    return 1\n";
        let merged = merge_sources(Language::Python, &[src("a.py", a), src("b.py", a)]);
        assert_eq!(merged.declarations, vec!["f"]);
        assert!(merged.conflicts.is_empty());
    }

    #[test]
    fn test_merge_keeps_future_imports_first_and_main_guard_last() {
        let a = "from __future__ import annotations\nimport zlib\n\nif __name__ == \"__main__\":\n    run()\n";
        let b = "import abc\n\ndef run():\n    pass\n";
        let merged = merge_sources(Language::Python, &[src("a.py", a), src("b.py", b)]);
        assert!(merged.content.starts_with("from __future__ import annotations\nimport abc"));
        assert!(merged.content.trim_end().ends_with("run()"));
        let def_at = merged.content.find("def run").unwrap();
        let guard_at = merged.content.find("if __name__").unwrap();
        assert!(def_at < guard_at);
    }

    #[test]
    fn test_merge_rust_keeps_distinct_impls() {
        let a = "use std::fmt;\n\npub struct A;\n\nimpl A {\n    pub fn one() {}\n}\n";
        let b = "use std::fmt;\n\nimpl A {\n    pub fn two() {}\n}\n\npub fn helper() {}\n";
        let merged = merge_sources(Language::Rust, &[src("a.rs", a), src("b.rs", b)]);
        assert_eq!(merged.imports, 1);
        assert_eq!(merged.declarations, vec!["A", "impl A", "impl A", "helper"]);
        assert!(merged.content.contains("pub fn one() {}"));
        assert!(merged.content.contains("pub fn two() {}"));
    }

    #[test]
    fn test_compare_sources() {
        let a = "def f():\n    return 1\n\ndef g():\n    pass\n";
        let b = "def f():\n    return 1\n\ndef h():\n    pass\n";
        let cmp = compare_sources(Some(Language::Python), a, b);
        assert!(!cmp.identical);
        assert_eq!(cmp.shared_declarations, vec!["f"]);
        assert_eq!(cmp.only_in_a, vec!["g"]);
        assert_eq!(cmp.only_in_b, vec!["h"]);
        assert!(cmp.similarity > 0.0 && cmp.similarity < 1.0);

        let same = compare_sources(None, "x\n", "x\n");
        assert!(same.identical);
        assert_eq!(same.similarity, 1.0);
    }
}
