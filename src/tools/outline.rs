//! Block-level outline of Python and Rust source files.
//!
//! Splits a file into top-level blocks (header, imports, declarations, other
//! statements) without a full parser. Good enough to merge files
//! declaration-by-declaration and to compare what two files define.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    Rust,
}

impl Language {
    pub fn from_path(path: &str) -> Option<Self> {
        match path.rsplit('.').next() {
            Some("py") | Some("pyi") => Some(Language::Python),
            Some("rs") => Some(Language::Rust),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Module docstring, shebang, leading comments or inner attributes.
    Header,
    Import,
    Declaration,
    /// Python `if __name__ == "__main__":` entry point.
    MainGuard,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    /// Declared name; for Rust `impl` blocks the normalized impl header.
    pub name: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Outline {
    pub language: Language,
    pub blocks: Vec<Block>,
}

impl Outline {
    pub fn parse(language: Language, source: &str) -> Self {
        let lines: Vec<&str> = source.lines().collect();
        let blocks = match language {
            Language::Python => parse_python(&lines),
            Language::Rust => parse_rust(&lines),
        };
        Self { language, blocks }
    }

    pub fn of_kind(&self, kind: BlockKind) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(move |b| b.kind == kind)
    }

    pub fn declaration_names(&self) -> Vec<String> {
        self.of_kind(BlockKind::Declaration)
            .filter_map(|b| b.name.clone())
            .collect()
    }
}

/// Tracks bracket depth and open string literals across lines.
#[derive(Debug, Default)]
struct Scanner {
    depth: i32,
    opened: bool,
    triple: Option<&'static str>,
}

impl Scanner {
    fn busy(&self) -> bool {
        self.depth > 0 || self.triple.is_some()
    }

    fn feed_python(&mut self, line: &str) {
        let bytes = line.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if let Some(delim) = self.triple {
                if bytes[i..].starts_with(delim.as_bytes()) {
                    self.triple = None;
                    i += 3;
                } else {
                    i += 1;
                }
                continue;
            }
            let rest = &bytes[i..];
            if rest.starts_with(b"\"\"\"") {
                self.triple = Some("\"\"\"");
                i += 3;
                continue;
            }
            if rest.starts_with(b"'''") {
                self.triple = Some("'''");
                i += 3;
                continue;
            }
            match bytes[i] {
                b'#' => break,
                q @ (b'"' | b'\'') => {
                    i += 1;
                    while i < bytes.len() && bytes[i] != q {
                        if bytes[i] == b'\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                }
                b'(' | b'[' | b'{' => {
                    self.depth += 1;
                    self.opened = true;
                }
                b')' | b']' | b'}' => self.depth -= 1,
                _ => {}
            }
            i += 1;
        }
    }

    fn feed_rust(&mut self, line: &str) {
        let bytes = line.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'/' if bytes.get(i + 1) == Some(&b'/') => break,
                b'"' => {
                    i += 1;
                    while i < bytes.len() && bytes[i] != b'"' {
                        if bytes[i] == b'\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                }
                b'\'' if bytes.get(i + 2) == Some(&b'\'') => i += 2,
                b'{' => {
                    self.depth += 1;
                    self.opened = true;
                }
                b'}' => self.depth -= 1,
                _ => {}
            }
            i += 1;
        }
    }
}

fn is_indented(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t')
}

fn ident_after<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(keyword)?.trim_start();
    let end = rest
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

fn finish(kind: BlockKind, name: Option<String>, mut lines: Vec<&str>) -> Block {
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    Block {
        kind,
        name,
        text: lines.join("\n"),
    }
}

fn parse_python(lines: &[&str]) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut i = 0;

    let mut header = Vec::new();
    while i < lines.len() && lines[i].trim().is_empty() {
        i += 1;
    }
    while i < lines.len() && lines[i].starts_with('#') {
        header.push(lines[i]);
        i += 1;
    }
    if i < lines.len() {
        let t = lines[i].trim_start_matches(['r', 'u', 'R', 'U']);
        if t.starts_with("\"\"\"") || t.starts_with("'''") {
            let mut scanner = Scanner::default();
            scanner.feed_python(lines[i]);
            header.push(lines[i]);
            i += 1;
            while scanner.triple.is_some() && i < lines.len() {
                scanner.feed_python(lines[i]);
                header.push(lines[i]);
                i += 1;
            }
        }
    }
    if !header.is_empty() {
        blocks.push(finish(BlockKind::Header, None, header));
    }

    let mut pending: Vec<&str> = Vec::new();
    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();
        if trimmed.is_empty() {
            i += 1;
            continue;
        }
        if trimmed.starts_with('@') || (trimmed.starts_with('#') && !is_indented(line)) {
            pending.push(line);
            i += 1;
            continue;
        }

        let (kind, name) = if trimmed.starts_with("import ")
            || (trimmed.starts_with("from ") && trimmed.contains(" import "))
        {
            (BlockKind::Import, None)
        } else if let Some(n) = ident_after(trimmed, "def ")
            .or_else(|| ident_after(trimmed, "async def "))
            .or_else(|| ident_after(trimmed, "class "))
        {
            (BlockKind::Declaration, Some(n.to_string()))
        } else if trimmed.starts_with("if __name__") {
            (BlockKind::MainGuard, None)
        } else {
            (BlockKind::Other, None)
        };

        let mut scanner = Scanner::default();
        let mut body = std::mem::take(&mut pending);
        body.push(line);
        scanner.feed_python(line);
        let continues_backslash = |l: &str| l.trim_end().ends_with('\\');
        let mut j = i + 1;
        let mut prev = line;
        while j < lines.len() {
            let next = lines[j];
            let compound = matches!(kind, BlockKind::Other | BlockKind::MainGuard)
                && ["else:", "elif ", "except", "finally:"]
                    .iter()
                    .any(|k| next.starts_with(k));
            let take = scanner.busy()
                || continues_backslash(prev)
                || (kind != BlockKind::Import
                    && (next.trim().is_empty() || is_indented(next) || compound));
            if !take {
                break;
            }
            scanner.feed_python(next);
            body.push(next);
            prev = next;
            j += 1;
        }
        blocks.push(finish(kind, name, body));
        i = j;
    }

    if !pending.is_empty() {
        blocks.push(finish(BlockKind::Other, None, pending));
    }
    blocks
}

const RUST_ITEM_KEYWORDS: [&str; 11] = [
    "fn ", "struct ", "enum ", "trait ", "impl", "mod ", "const ", "static ", "type ", "union ",
    "macro_rules!",
];

fn strip_rust_qualifiers(mut text: &str) -> &str {
    loop {
        let before = text;
        if let Some(rest) = text.strip_prefix("pub(") {
            text = rest.split_once(')').map(|(_, r)| r).unwrap_or(rest).trim_start();
        } else {
            for q in ["pub ", "async ", "unsafe ", "extern \"C\" ", "default "] {
                if let Some(rest) = text.strip_prefix(q) {
                    text = rest.trim_start();
                }
            }
            if text.starts_with("const fn ") {
                text = &text[6..];
            }
        }
        if text == before {
            return text;
        }
    }
}

fn rust_item_name(trimmed: &str) -> Option<String> {
    let item = strip_rust_qualifiers(trimmed);
    let keyword = RUST_ITEM_KEYWORDS
        .iter()
        .find(|k| item.starts_with(*k))?;
    if *keyword == "impl" {
        if !(item.starts_with("impl ") || item.starts_with("impl<")) {
            return None;
        }
        let head = item.split(['{', ';']).next().unwrap_or(item);
        let head = head.split(" where").next().unwrap_or(head);
        return Some(head.split_whitespace().collect::<Vec<_>>().join(" "));
    }
    if *keyword == "macro_rules!" {
        return ident_after(item, "macro_rules!").map(|n| format!("{}!", n));
    }
    ident_after(item, keyword.trim_end()).map(str::to_string)
}

fn parse_rust(lines: &[&str]) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut i = 0;

    let mut header = Vec::new();
    while i < lines.len() {
        let t = lines[i].trim();
        if t.starts_with("//!") || t.starts_with("#![") || (t.is_empty() && !header.is_empty()) {
            header.push(lines[i]);
            i += 1;
        } else if t.is_empty() {
            i += 1;
        } else {
            break;
        }
    }
    if !header.is_empty() {
        blocks.push(finish(BlockKind::Header, None, header));
    }

    let mut pending: Vec<&str> = Vec::new();
    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();
        if trimmed.is_empty() {
            i += 1;
            continue;
        }
        if trimmed.starts_with("//") {
            pending.push(line);
            i += 1;
            continue;
        }
        if trimmed.starts_with("#[") {
            let mut depth = 0i32;
            let mut j = i;
            while j < lines.len() {
                depth += lines[j].matches('[').count() as i32 - lines[j].matches(']').count() as i32;
                pending.push(lines[j]);
                j += 1;
                if depth <= 0 {
                    break;
                }
            }
            i = j;
            continue;
        }

        let stripped = strip_rust_qualifiers(trimmed);
        let (kind, name) = if stripped.starts_with("use ") || stripped.starts_with("extern crate ") {
            (BlockKind::Import, None)
        } else if let Some(n) = rust_item_name(trimmed) {
            (BlockKind::Declaration, Some(n))
        } else {
            (BlockKind::Other, None)
        };

        let mut scanner = Scanner::default();
        let mut body = std::mem::take(&mut pending);
        let mut j = i;
        while j < lines.len() {
            let current = lines[j];
            scanner.feed_rust(current);
            body.push(current);
            j += 1;
            let t = current.trim_end();
            if scanner.depth <= 0 && (scanner.opened || t.ends_with(';')) {
                break;
            }
        }
        blocks.push(finish(kind, name, body));
        i = j;
    }

    if !pending.is_empty() {
        blocks.push(finish(BlockKind::Other, None, pending));
    }
    blocks
}
