//! Symbol extraction via tree-sitter, with a paragraph splitter for everything else.

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tree_sitter::{Node, Parser, Tree};

use crate::languages::{Grammar, LanguageEntry, TEXT_LANGUAGE, Tier};

/// Default cap for a Tier-2 chunk, in characters.
pub const DEFAULT_TEXT_CHUNK_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Function,
    Class,
    Method,
    Paragraph,
}

impl ChunkKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Method => "method",
            Self::Paragraph => "paragraph",
        }
    }

    /// Function or method: a body that can contain calls.
    #[must_use]
    pub fn is_callable(self) -> bool {
        matches!(self, Self::Function | Self::Method)
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkKind {
    type Err = crate::error::IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "function" => Ok(Self::Function),
            "class" => Ok(Self::Class),
            "method" => Ok(Self::Method),
            "paragraph" => Ok(Self::Paragraph),
            other => Err(crate::error::IndexError::Parse(format!(
                "unknown chunk kind: {other}"
            ))),
        }
    }
}

/// One indexed unit of source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub file_path: String,
    pub language: String,
    pub kind: ChunkKind,
    /// `Owner.method` for methods, the bare name otherwise.
    pub name: String,
    /// Enclosing definitions, outermost first, joined by ` > `.
    pub scope: String,
    pub start_byte: usize,
    pub end_byte: usize,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub content_hash: String,
}

impl Chunk {
    /// `path::name`, the form used in dependency chains.
    #[must_use]
    pub fn qualified(&self) -> String {
        format!("{}::{}", self.file_path, self.name)
    }

    /// Owner of a method (`Greeter` for `Greeter.hello`).
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        if self.kind == ChunkKind::Method {
            self.name.rsplit_once('.').map(|(owner, _)| owner)
        } else {
            None
        }
    }

    /// Trailing segment of the display name.
    #[must_use]
    pub fn short_name(&self) -> &str {
        self.name.rsplit_once('.').map_or(&self.name, |(_, n)| n)
    }
}

/// Result of extracting one file.
#[derive(Debug)]
pub struct Extraction {
    /// Tier actually used.
    pub tier: Tier,
    /// Tier-1 language whose parse failed or contained errors.
    pub degraded: bool,
    pub chunks: Vec<Chunk>,
    /// Top-level import statements, one per line.
    pub imports: String,
    /// Syntax tree, kept for call extraction on clean Tier-1 parses.
    pub tree: Option<Tree>,
}

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Maximum size of a paragraph chunk in characters (default: 2000).
    pub text_chunk_max_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            text_chunk_max_chars: DEFAULT_TEXT_CHUNK_MAX_CHARS,
        }
    }
}

/// Deterministic chunk id: UUIDv5 over `path\0name\0start_byte`.
#[must_use]
pub fn chunk_id(path: &str, name: &str, start_byte: usize) -> String {
    let key = format!("{path}\0{name}\0{start_byte}");
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

pub(crate) fn blake3_hex(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Parse `source` with the entry's grammar.
///
/// Returns `None` when no grammar is compiled in or tree-sitter gives up.
#[must_use]
pub fn parse(entry: &LanguageEntry, source: &str) -> Option<Tree> {
    let language = entry.language.as_ref()?;
    let mut parser = Parser::new();
    parser.set_language(language).ok()?;
    parser.parse(source, None)
}

/// Extract chunks from one file. Never fails: anything that cannot be parsed
/// cleanly is split into paragraphs.
#[must_use]
pub fn extract(
    entry: Option<&LanguageEntry>,
    path: &str,
    source: &str,
    config: &ChunkerConfig,
) -> Extraction {
    let Some(entry) = entry else {
        return paragraphs(TEXT_LANGUAGE, path, source, config, false);
    };
    let Some(grammar) = entry.grammar.as_ref().filter(|_| entry.tier() == Tier::One) else {
        return paragraphs(entry.id, path, source, config, false);
    };

    let Some(tree) = parse(entry, source) else {
        tracing::warn!(file = %path, language = entry.id, "parse failed, splitting into paragraphs");
        return paragraphs(entry.id, path, source, config, true);
    };
    let root = tree.root_node();
    if root.has_error() {
        tracing::warn!(file = %path, language = entry.id, "syntax errors, splitting into paragraphs");
        return paragraphs(entry.id, path, source, config, true);
    }

    let ctx = WalkCtx {
        source,
        path,
        language: entry.id,
        grammar,
    };
    let mut scopes = Vec::new();
    let mut chunks = Vec::new();
    walk(&ctx, root, &mut scopes, &mut chunks);
    let mut seen = HashSet::new();
    chunks.retain(|c| seen.insert(c.id.clone()));

    if chunks.is_empty() {
        tracing::debug!(file = %path, "no definitions found, splitting into paragraphs");
        let mut extraction = paragraphs(entry.id, path, source, config, false);
        extraction.imports = extract_imports(source, root, grammar);
        return extraction;
    }

    Extraction {
        tier: Tier::One,
        degraded: false,
        imports: extract_imports(source, root, grammar),
        chunks,
        tree: Some(tree),
    }
}

#[derive(Debug, Clone)]
enum Scope {
    Class(String),
    Function(String),
}

impl Scope {
    fn name(&self) -> &str {
        match self {
            Self::Class(n) | Self::Function(n) => n,
        }
    }
}

struct WalkCtx<'a> {
    source: &'a str,
    path: &'a str,
    language: &'a str,
    grammar: &'a Grammar,
}

impl WalkCtx<'_> {
    fn chunk(&self, node: Node<'_>, kind: ChunkKind, name: String, scopes: &[Scope]) -> Chunk {
        let text = self.source[node.byte_range()].to_string();
        Chunk {
            id: chunk_id(self.path, &name, node.start_byte()),
            file_path: self.path.to_string(),
            language: self.language.to_string(),
            kind,
            scope: scopes.iter().map(Scope::name).collect::<Vec<_>>().join(" > "),
            start_byte: node.start_byte(),
            end_byte: node.end_byte(),
            start_line: node.start_position().row + 1,
            end_line: node.end_position().row + 1,
            content_hash: blake3_hex(&text),
            text,
            name,
        }
    }
}

fn walk(ctx: &WalkCtx<'_>, node: Node<'_>, scopes: &mut Vec<Scope>, out: &mut Vec<Chunk>) {
    let g = ctx.grammar;
    let child_count = u32::try_from(node.named_child_count()).unwrap_or(u32::MAX);
    for i in 0..child_count {
        let Some(child) = node.named_child(i) else {
            continue;
        };
        let kind = child.kind();

        if g.classes.contains(&kind) {
            if let Some(name) = node_name(child, ctx) {
                out.push(ctx.chunk(child, ChunkKind::Class, name.clone(), scopes));
                scopes.push(Scope::Class(name));
                walk(ctx, child, scopes, out);
                scopes.pop();
            } else {
                walk(ctx, child, scopes, out);
            }
        } else if g.functions.contains(&kind) || g.methods.contains(&kind) {
            let Some(name) = node_name(child, ctx) else {
                walk(ctx, child, scopes, out);
                continue;
            };
            let owner = receiver_type(child, ctx).or_else(|| match scopes.last() {
                Some(Scope::Class(owner)) => Some(owner.clone()),
                _ => None,
            });
            let (chunk_kind, display) = match owner {
                Some(owner) => (ChunkKind::Method, format!("{owner}.{name}")),
                None if g.methods.contains(&kind) => (ChunkKind::Method, name.clone()),
                None => (ChunkKind::Function, name.clone()),
            };
            out.push(ctx.chunk(child, chunk_kind, display, scopes));
            scopes.push(Scope::Function(name));
            walk(ctx, child, scopes, out);
            scopes.pop();
        } else if g.bindings.contains(&kind)
            && let Some(value) = child.child_by_field_name("value")
            && g.lambdas.contains(&value.kind())
            && let Some(name) = child
                .child_by_field_name("name")
                .filter(|n| g.identifiers.contains(&n.kind()))
                .map(|n| ctx.source[n.byte_range()].to_string())
        {
            out.push(ctx.chunk(child, ChunkKind::Function, name.clone(), scopes));
            scopes.push(Scope::Function(name));
            walk(ctx, value, scopes, out);
            scopes.pop();
        } else {
            walk(ctx, child, scopes, out);
        }
    }
}

/// Name of a definition: its `name` field, or the base type of its `type`
/// field (Rust `impl` blocks).
fn node_name(node: Node<'_>, ctx: &WalkCtx<'_>) -> Option<String> {
    if let Some(name) = node.child_by_field_name("name") {
        let text = ctx.source[name.byte_range()].trim();
        return (!text.is_empty()).then(|| text.to_string());
    }
    let ty = node.child_by_field_name("type")?;
    let base = first_type_identifier(ty, ctx.grammar).unwrap_or(ty);
    let text = ctx.source[base.byte_range()].trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Go-style receiver: `func (s *Server) Start()` is owned by `Server`.
fn receiver_type(node: Node<'_>, ctx: &WalkCtx<'_>) -> Option<String> {
    let receiver = node.child_by_field_name("receiver")?;
    let ty = first_type_identifier(receiver, ctx.grammar)?;
    Some(ctx.source[ty.byte_range()].to_string())
}

fn first_type_identifier<'t>(node: Node<'t>, grammar: &Grammar) -> Option<Node<'t>> {
    if grammar.type_identifiers.contains(&node.kind()) {
        return Some(node);
    }
    let child_count = u32::try_from(node.named_child_count()).unwrap_or(u32::MAX);
    (0..child_count)
        .filter_map(|i| node.named_child(i))
        .find_map(|c| first_type_identifier(c, grammar))
}

fn extract_imports(source: &str, root: Node<'_>, grammar: &Grammar) -> String {
    let mut imports = String::new();
    let child_count = u32::try_from(root.named_child_count()).unwrap_or(u32::MAX);
    for i in 0..child_count {
        let Some(child) = root.named_child(i) else {
            continue;
        };
        if grammar.imports.contains(&child.kind()) {
            imports.push_str(&source[child.byte_range()]);
            imports.push('\n');
        }
    }
    imports
}

fn paragraphs(
    language: &str,
    path: &str,
    source: &str,
    config: &ChunkerConfig,
    degraded: bool,
) -> Extraction {
    let chunks = split_text(source, config.text_chunk_max_chars)
        .into_iter()
        .map(|range| paragraph_chunk(language, path, source, range))
        .collect();
    Extraction {
        tier: Tier::Two,
        degraded,
        chunks,
        imports: String::new(),
        tree: None,
    }
}

fn paragraph_chunk(language: &str, path: &str, source: &str, range: Range<usize>) -> Chunk {
    let text = source[range.clone()].to_string();
    let start_line = line_at(source, range.start);
    let end_line = start_line + text.trim_end_matches('\n').matches('\n').count();
    let name = format!("lines {start_line}-{end_line}");
    Chunk {
        id: chunk_id(path, &name, range.start),
        file_path: path.to_string(),
        language: language.to_string(),
        kind: ChunkKind::Paragraph,
        scope: String::new(),
        start_byte: range.start,
        end_byte: range.end,
        start_line,
        end_line,
        content_hash: blake3_hex(&text),
        text,
        name,
    }
}

/// 1-based line containing byte `offset`.
pub(crate) fn line_at(source: &str, offset: usize) -> usize {
    source.as_bytes()[..offset.min(source.len())]
        .iter()
        .filter(|&&b| b == b'\n')
        .count()
        + 1
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split text into byte ranges of at most `max_chars` characters, preferring
/// blank-line boundaries, then line boundaries, then char boundaries.
///
/// Whitespace-only input yields nothing; input under the cap is one range.
#[must_use]
pub fn split_text(source: &str, max_chars: usize) -> Vec<Range<usize>> {
    let max = max_chars.max(1);
    if source.trim().is_empty() {
        return Vec::new();
    }
    if char_len(source) <= max {
        return vec![0..source.len()];
    }

    let mut pieces = Vec::new();
    for para in blank_line_paragraphs(source) {
        if char_len(&source[para.clone()]) <= max {
            pieces.push(para);
        } else {
            split_lines(source, para, max, &mut pieces);
        }
    }

    let mut out: Vec<Range<usize>> = Vec::new();
    for piece in pieces {
        if let Some(last) = out.last_mut()
            && char_len(&source[last.start..piece.end]) <= max
        {
            last.end = piece.end;
        } else {
            out.push(piece);
        }
    }
    out.retain(|r| !source[r.clone()].trim().is_empty());
    out
}

fn blank_line_paragraphs(source: &str) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    let mut end = 0;
    let mut offset = 0;
    for line in source.split_inclusive('\n') {
        if line.trim().is_empty() {
            if let Some(s) = start.take() {
                out.push(s..end);
            }
        } else {
            start.get_or_insert(offset);
            end = offset + line.trim_end_matches(['\n', '\r']).len();
        }
        offset += line.len();
    }
    if let Some(s) = start {
        out.push(s..end);
    }
    out
}

fn split_lines(source: &str, range: Range<usize>, max: usize, out: &mut Vec<Range<usize>>) {
    let mut offset = range.start;
    for line in source[range].split_inclusive('\n') {
        let line_range = offset..offset + line.len();
        offset = line_range.end;
        if char_len(line) <= max {
            out.push(line_range);
            continue;
        }
        let mut piece_start = line_range.start;
        let mut n = 0;
        for (i, _) in line.char_indices() {
            if n == max {
                out.push(piece_start..line_range.start + i);
                piece_start = line_range.start + i;
                n = 0;
            }
            n += 1;
        }
        if piece_start < line_range.end {
            out.push(piece_start..line_range.end);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::languages::GrammarRegistry;

    fn extract_as(lang: &str, path: &str, source: &str) -> Extraction {
        let registry = GrammarRegistry::builtin();
        extract(registry.get(lang), path, source, &ChunkerConfig::default())
    }

    fn names(e: &Extraction) -> Vec<&str> {
        e.chunks.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn chunk_id_is_deterministic_uuid() {
        let a = chunk_id("a.py", "foo", 10);
        assert_eq!(a, chunk_id("a.py", "foo", 10));
        assert_ne!(a, chunk_id("a.py", "foo", 11));
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn kind_parse_roundtrip() {
        for kind in [
            ChunkKind::Function,
            ChunkKind::Class,
            ChunkKind::Method,
            ChunkKind::Paragraph,
        ] {
            assert_eq!(kind.as_str().parse::<ChunkKind>().unwrap(), kind);
        }
        assert!("module".parse::<ChunkKind>().is_err());
    }

    #[cfg(feature = "lang-python")]
    #[test]
    fn python_class_and_methods() {
        let source = "\
import os
from pkg import helper as h

class Greeter:
    def hello(self):
        print('hello')

    def goodbye(self):
        print('bye')

def main():
    Greeter().hello()
";
        let e = extract_as("python", "app.py", source);
        assert_eq!(e.tier, Tier::One);
        assert!(!e.degraded);
        assert_eq!(
            names(&e),
            vec!["Greeter", "Greeter.hello", "Greeter.goodbye", "main"]
        );
        let hello = &e.chunks[1];
        assert_eq!(hello.kind, ChunkKind::Method);
        assert_eq!(hello.scope, "Greeter");
        assert_eq!(hello.start_line, 5);
        assert_eq!(hello.end_line, 6);
        assert!(hello.text.starts_with("def hello"));
        assert!(e.imports.contains("import os"));
        assert!(e.imports.contains("from pkg import helper as h"));
        assert!(e.tree.is_some());
    }

    #[cfg(feature = "lang-python")]
    #[test]
    fn python_nested_function_yields_both() {
        let source = "def outer():\n    def inner():\n        return 1\n    return inner()\n";
        let e = extract_as("python", "n.py", source);
        assert_eq!(names(&e), vec!["outer", "inner"]);
        assert_eq!(e.chunks[1].kind, ChunkKind::Function);
        assert_eq!(e.chunks[1].scope, "outer");
    }

    #[cfg(feature = "lang-python")]
    #[test]
    fn python_syntax_error_degrades() {
        let source = "def broken(:\n    pass\n\nx = 1\n";
        let e = extract_as("python", "bad.py", source);
        assert_eq!(e.tier, Tier::Two);
        assert!(e.degraded);
        assert!(!e.chunks.is_empty());
        assert!(e.chunks.iter().all(|c| c.kind == ChunkKind::Paragraph));
        assert_eq!(e.chunks[0].language, "python");
    }

    #[cfg(feature = "lang-python")]
    #[test]
    fn python_without_definitions_falls_back() {
        let e = extract_as("python", "settings.py", "DEBUG = True\nNAME = 'x'\n");
        assert_eq!(e.tier, Tier::Two);
        assert!(!e.degraded);
        assert_eq!(e.chunks.len(), 1);
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn rust_impl_methods_are_owned() {
        let source = r"
struct Foo;

impl<T> Display for Foo<T> {
    fn fmt(&self) {}
}

impl Foo {
    fn bar(&self) -> i32 { 42 }
}

fn free() {}
";
        let e = extract_as("rust", "src/foo.rs", source);
        let n = names(&e);
        assert!(n.contains(&"Foo.fmt"), "{n:?}");
        assert!(n.contains(&"Foo.bar"), "{n:?}");
        assert!(n.contains(&"free"), "{n:?}");
        let bar = e.chunks.iter().find(|c| c.name == "Foo.bar").unwrap();
        assert_eq!(bar.kind, ChunkKind::Method);
        assert_eq!(bar.owner(), Some("Foo"));
        assert_eq!(bar.short_name(), "bar");
    }

    #[cfg(feature = "lang-go")]
    #[test]
    fn go_receiver_owns_method() {
        let source = "package main\n\ntype Server struct{}\n\nfunc (s *Server) Start() {}\n\nfunc main() {}\n";
        let e = extract_as("go", "main.go", source);
        let n = names(&e);
        assert!(n.contains(&"Server"), "{n:?}");
        assert!(n.contains(&"Server.Start"), "{n:?}");
        assert!(n.contains(&"main"), "{n:?}");
    }

    #[cfg(feature = "lang-js")]
    #[test]
    fn js_arrow_binding_and_export() {
        let source = "\
export const handler = (req) => { return process(req); };
export function process(x) { return x; }
class Api {
  fetch() { return 1; }
}
";
        let e = extract_as("javascript", "api.js", source);
        let n = names(&e);
        assert!(n.contains(&"handler"), "{n:?}");
        assert!(n.contains(&"process"), "{n:?}");
        assert!(n.contains(&"Api"), "{n:?}");
        assert!(n.contains(&"Api.fetch"), "{n:?}");
    }

    #[cfg(feature = "lang-java")]
    #[test]
    fn java_methods_and_constructor() {
        let source = "class Box {\n  Box() {}\n  int size() { return 0; }\n}\n";
        let e = extract_as("java", "Box.java", source);
        assert_eq!(names(&e), vec!["Box", "Box.Box", "Box.size"]);
    }

    #[cfg(feature = "lang-bash")]
    #[test]
    fn bash_functions() {
        let e = extract_as("bash", "run.sh", "build() {\n  make all\n}\n\nbuild\n");
        assert_eq!(names(&e), vec!["build"]);
    }

    #[test]
    fn text_file_is_single_chunk_under_cap() {
        let e = extract(None, "README.md", "# Title\n\nSome text.\n", &ChunkerConfig::default());
        assert_eq!(e.tier, Tier::Two);
        assert_eq!(e.chunks.len(), 1);
        assert_eq!(e.chunks[0].language, TEXT_LANGUAGE);
        assert_eq!(e.chunks[0].start_line, 1);
        assert_eq!(e.chunks[0].end_line, 3);
    }

    #[test]
    fn empty_text_has_no_chunks() {
        let e = extract(None, "empty.txt", "  \n\n", &ChunkerConfig::default());
        assert!(e.chunks.is_empty());
    }

    #[test]
    fn paragraphs_split_at_blank_lines() {
        let config = ChunkerConfig {
            text_chunk_max_chars: 12,
        };
        let e = extract(None, "notes.txt", "first para\n\nsecond one\n\nthird\n", &config);
        let texts: Vec<_> = e.chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["first para", "second one", "third"]);
        assert_eq!(e.chunks[1].start_line, 3);
        assert_eq!(e.chunks[2].start_line, 5);
    }

    #[test]
    fn long_line_split_at_char_boundaries() {
        let line = "é".repeat(25);
        let ranges = split_text(&line, 10);
        assert_eq!(ranges.len(), 3);
        for r in &ranges {
            assert!(line[r.clone()].chars().count() <= 10);
        }
    }

    #[test]
    fn line_at_counts_newlines() {
        let s = "a\nb\nc";
        assert_eq!(line_at(s, 0), 1);
        assert_eq!(line_at(s, 2), 2);
        assert_eq!(line_at(s, 4), 3);
    }

    proptest! {
        #[test]
        fn split_text_respects_cap_and_covers_content(
            source in "[a-z \\n]{0,400}",
            max in 1usize..60,
        ) {
            let ranges = split_text(&source, max);
            let mut prev_end = 0;
            for r in &ranges {
                prop_assert!(r.start >= prev_end);
                prop_assert!(source[r.clone()].chars().count() <= max);
                prev_end = r.end;
            }
            for (i, c) in source.char_indices() {
                if !c.is_whitespace() {
                    prop_assert!(ranges.iter().any(|r| r.contains(&i)));
                }
            }
        }
    }
}
