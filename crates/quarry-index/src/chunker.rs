//! AST-based chunking via tree-sitter.
//!
//! Every node whose grammar kind appears in the language table becomes a
//! chunk linked to its nearest enclosing chunk. Runs of uncovered top-level
//! code become `block` chunks. Anything that cannot be parsed, or a language
//! without a table, degrades to one `file` chunk.

use serde::{Deserialize, Serialize};
use tree_sitter::{Node, Parser};

use crate::error::{IndexError, Result};
use crate::languages::{CONSTRUCTOR_NAMES, ChunkType, DESTRUCTOR_NAMES, Lang, NAME_FIELDS};

/// Stable identifier of a chunk within a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    /// Derive an id from a chunk's byte span and content hash. Identical
    /// constructs on one line still get distinct ids.
    #[must_use]
    pub fn derive(file_path: &str, start_byte: usize, end_byte: usize, content_hash: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(file_path.as_bytes());
        hasher.update(&[0]);
        hasher.update(&start_byte.to_le_bytes());
        hasher.update(&end_byte.to_le_bytes());
        hasher.update(content_hash.as_bytes());
        let hex = hasher.finalize().to_hex();
        Self(hex[..32].to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One contiguous, named span of a source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub file_path: String,
    pub language: Option<Lang>,
    pub chunk_type: ChunkType,
    pub name: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub start_byte: usize,
    pub end_byte: usize,
    pub content_hash: String,
    pub text: String,
    pub parent_chunk_id: Option<ChunkId>,
    /// Set at embedding time when the text exceeded the model's budget.
    #[serde(default)]
    pub truncated: bool,
}

struct Span {
    chunk_type: ChunkType,
    name: Option<String>,
    start_byte: usize,
    end_byte: usize,
    start_line: usize,
    end_line: usize,
    parent: Option<usize>,
}

struct ChunkCtx<'a> {
    source: &'a str,
    lang: Lang,
}

/// Chunk one file. Pure and deterministic: identical input yields identical
/// spans, names, hashes and ids.
#[must_use]
pub fn chunk_file(file_path: &str, source: &str, lang: Option<Lang>) -> Vec<Chunk> {
    if non_ws_len(source) == 0 {
        return Vec::new();
    }
    let Some(lang) = lang else {
        return vec![file_chunk(file_path, source, None)];
    };

    match chunk_syntax(file_path, source, lang) {
        Ok(chunks) if !chunks.is_empty() => chunks,
        Ok(_) => vec![file_chunk(file_path, source, Some(lang))],
        Err(e) => {
            tracing::debug!(file = file_path, "whole-file fallback: {e}");
            vec![file_chunk(file_path, source, Some(lang))]
        }
    }
}

fn chunk_syntax(file_path: &str, source: &str, lang: Lang) -> Result<Vec<Chunk>> {
    if lang.chunk_kinds().is_empty() {
        return Ok(Vec::new());
    }
    let grammar = lang.grammar().ok_or(IndexError::UnsupportedLanguage)?;

    let mut parser = Parser::new();
    parser
        .set_language(&grammar)
        .map_err(|e| IndexError::Parse(format!("set_language failed: {e}")))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| IndexError::Parse(format!("parse failed for {file_path}")))?;

    let root = tree.root_node();
    let ctx = ChunkCtx { source, lang };
    let mut spans = Vec::new();
    collect_spans(&ctx, &root, None, None, &mut spans);

    if spans.is_empty() {
        return Ok(Vec::new());
    }

    let block_spans = uncovered_runs(&ctx, &root, &spans);
    Ok(materialize(file_path, source, lang, spans, block_spans))
}

fn collect_spans(
    ctx: &ChunkCtx<'_>,
    node: &Node,
    parent: Option<usize>,
    parent_type: Option<ChunkType>,
    out: &mut Vec<Span>,
) {
    let child_count = u32::try_from(node.named_child_count()).unwrap_or(u32::MAX);
    for i in 0..child_count {
        let Some(child) = node.named_child(i) else {
            continue;
        };
        match ctx.lang.chunk_type_of(child.kind()) {
            Some(base) => {
                let name = extract_name(&child, ctx.source);
                let chunk_type = refine_type(base, parent_type, name.as_deref());
                out.push(span_of(&child, chunk_type, name, parent));
                let idx = out.len() - 1;
                collect_spans(ctx, &child, Some(idx), Some(chunk_type), out);
            }
            None => collect_spans(ctx, &child, parent, parent_type, out),
        }
    }
}

fn span_of(node: &Node, chunk_type: ChunkType, name: Option<String>, parent: Option<usize>) -> Span {
    let start = node.start_position();
    let end = node.end_position();
    // A node ending at column 0 stops at the end of the previous line.
    let end_row = if end.column == 0 && end.row > start.row {
        end.row
    } else {
        end.row + 1
    };
    Span {
        chunk_type,
        name,
        start_byte: node.start_byte(),
        end_byte: node.end_byte(),
        start_line: start.row + 1,
        end_line: end_row,
        parent,
    }
}

fn refine_type(base: ChunkType, parent_type: Option<ChunkType>, name: Option<&str>) -> ChunkType {
    let in_container = parent_type.is_some_and(ChunkType::holds_methods);
    match base {
        ChunkType::Function | ChunkType::Method if in_container => match name {
            Some(n) if CONSTRUCTOR_NAMES.contains(&n) => ChunkType::Constructor,
            Some(n) if DESTRUCTOR_NAMES.contains(&n) => ChunkType::Destructor,
            _ => ChunkType::Method,
        },
        other => other,
    }
}

fn extract_name(node: &Node, source: &str) -> Option<String> {
    NAME_FIELDS
        .iter()
        .find_map(|field| node.child_by_field_name(field))
        .map(|n| {
            let text = &source[n.byte_range()];
            // `impl<T> Foo<T>` is named `Foo`.
            text.split('<').next().unwrap_or(text).trim().to_string()
        })
        .filter(|n| !n.is_empty())
}

/// Top-level named children that neither are nor contain a chunk, grouped
/// into contiguous runs.
fn uncovered_runs(ctx: &ChunkCtx<'_>, root: &Node, spans: &[Span]) -> Vec<Span> {
    let mut runs = Vec::new();
    let mut run: Option<(Node, Node)> = None;

    let child_count = u32::try_from(root.named_child_count()).unwrap_or(u32::MAX);
    for i in 0..child_count {
        let Some(child) = root.named_child(i) else {
            continue;
        };
        let covered = spans
            .iter()
            .any(|s| s.start_byte >= child.start_byte() && s.end_byte <= child.end_byte());
        if covered {
            if let Some((first, last)) = run.take() {
                runs.extend(block_span(ctx, &first, &last));
            }
        } else {
            run = Some(match run {
                Some((first, _)) => (first, child),
                None => (child, child),
            });
        }
    }
    if let Some((first, last)) = run {
        runs.extend(block_span(ctx, &first, &last));
    }
    runs
}

fn block_span(ctx: &ChunkCtx<'_>, first: &Node, last: &Node) -> Option<Span> {
    let text = &ctx.source[first.start_byte()..last.end_byte()];
    if non_ws_len(text) == 0 {
        return None;
    }
    let head = span_of(first, ChunkType::Block, None, None);
    let tail = span_of(last, ChunkType::Block, None, None);
    Some(Span {
        end_byte: tail.end_byte,
        end_line: tail.end_line,
        ..head
    })
}

fn materialize(
    file_path: &str,
    source: &str,
    lang: Lang,
    spans: Vec<Span>,
    blocks: Vec<Span>,
) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::with_capacity(spans.len() + blocks.len());
    // Parents precede children in `spans`, so their ids already exist.
    for span in spans.into_iter().chain(blocks) {
        let parent_chunk_id = span.parent.map(|p| chunks[p].chunk_id.clone());
        chunks.push(build_chunk(file_path, source, Some(lang), span, parent_chunk_id));
    }
    chunks.sort_by(|a, b| {
        a.start_byte
            .cmp(&b.start_byte)
            .then(b.end_byte.cmp(&a.end_byte))
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    // A node spanning exactly its parent's range yields the same id.
    chunks.dedup_by(|a, b| a.chunk_id == b.chunk_id);
    chunks
}

fn build_chunk(
    file_path: &str,
    source: &str,
    language: Option<Lang>,
    span: Span,
    parent_chunk_id: Option<ChunkId>,
) -> Chunk {
    let text = source[span.start_byte..span.end_byte].to_string();
    let content_hash = blake3_hex(&text);
    Chunk {
        chunk_id: ChunkId::derive(file_path, span.start_byte, span.end_byte, &content_hash),
        file_path: file_path.to_string(),
        language,
        chunk_type: span.chunk_type,
        name: span.name,
        start_line: span.start_line,
        end_line: span.end_line,
        start_byte: span.start_byte,
        end_byte: span.end_byte,
        content_hash,
        text,
        parent_chunk_id,
        truncated: false,
    }
}

fn file_chunk(file_path: &str, source: &str, language: Option<Lang>) -> Chunk {
    let lines = source.lines().count().max(1);
    let name = file_path
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    build_chunk(
        file_path,
        source,
        language,
        Span {
            chunk_type: ChunkType::File,
            name,
            start_byte: 0,
            end_byte: source.len(),
            start_line: 1,
            end_line: lines,
            parent: None,
        },
        None,
    )
}

fn non_ws_len(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

pub(crate) fn blake3_hex(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_name<'a>(chunks: &'a [Chunk], name: &str) -> &'a Chunk {
        chunks
            .iter()
            .find(|c| c.name.as_deref() == Some(name))
            .unwrap_or_else(|| panic!("no chunk named {name}"))
    }

    #[test]
    fn unknown_language_is_one_file_chunk() {
        let chunks = chunk_file("a.src", "function foo(){}", None);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_type, ChunkType::File);
        assert_eq!(chunks[0].name.as_deref(), Some("a.src"));
        assert_eq!(chunks[0].text, "function foo(){}");
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 1));
    }

    #[test]
    fn blank_text_has_no_chunks() {
        assert!(chunk_file("a.rs", "  \n\n", Some(Lang::Rust)).is_empty());
        assert!(chunk_file("a.src", "", None).is_empty());
    }

    #[test]
    fn config_language_is_file_chunk() {
        let source = "[package]\nname = \"test\"\n";
        let chunks = chunk_file("Cargo.toml", source, Some(Lang::Toml));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_type, ChunkType::File);
        assert_eq!(chunks[0].language, Some(Lang::Toml));
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn rust_functions_are_chunks() {
        let source = "fn alpha() {\n    1;\n}\n\nfn beta() {}\n";
        let chunks = chunk_file("src/lib.rs", source, Some(Lang::Rust));
        assert_eq!(chunks.len(), 2);
        let alpha = by_name(&chunks, "alpha");
        assert_eq!(alpha.chunk_type, ChunkType::Function);
        assert_eq!((alpha.start_line, alpha.end_line), (1, 3));
        assert!(alpha.parent_chunk_id.is_none());
        let beta = by_name(&chunks, "beta");
        assert_eq!((beta.start_line, beta.end_line), (5, 5));
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn impl_methods_link_to_parent() {
        let source = r"
struct Foo;

impl Foo {
    fn new() -> Self {
        Foo
    }
    fn bar(&self) -> i32 {
        42
    }
}
";
        let chunks = chunk_file("src/foo.rs", source, Some(Lang::Rust));
        let imp = chunks
            .iter()
            .find(|c| c.chunk_type == ChunkType::Impl)
            .unwrap();
        assert_eq!(imp.name.as_deref(), Some("Foo"));

        let new = by_name(&chunks, "new");
        assert_eq!(new.chunk_type, ChunkType::Constructor);
        assert_eq!(new.parent_chunk_id.as_ref(), Some(&imp.chunk_id));

        let bar = by_name(&chunks, "bar");
        assert_eq!(bar.chunk_type, ChunkType::Method);
        assert_eq!(bar.parent_chunk_id.as_ref(), Some(&imp.chunk_id));
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn generic_impl_name_strips_parameters() {
        let source = "impl<T> Wrapper<T> {\n    fn get(&self) {}\n}\n";
        let chunks = chunk_file("src/w.rs", source, Some(Lang::Rust));
        let imp = chunks
            .iter()
            .find(|c| c.chunk_type == ChunkType::Impl)
            .unwrap();
        assert_eq!(imp.name.as_deref(), Some("Wrapper"));
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn uncovered_top_level_code_becomes_block() {
        let source = "use std::io;\nuse std::path::Path;\n\nfn main() {}\n";
        let chunks = chunk_file("src/main.rs", source, Some(Lang::Rust));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_type, ChunkType::Block);
        assert!(chunks[0].text.contains("use std::io;"));
        assert!(chunks[0].text.contains("use std::path::Path;"));
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 2));
        assert_eq!(chunks[1].name.as_deref(), Some("main"));
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn top_level_chunks_do_not_overlap() {
        let source = r#"
use std::fmt;

// helper
const LIMIT: usize = 3;

struct Point { x: i32 }

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.x)
    }
}

fn free() {}
"#;
        let chunks = chunk_file("src/p.rs", source, Some(Lang::Rust));
        let top: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| c.parent_chunk_id.is_none())
            .collect();
        for w in top.windows(2) {
            assert!(w[0].end_byte <= w[1].start_byte, "{w:?}");
        }
        assert!(chunks.iter().any(|c| c.chunk_type == ChunkType::Variable));
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn chunking_is_deterministic() {
        let source = "fn test() { 42 }\nstruct S;\n";
        let a = chunk_file("a.rs", source, Some(Lang::Rust));
        let b = chunk_file("a.rs", source, Some(Lang::Rust));
        assert_eq!(a, b);
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn editing_one_function_keeps_sibling_id() {
        let before = "fn keep() {\n    1;\n}\n\nfn edit() {\n    2;\n}\n";
        let after = "fn keep() {\n    1;\n}\n\nfn edit() {\n    3;\n}\n";
        let a = chunk_file("src/x.rs", before, Some(Lang::Rust));
        let b = chunk_file("src/x.rs", after, Some(Lang::Rust));
        assert_eq!(by_name(&a, "keep").chunk_id, by_name(&b, "keep").chunk_id);
        assert_ne!(by_name(&a, "edit").chunk_id, by_name(&b, "edit").chunk_id);
    }

    #[cfg(feature = "lang-python")]
    #[test]
    fn python_class_methods() {
        let source = r#"
class Greeter:
    def __init__(self):
        self.name = "x"

    def hello(self):
        print("hello")

def helper():
    pass
"#;
        let chunks = chunk_file("app.py", source, Some(Lang::Python));
        let class = by_name(&chunks, "Greeter");
        assert_eq!(class.chunk_type, ChunkType::Class);
        let init = by_name(&chunks, "__init__");
        assert_eq!(init.chunk_type, ChunkType::Constructor);
        assert_eq!(init.parent_chunk_id.as_ref(), Some(&class.chunk_id));
        assert_eq!(by_name(&chunks, "hello").chunk_type, ChunkType::Method);
        assert_eq!(by_name(&chunks, "helper").chunk_type, ChunkType::Function);
    }

    #[cfg(feature = "lang-js")]
    #[test]
    fn typescript_interface_and_class() {
        let source = r"
interface Shape {
  area(): number;
}

class Square implements Shape {
  constructor(private side: number) {}
  area(): number { return this.side * this.side; }
}
";
        let chunks = chunk_file("shape.ts", source, Some(Lang::TypeScript));
        assert_eq!(by_name(&chunks, "Shape").chunk_type, ChunkType::Interface);
        assert_eq!(by_name(&chunks, "Square").chunk_type, ChunkType::Class);
        assert_eq!(
            by_name(&chunks, "constructor").chunk_type,
            ChunkType::Constructor
        );
        assert_eq!(by_name(&chunks, "area").chunk_type, ChunkType::Method);
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn identical_items_on_one_line_keep_distinct_ids() {
        let source = "fn twin() {} fn twin() {}\n";
        let chunks = chunk_file("min.rs", source, Some(Lang::Rust));
        let twins: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| c.name.as_deref() == Some("twin"))
            .collect();
        assert_eq!(twins.len(), 2);
        assert_eq!(twins[0].content_hash, twins[1].content_hash);
        assert_eq!(twins[0].start_line, twins[1].start_line);
        assert_ne!(twins[0].chunk_id, twins[1].chunk_id);

        let mut ids: Vec<&ChunkId> = chunks.iter().map(|c| &c.chunk_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), chunks.len());
    }

    #[test]
    fn chunk_id_depends_on_every_component() {
        let base = ChunkId::derive("a.rs", 1, 3, "h");
        assert_eq!(base, ChunkId::derive("a.rs", 1, 3, "h"));
        assert_ne!(base, ChunkId::derive("b.rs", 1, 3, "h"));
        assert_ne!(base, ChunkId::derive("a.rs", 2, 3, "h"));
        assert_ne!(base, ChunkId::derive("a.rs", 1, 3, "g"));
        assert_eq!(base.as_str().len(), 32);
    }

    #[test]
    fn non_ws_len_counts_correctly() {
        assert_eq!(non_ws_len("fn  foo () { }"), 9);
        assert_eq!(non_ws_len(""), 0);
        assert_eq!(non_ws_len("   "), 0);
    }
}
