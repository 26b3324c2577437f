//! Text handed to embedding models and headers shown with results.
//!
//! The embedding text carries the file path, kind and language ahead of the
//! code. It never includes line numbers, so a chunk that only moved within
//! its file embeds to the same text and may reuse its vector.

use crate::chunker::Chunk;

/// Generate text optimized for embedding (not for display).
#[must_use]
pub fn embedding_text(chunk: &Chunk) -> String {
    let mut text = String::with_capacity(chunk.text.len() + 128);

    text.push_str("# ");
    text.push_str(&chunk.file_path);
    text.push('\n');

    text.push_str("# ");
    text.push_str(chunk.chunk_type.as_str());
    if let Some(name) = &chunk.name {
        text.push(' ');
        text.push_str(name);
    }
    text.push('\n');

    if let Some(lang) = chunk.language {
        text.push_str("# Language: ");
        text.push_str(lang.id());
        text.push('\n');
    }

    text.push_str(&chunk.text);
    text
}

/// Short header for display in retrieved results.
#[must_use]
pub fn display_header(
    file_path: &str,
    name: Option<&str>,
    kind: &str,
    start_line: usize,
    end_line: usize,
) -> String {
    let name = name.unwrap_or(kind);
    format!("{file_path} :: {name} (lines {start_line}-{end_line})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::chunk_file;
    use crate::languages::{ChunkType, Lang};

    fn sample() -> Chunk {
        let mut chunk = chunk_file("src/lib.rs", "fn hello() { 42 }", None)
            .pop()
            .unwrap();
        chunk.chunk_type = ChunkType::Function;
        chunk.name = Some("hello".into());
        chunk.language = Some(Lang::Rust);
        chunk
    }

    #[test]
    fn embedding_text_has_header_and_code() {
        let text = embedding_text(&sample());
        assert!(text.starts_with("# src/lib.rs\n"));
        assert!(text.contains("# function hello\n"));
        assert!(text.contains("# Language: rust\n"));
        assert!(text.ends_with("fn hello() { 42 }"));
    }

    #[test]
    fn embedding_text_ignores_line_numbers() {
        let a = sample();
        let mut b = a.clone();
        b.start_line += 10;
        b.end_line += 10;
        assert_eq!(embedding_text(&a), embedding_text(&b));
    }

    #[test]
    fn header_falls_back_to_kind() {
        assert_eq!(
            display_header("a.rs", None, "block", 1, 4),
            "a.rs :: block (lines 1-4)"
        );
        assert_eq!(
            display_header("a.rs", Some("main"), "function", 2, 2),
            "a.rs :: main (lines 2-2)"
        );
    }
}
