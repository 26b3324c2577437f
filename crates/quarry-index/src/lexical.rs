//! BM25 lexical index over identifier-aware tokens.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::chunker::ChunkId;

/// BM25 tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Split text into lowercase search terms.
///
/// Every identifier is emitted whole, followed by its `snake_case` and
/// `camelCase` parts when it has more than one, so `parseHttpRequest`
/// matches queries for `parse`, `http` and `request` as well as the full name.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for ident in text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
    {
        let whole = ident.to_lowercase();
        let parts = split_identifier(ident);
        if parts.len() > 1 {
            out.push(whole);
            out.extend(parts.into_iter().map(str::to_lowercase));
        } else if !whole.trim_matches('_').is_empty() {
            out.push(whole.trim_matches('_').to_string());
        }
    }
    out
}

fn split_identifier(ident: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    for piece in ident.split('_').filter(|p| !p.is_empty()) {
        let chars: Vec<(usize, char)> = piece.char_indices().collect();
        let mut start = 0;
        for i in 1..chars.len() {
            let (idx, c) = chars[i];
            let prev = chars[i - 1].1;
            let next_lower = chars.get(i + 1).is_some_and(|(_, n)| n.is_lowercase());
            let boundary = c.is_uppercase()
                && (prev.is_lowercase()
                    || prev.is_ascii_digit()
                    || (prev.is_uppercase() && next_lower));
            if boundary {
                parts.push(&piece[start..idx]);
                start = idx;
            }
        }
        parts.push(&piece[start..]);
    }
    parts
}

/// Inverted index with per-document lengths and global statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LexicalIndex {
    params: Bm25Params,
    postings: BTreeMap<String, BTreeMap<ChunkId, u32>>,
    doc_lens: BTreeMap<ChunkId, u32>,
    /// Distinct terms of each document, so removal touches only its postings.
    #[serde(default)]
    doc_terms: BTreeMap<ChunkId, Vec<String>>,
    total_len: u64,
}

impl LexicalIndex {
    #[must_use]
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn params(&self) -> Bm25Params {
        self.params
    }

    /// Replace the tuning parameters. Postings are parameter-independent.
    pub fn set_params(&mut self, params: Bm25Params) {
        self.params = params;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.doc_lens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.doc_lens.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.doc_lens.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ChunkId> {
        self.doc_lens.keys()
    }

    /// Index `tokens` under `id`, replacing any previous document.
    pub fn add(&mut self, id: &ChunkId, tokens: &[String]) {
        self.remove(id);
        let mut freqs: BTreeMap<&str, u32> = BTreeMap::new();
        for t in tokens {
            *freqs.entry(t.as_str()).or_default() += 1;
        }
        let mut terms = Vec::with_capacity(freqs.len());
        for (term, tf) in freqs {
            self.postings
                .entry(term.to_string())
                .or_default()
                .insert(id.clone(), tf);
            terms.push(term.to_string());
        }
        let len = u32::try_from(tokens.len()).unwrap_or(u32::MAX);
        self.doc_lens.insert(id.clone(), len);
        self.doc_terms.insert(id.clone(), terms);
        self.total_len += u64::from(len);
    }

    /// Drop `id` and every posting that references it.
    pub fn remove(&mut self, id: &ChunkId) -> bool {
        let Some(len) = self.doc_lens.remove(id) else {
            return false;
        };
        self.total_len -= u64::from(len);
        let Some(terms) = self.doc_terms.remove(id) else {
            // Checkpoints written without term lists need a full sweep.
            self.postings.retain(|_, docs| {
                docs.remove(id);
                !docs.is_empty()
            });
            return true;
        };
        for term in terms {
            if let Some(docs) = self.postings.get_mut(&term) {
                docs.remove(id);
                if docs.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        true
    }

    /// BM25 score of every document sharing at least one query term, sorted
    /// by score descending then id ascending.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&self, query_tokens: &[String]) -> Vec<(ChunkId, f32)> {
        if self.doc_lens.is_empty() {
            return Vec::new();
        }
        let n = self.doc_lens.len() as f32;
        let avgdl = (self.total_len as f32 / n).max(1.0);
        let Bm25Params { k1, b } = self.params;

        let terms: BTreeSet<&str> = query_tokens.iter().map(String::as_str).collect();
        let mut scores: BTreeMap<&ChunkId, f32> = BTreeMap::new();
        for term in terms {
            let Some(docs) = self.postings.get(term) else {
                continue;
            };
            let df = docs.len() as f32;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
            for (id, &tf) in docs {
                let tf = tf as f32;
                let len = self.doc_lens.get(id).copied().unwrap_or(0) as f32;
                let norm = k1 * (1.0 - b + b * len / avgdl);
                *scores.entry(id).or_default() += idf * tf * (k1 + 1.0) / (tf + norm);
            }
        }

        let mut ranked: Vec<(ChunkId, f32)> =
            scores.into_iter().map(|(id, s)| (id.clone(), s)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn id(n: u32) -> ChunkId {
        ChunkId::derive("t.rs", n as usize, n as usize, "h")
    }

    #[test]
    fn tokenize_splits_identifiers() {
        assert_eq!(
            tokenize("parseHttpRequest(buf)"),
            vec!["parsehttprequest", "parse", "http", "request", "buf"]
        );
        assert_eq!(tokenize("max_file_bytes"), vec![
            "max_file_bytes",
            "max",
            "file",
            "bytes"
        ]);
        assert_eq!(tokenize("HTTPServer"), vec!["httpserver", "http", "server"]);
    }

    #[test]
    fn tokenize_punctuation_only() {
        assert!(tokenize("(){};").is_empty());
        assert!(tokenize("__").is_empty());
    }

    #[test]
    fn tokenize_plain_word() {
        assert_eq!(tokenize("function foo(){}"), vec!["function", "foo"]);
    }

    #[test]
    fn matching_documents_are_scored() {
        let mut idx = LexicalIndex::default();
        idx.add(&id(1), &tokenize("function foo(){}"));
        idx.add(&id(2), &tokenize("function bar(){}"));
        let hits = idx.score(&tokenize("foo"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, id(1));
        assert!(hits[0].1 > 0.0);
    }

    #[test]
    fn rarer_terms_weigh_more() {
        let mut idx = LexicalIndex::default();
        idx.add(&id(1), &tokenize("common rare"));
        idx.add(&id(2), &tokenize("common other"));
        idx.add(&id(3), &tokenize("common thing"));
        let hits = idx.score(&tokenize("common rare"));
        assert_eq!(hits[0].0, id(1));
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn ties_break_by_id() {
        let mut idx = LexicalIndex::default();
        idx.add(&id(2), &tokenize("same"));
        idx.add(&id(1), &tokenize("same"));
        let hits = idx.score(&tokenize("same"));
        let expected = {
            let mut v = vec![id(1), id(2)];
            v.sort();
            v
        };
        assert_eq!(hits.iter().map(|h| h.0.clone()).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn remove_drops_postings() {
        let mut idx = LexicalIndex::default();
        idx.add(&id(1), &tokenize("alpha beta"));
        assert!(idx.remove(&id(1)));
        assert!(!idx.remove(&id(1)));
        assert!(idx.is_empty());
        assert!(idx.score(&tokenize("alpha")).is_empty());
        assert_eq!(idx, LexicalIndex::default());
    }

    #[test]
    fn remove_keeps_postings_of_other_documents() {
        let mut idx = LexicalIndex::default();
        idx.add(&id(1), &tokenize("shared alpha"));
        idx.add(&id(2), &tokenize("shared beta"));
        idx.remove(&id(1));

        assert!(!idx.postings.contains_key("alpha"));
        assert_eq!(idx.postings["shared"].len(), 1);
        assert_eq!(idx.score(&tokenize("shared"))[0].0, id(2));
        assert_eq!(idx.doc_terms.keys().collect::<Vec<_>>(), vec![&id(2)]);
    }

    #[test]
    fn remove_without_term_list_sweeps_postings() {
        let mut idx = LexicalIndex::default();
        idx.add(&id(1), &tokenize("alpha"));
        idx.add(&id(2), &tokenize("alpha beta"));
        idx.doc_terms.clear();

        assert!(idx.remove(&id(2)));
        assert!(!idx.postings.contains_key("beta"));
        assert_eq!(idx.postings["alpha"].len(), 1);
    }

    #[test]
    fn add_replaces_existing_document() {
        let mut idx = LexicalIndex::default();
        idx.add(&id(1), &tokenize("old"));
        idx.add(&id(1), &tokenize("new"));
        assert_eq!(idx.len(), 1);
        assert!(idx.score(&tokenize("old")).is_empty());
        assert_eq!(idx.score(&tokenize("new")).len(), 1);
    }

    #[test]
    fn empty_index_scores_nothing() {
        assert!(LexicalIndex::default().score(&tokenize("x")).is_empty());
    }

    proptest! {
        #[test]
        fn tokens_are_lowercase_and_nonempty(text in "\\PC{0,64}") {
            for t in tokenize(&text) {
                prop_assert!(!t.is_empty());
                prop_assert_eq!(t.clone(), t.to_lowercase());
            }
        }

        #[test]
        fn add_then_remove_restores_index(a in "[a-z ]{1,40}", b in "[a-z ]{1,40}") {
            let mut idx = LexicalIndex::default();
            idx.add(&id(1), &tokenize(&a));
            let before = idx.clone();
            idx.add(&id(2), &tokenize(&b));
            idx.remove(&id(2));
            prop_assert_eq!(idx, before);
        }

        #[test]
        fn scores_are_positive(docs in proptest::collection::vec("[a-c]{1,3}( [a-c]{1,3}){0,5}", 1..8), q in "[a-c]{1,3}") {
            let mut idx = LexicalIndex::default();
            for (i, d) in docs.iter().enumerate() {
                idx.add(&id(u32::try_from(i).unwrap()), &tokenize(d));
            }
            for (_, s) in idx.score(&tokenize(&q)) {
                prop_assert!(s > 0.0);
            }
        }
    }
}
