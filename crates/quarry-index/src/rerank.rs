//! Second-pass reranking of fused candidates.

use std::collections::BTreeSet;

use crate::chunker::Chunk;
use crate::entity::query_identifiers;
use crate::lexical::tokenize;

/// Re-scores a candidate against the query. Higher is better.
pub trait Reranker: Send + Sync {
    fn score(&self, query: &str, chunk: &Chunk) -> f32;
}

/// Scores query-term coverage over the full chunk text, plus bonuses for an
/// exact phrase occurrence and for a declared-name match.
#[derive(Debug, Default, Clone, Copy)]
pub struct OverlapReranker;

const PHRASE_BONUS: f32 = 0.5;
const NAME_BONUS: f32 = 0.5;

impl Reranker for OverlapReranker {
    #[allow(clippy::cast_precision_loss)]
    fn score(&self, query: &str, chunk: &Chunk) -> f32 {
        let terms: BTreeSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() {
            return 0.0;
        }
        let doc: BTreeSet<String> = tokenize(&chunk.text).into_iter().collect();
        let covered = terms.iter().filter(|t| doc.contains(*t)).count();
        let mut score = covered as f32 / terms.len() as f32;

        let phrase = query.trim().to_lowercase();
        if phrase.contains(char::is_whitespace) && chunk.text.to_lowercase().contains(&phrase) {
            score += PHRASE_BONUS;
        }
        if let Some(name) = &chunk.name
            && query_identifiers(query).contains(&name.as_str())
        {
            score += NAME_BONUS;
        }
        score
    }
}
