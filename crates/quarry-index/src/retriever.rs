//! Lexical, dense and hybrid retrieval over an index snapshot.
//!
//! Hybrid fusion min-max normalises each candidate list onto
//! `[NORM_FLOOR, 1]` and sums the weighted scores; a chunk missing from one
//! list scores zero there. The floor keeps every retrieved candidate above
//! the ones a list did not return, so hybrid search with one weight at zero
//! ranks exactly like the remaining mode.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::str::FromStr;

use quarry_embed::EmbedderPool;
use serde::{Deserialize, Serialize};

use crate::chunker::{Chunk, ChunkId};
use crate::context::display_header;
use crate::dual::IndexState;
use crate::entity::query_identifiers;
use crate::error::{IndexError, Result};
use crate::languages::{ChunkType, Lang};
use crate::lexical::tokenize;
use crate::rerank::Reranker;

/// Lowest normalised score a retrieved candidate can receive.
pub const NORM_FLOOR: f32 = 0.01;

/// Lines of code shown per hit by [`format_hits`].
const PREVIEW_LINES: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Lexical,
    Dense,
    #[default]
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lexical" | "bm25" => Ok(Self::Lexical),
            "dense" | "semantic" => Ok(Self::Dense),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown search mode: {other}")),
        }
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Lexical => "lexical",
            Self::Dense => "dense",
            Self::Hybrid => "hybrid",
        })
    }
}

/// Parameters of one search call.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub mode: SearchMode,
    pub top_k: usize,
    pub bm25_weight: f32,
    pub dense_weight: f32,
    /// Boost chunks whose declared name appears in the query (hybrid only).
    pub entity_tracking: bool,
    pub entity_boost: f32,
    /// Each side contributes `top_k * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
    /// Rerank fused candidates (hybrid only).
    pub rerank: bool,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            mode: SearchMode::Hybrid,
            top_k: 10,
            bm25_weight: 0.4,
            dense_weight: 0.6,
            entity_tracking: true,
            entity_boost: 0.5,
            candidate_multiplier: 4,
            rerank: false,
        }
    }
}

impl SearchRequest {
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidTopK`] or [`IndexError::InvalidWeights`].
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(IndexError::InvalidTopK);
        }
        let weights = [self.bm25_weight, self.dense_weight, self.entity_boost];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(IndexError::InvalidWeights(format!(
                "bm25={} dense={} entity_boost={}",
                self.bm25_weight, self.dense_weight, self.entity_boost
            )));
        }
        if self.mode == SearchMode::Hybrid && self.bm25_weight == 0.0 && self.dense_weight == 0.0 {
            return Err(IndexError::InvalidWeights(
                "bm25 and dense weights are both zero".into(),
            ));
        }
        Ok(())
    }

    fn candidate_width(&self) -> usize {
        self.top_k
            .max(self.top_k.saturating_mul(self.candidate_multiplier))
    }
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub score: f32,
    pub file_path: String,
    pub language: Option<Lang>,
    pub chunk_type: ChunkType,
    pub name: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub parent_chunk_id: Option<ChunkId>,
    pub truncated: bool,
    pub text: String,
}

impl SearchHit {
    fn from_chunk(chunk: &Chunk, score: f32) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            score,
            file_path: chunk.file_path.clone(),
            language: chunk.language,
            chunk_type: chunk.chunk_type,
            name: chunk.name.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            parent_chunk_id: chunk.parent_chunk_id.clone(),
            truncated: chunk.truncated,
            text: chunk.text.clone(),
        }
    }
}

/// Run `query` against `state`, embedding it with `model` when the mode
/// needs dense scores.
///
/// # Errors
///
/// Returns a caller error for invalid requests, or an embedding error if
/// the model cannot be loaded.
pub async fn search(
    state: &IndexState,
    pool: &EmbedderPool,
    model: &str,
    query: &str,
    req: &SearchRequest,
    reranker: &dyn Reranker,
) -> Result<Vec<SearchHit>> {
    req.validate()?;
    if query.trim().is_empty() || state.is_empty() {
        return Ok(Vec::new());
    }

    let mut ranked = match req.mode {
        SearchMode::Lexical => lexical_candidates(state, query, req.candidate_width()),
        SearchMode::Dense => dense_candidates(state, pool, model, query, req.candidate_width()).await?,
        SearchMode::Hybrid => {
            let width = req.candidate_width();
            let lexical = lexical_candidates(state, query, width);
            let dense = dense_candidates(state, pool, model, query, width).await?;
            fuse(state, query, &lexical, &dense, req)
        }
    };

    // Lexical and dense results stay in their own score order.
    if req.rerank && req.mode == SearchMode::Hybrid {
        ranked.truncate(req.candidate_width());
        rerank(state, query, &mut ranked, reranker);
    }
    ranked.truncate(req.top_k);

    Ok(ranked
        .into_iter()
        .filter_map(|(id, score)| state.chunk(&id).map(|c| SearchHit::from_chunk(c, score)))
        .collect())
}

fn lexical_candidates(state: &IndexState, query: &str, n: usize) -> Vec<(ChunkId, f32)> {
    let mut hits = state.lexical().score(&tokenize(query));
    hits.truncate(n);
    hits
}

async fn dense_candidates(
    state: &IndexState,
    pool: &EmbedderPool,
    model: &str,
    query: &str,
    n: usize,
) -> Result<Vec<(ChunkId, f32)>> {
    let store = state
        .vector(model)
        .ok_or_else(|| IndexError::UnknownModel(model.to_string()))?;
    let embedding = pool
        .embed(model, vec![query.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| IndexError::Other("empty query embedding".into()))?;
    store.search(&embedding.vector, n)
}

/// Map scores onto `[NORM_FLOOR, 1]`; a list with one distinct value maps
/// to 1.0.
fn normalize(scores: &[(ChunkId, f32)]) -> HashMap<&ChunkId, f32> {
    let (min, max) = scores
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), (_, s)| {
            (lo.min(*s), hi.max(*s))
        });
    let span = max - min;
    scores
        .iter()
        .map(|(id, s)| {
            let norm = if span > f32::EPSILON {
                NORM_FLOOR + (1.0 - NORM_FLOOR) * (s - min) / span
            } else {
                1.0
            };
            (id, norm)
        })
        .collect()
}

fn fuse(
    state: &IndexState,
    query: &str,
    lexical: &[(ChunkId, f32)],
    dense: &[(ChunkId, f32)],
    req: &SearchRequest,
) -> Vec<(ChunkId, f32)> {
    let nb = normalize(lexical);
    let nd = normalize(dense);
    let raw_bm25: HashMap<&ChunkId, f32> = lexical.iter().map(|(id, s)| (id, *s)).collect();

    let mut combined: BTreeMap<ChunkId, f32> = BTreeMap::new();
    for (id, s) in &nb {
        *combined.entry((*id).clone()).or_default() += req.bm25_weight * s;
    }
    for (id, s) in &nd {
        *combined.entry((*id).clone()).or_default() += req.dense_weight * s;
    }

    if req.entity_tracking && req.entity_boost > 0.0 {
        for ident in query_identifiers(query) {
            for id in state.entities().lookup(ident) {
                *combined.entry(id.clone()).or_default() += req.entity_boost;
            }
        }
    }

    let mut ranked: Vec<(ChunkId, f32)> = combined.into_iter().collect();
    ranked.sort_by(|a, b| {
        let bm25_a = raw_bm25.get(&a.0).copied().unwrap_or(0.0);
        let bm25_b = raw_bm25.get(&b.0).copied().unwrap_or(0.0);
        b.1.total_cmp(&a.1)
            .then_with(|| bm25_b.total_cmp(&bm25_a))
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked
}

/// Re-score `ranked` in place; equal rerank scores keep the fused order.
fn rerank(state: &IndexState, query: &str, ranked: &mut Vec<(ChunkId, f32)>, reranker: &dyn Reranker) {
    let mut rescored: Vec<(ChunkId, f32)> = ranked
        .drain(..)
        .filter_map(|(id, _)| {
            let score = reranker.score(query, state.chunk(&id)?);
            Some((id, score))
        })
        .collect();
    rescored.sort_by(|a, b| b.1.total_cmp(&a.1));
    *ranked = rescored;
}

/// Render hits for terminal output.
#[must_use]
pub fn format_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "no results\n".to_string();
    }

    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        let header = display_header(
            &hit.file_path,
            hit.name.as_deref(),
            hit.chunk_type.as_str(),
            hit.start_line,
            hit.end_line,
        );
        let _ = writeln!(
            out,
            "{}. {header} [{}, score {:.3}]",
            i + 1,
            hit.chunk_type,
            hit.score
        );
        for line in hit.text.lines().take(PREVIEW_LINES) {
            let _ = writeln!(out, "    {line}");
        }
        if hit.text.lines().count() > PREVIEW_LINES {
            out.push_str("    ...\n");
        }
    }
    out
}
