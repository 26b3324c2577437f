//! In-memory HNSW vector index, one per embedding model.
//!
//! Vectors are L2-normalised on insert so inner product equals cosine
//! similarity. Removal marks a tombstone; the graph is rebuilt from live
//! vectors once tombstones outnumber live nodes. Only `(id, vector)` pairs
//! are persisted, and node levels derive from the chunk id, so a reload
//! reproduces the same graph.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashSet};

use serde::{Deserialize, Serialize};

use crate::chunker::ChunkId;
use crate::error::{IndexError, Result};

/// Below this many live vectors search scans exhaustively.
const EXACT_SCAN_MAX: usize = 512;
const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    id: ChunkId,
    vector: Vec<f32>,
    links: Vec<Vec<usize>>,
    deleted: bool,
}

#[derive(Debug, Clone, Copy)]
struct Scored {
    sim: f32,
    idx: usize,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sim
            .total_cmp(&other.sim)
            .then_with(|| other.idx.cmp(&self.idx))
    }
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    model_key: String,
    dimension: usize,
    params: HnswParams,
    nodes: Vec<Node>,
    by_id: BTreeMap<ChunkId, usize>,
    entry: Option<usize>,
    max_level: usize,
    tombstones: usize,
}

impl VectorIndex {
    #[must_use]
    pub fn new(model_key: impl Into<String>, dimension: usize, params: HnswParams) -> Self {
        Self {
            model_key: model_key.into(),
            dimension,
            params: HnswParams {
                m: params.m.max(2),
                ef_construction: params.ef_construction.max(1),
                ef_search: params.ef_search.max(1),
            },
            nodes: Vec::new(),
            by_id: BTreeMap::new(),
            entry: None,
            max_level: 0,
            tombstones: 0,
        }
    }

    /// Rebuild an index from persisted entries, inserting in id order.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] if any entry has the wrong width.
    pub fn from_entries(
        model_key: impl Into<String>,
        dimension: usize,
        params: HnswParams,
        entries: Vec<(ChunkId, Vec<f32>)>,
    ) -> Result<Self> {
        let mut index = Self::new(model_key, dimension, params);
        let mut entries = entries;
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (id, vector) in entries {
            index.add(id, vector)?;
        }
        Ok(index)
    }

    #[must_use]
    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn params(&self) -> HnswParams {
        self.params
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ChunkId> {
        self.by_id.keys()
    }

    /// Stored (normalised) vector for `id`.
    #[must_use]
    pub fn get(&self, id: &ChunkId) -> Option<&[f32]> {
        self.by_id.get(id).map(|&i| self.nodes[i].vector.as_slice())
    }

    /// Live `(id, vector)` pairs in id order.
    #[must_use]
    pub fn entries(&self) -> Vec<(ChunkId, Vec<f32>)> {
        self.by_id
            .iter()
            .map(|(id, &i)| (id.clone(), self.nodes[i].vector.clone()))
            .collect()
    }

    /// Check that `vector` fits this index.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] on a width mismatch.
    pub fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() == self.dimension {
            Ok(())
        } else {
            Err(IndexError::DimensionMismatch {
                model: self.model_key.clone(),
                expected: self.dimension,
                actual: vector.len(),
            })
        }
    }

    /// Insert or replace the vector for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] if `vector` has the wrong width.
    pub fn add(&mut self, id: ChunkId, mut vector: Vec<f32>) -> Result<()> {
        self.check_dimension(&vector)?;
        normalize(&mut vector);
        self.remove(&id);

        let level = level_for(&id, self.params.m);
        let idx = self.nodes.len();
        self.nodes.push(Node {
            id: id.clone(),
            vector,
            links: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.by_id.insert(id, idx);

        let Some(mut ep) = self.entry else {
            self.entry = Some(idx);
            self.max_level = level;
            return Ok(());
        };

        let query = self.nodes[idx].vector.clone();
        for layer in (level + 1..=self.max_level).rev() {
            ep = self.greedy_closest(&query, ep, layer);
        }
        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates = self.search_layer(&query, &[ep], self.params.ef_construction, layer);
            let neighbours: Vec<usize> = candidates
                .iter()
                .filter(|c| c.idx != idx)
                .take(self.params.m)
                .map(|c| c.idx)
                .collect();
            for &n in &neighbours {
                self.nodes[n].links[layer].push(idx);
                self.prune(n, layer);
            }
            self.nodes[idx].links[layer] = neighbours;
            if let Some(best) = candidates.first() {
                ep = best.idx;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry = Some(idx);
        }
        Ok(())
    }

    /// Tombstone `id`. Returns whether it was present.
    pub fn remove(&mut self, id: &ChunkId) -> bool {
        let Some(idx) = self.by_id.remove(id) else {
            return false;
        };
        self.nodes[idx].deleted = true;
        self.tombstones += 1;
        if self.tombstones > self.by_id.len() {
            self.rebuild();
        }
        true
    }

    /// Top `k` live vectors by cosine similarity, ties broken by id.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] if `query` has the wrong width.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(ChunkId, f32)>> {
        self.check_dimension(query)?;
        if k == 0 || self.by_id.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = query.to_vec();
        normalize(&mut query);

        let mut hits: Vec<(ChunkId, f32)> = if self.by_id.len() <= EXACT_SCAN_MAX {
            self.by_id
                .iter()
                .map(|(id, &i)| (id.clone(), dot(&query, &self.nodes[i].vector)))
                .collect()
        } else {
            self.search_graph(&query, k)
        };
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits)
    }

    fn search_graph(&self, query: &[f32], k: usize) -> Vec<(ChunkId, f32)> {
        let Some(mut ep) = self.entry else {
            return Vec::new();
        };
        for layer in (1..=self.max_level).rev() {
            ep = self.greedy_closest(query, ep, layer);
        }
        // Tombstoned nodes still occupy beam slots.
        let ef = self.params.ef_search.max(k) + self.tombstones;
        self.search_layer(query, &[ep], ef, 0)
            .into_iter()
            .filter(|c| !self.nodes[c.idx].deleted)
            .map(|c| (self.nodes[c.idx].id.clone(), c.sim))
            .collect()
    }

    fn greedy_closest(&self, query: &[f32], start: usize, layer: usize) -> usize {
        let mut best = start;
        let mut best_sim = dot(query, &self.nodes[start].vector);
        loop {
            let mut moved = false;
            for &n in self.links(best, layer) {
                let sim = dot(query, &self.nodes[n].vector);
                if sim > best_sim {
                    best = n;
                    best_sim = sim;
                    moved = true;
                }
            }
            if !moved {
                return best;
            }
        }
    }

    /// Beam search on one layer; returns candidates by similarity descending.
    fn search_layer(&self, query: &[f32], entry: &[usize], ef: usize, layer: usize) -> Vec<Scored> {
        let mut visited: HashSet<usize> = entry.iter().copied().collect();
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();

        for &e in entry {
            let s = Scored {
                sim: dot(query, &self.nodes[e].vector),
                idx: e,
            };
            candidates.push(s);
            results.push(Reverse(s));
        }

        while let Some(current) = candidates.pop() {
            let worst = results.peek().map_or(f32::NEG_INFINITY, |r| r.0.sim);
            if results.len() >= ef && current.sim < worst {
                break;
            }
            for &n in self.links(current.idx, layer) {
                if !visited.insert(n) {
                    continue;
                }
                let sim = dot(query, &self.nodes[n].vector);
                let worst = results.peek().map_or(f32::NEG_INFINITY, |r| r.0.sim);
                if results.len() < ef || sim > worst {
                    let s = Scored { sim, idx: n };
                    candidates.push(s);
                    results.push(Reverse(s));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    fn links(&self, idx: usize, layer: usize) -> &[usize] {
        self.nodes[idx]
            .links
            .get(layer)
            .map_or(&[][..], Vec::as_slice)
    }

    fn prune(&mut self, idx: usize, layer: usize) {
        let max_conn = if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        };
        if self.nodes[idx].links[layer].len() <= max_conn {
            return;
        }
        let base = self.nodes[idx].vector.clone();
        let mut scored: Vec<Scored> = self.nodes[idx].links[layer]
            .iter()
            .map(|&n| Scored {
                sim: dot(&base, &self.nodes[n].vector),
                idx: n,
            })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.truncate(max_conn);
        self.nodes[idx].links[layer] = scored.into_iter().map(|s| s.idx).collect();
    }

    fn rebuild(&mut self) {
        let entries = self.entries();
        tracing::debug!(
            model = %self.model_key,
            live = entries.len(),
            tombstones = self.tombstones,
            "rebuilding vector graph"
        );
        let mut fresh = Self::new(self.model_key.clone(), self.dimension, self.params);
        for (id, vector) in entries {
            // Stored vectors already match the dimension.
            let _ = fresh.add(id, vector);
        }
        *self = fresh;
    }
}

fn level_for(id: &ChunkId, m: usize) -> usize {
    let hash = blake3::hash(id.as_str().as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[..8]);
    #[allow(clippy::cast_precision_loss)]
    let unit = (u64::from_le_bytes(head) >> 11) as f64 / (1u64 << 53) as f64;
    #[allow(clippy::cast_precision_loss)]
    let ml = 1.0 / (m as f64).ln();
    let level = (-(1.0 - unit).ln() * ml).floor();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let level = level as usize;
    level.min(MAX_LEVEL)
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
