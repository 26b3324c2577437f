//! Immutable index snapshots and the single write path that produces them.
//!
//! An [`IndexState`] pairs the lexical index, one vector index per model,
//! the entity index, chunk records and the manifest. It is never mutated
//! once published: a [`DualIndexWriter`] stages changes on a private copy
//! and `finish` hands back a new snapshot after checking that every store
//! holds exactly the manifest's chunk ids.

use std::collections::{BTreeMap, BTreeSet};

use crate::chunker::{Chunk, ChunkId};
use crate::entity::EntityIndex;
use crate::error::{IndexError, Result};
use crate::lexical::{Bm25Params, LexicalIndex, tokenize};
use crate::manifest::{Manifest, ManifestEntry};
use crate::vector::VectorIndex;

#[derive(Debug, Clone, Default)]
pub struct IndexState {
    version: u64,
    chunks: BTreeMap<ChunkId, Chunk>,
    lexical: LexicalIndex,
    vectors: BTreeMap<String, VectorIndex>,
    entities: EntityIndex,
    manifest: Manifest,
}

impl IndexState {
    /// Empty state with one vector store per given index.
    #[must_use]
    pub fn empty(bm25: Bm25Params, stores: Vec<VectorIndex>) -> Self {
        Self {
            lexical: LexicalIndex::new(bm25),
            vectors: stores
                .into_iter()
                .map(|s| (s.model_key().to_string(), s))
                .collect(),
            ..Self::default()
        }
    }

    /// Assemble a state from persisted parts, rebuilding the entity index.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Invariant`] if the parts disagree on chunk ids.
    pub fn from_parts(
        version: u64,
        chunks: Vec<Chunk>,
        lexical: LexicalIndex,
        vectors: Vec<VectorIndex>,
        manifest: Manifest,
    ) -> Result<Self> {
        let mut entities = EntityIndex::default();
        let chunks: BTreeMap<ChunkId, Chunk> = chunks
            .into_iter()
            .map(|c| {
                if let Some(name) = &c.name {
                    entities.add(name, &c.chunk_id);
                }
                (c.chunk_id.clone(), c)
            })
            .collect();
        let state = Self {
            version,
            chunks,
            lexical,
            vectors: vectors
                .into_iter()
                .map(|s| (s.model_key().to_string(), s))
                .collect(),
            entities,
            manifest,
        };
        state.check_invariant()?;
        Ok(state)
    }

    /// Generation number, bumped on every committed change.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn chunk(&self, id: &ChunkId) -> Option<&Chunk> {
        self.chunks.get(id)
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    #[must_use]
    pub fn lexical(&self) -> &LexicalIndex {
        &self.lexical
    }

    #[must_use]
    pub fn vector(&self, model_key: &str) -> Option<&VectorIndex> {
        self.vectors.get(model_key)
    }

    pub fn vector_stores(&self) -> impl Iterator<Item = &VectorIndex> {
        self.vectors.values()
    }

    /// Model keys that own a vector store, sorted.
    #[must_use]
    pub fn models(&self) -> Vec<String> {
        self.vectors.keys().cloned().collect()
    }

    #[must_use]
    pub fn entities(&self) -> &EntityIndex {
        &self.entities
    }

    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Mark `files` for re-scan after an interrupted batch. Runs before the
    /// state is published.
    pub(crate) fn invalidate_files(&mut self, files: &[String]) -> usize {
        files
            .iter()
            .filter(|f| self.manifest.invalidate(f))
            .count()
    }

    /// Verify that manifest, chunk records, lexical and every vector store
    /// hold the same id set.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Invariant`] describing the first disagreement.
    pub fn check_invariant(&self) -> Result<()> {
        let manifest: BTreeSet<&ChunkId> = self.manifest.chunk_ids();
        let records: BTreeSet<&ChunkId> = self.chunks.keys().collect();
        if manifest != records {
            return Err(IndexError::Invariant(format!(
                "manifest has {} ids, chunk records have {}",
                manifest.len(),
                records.len()
            )));
        }
        let lexical: BTreeSet<&ChunkId> = self.lexical.ids().collect();
        if lexical != records {
            return Err(IndexError::Invariant(format!(
                "lexical index has {} ids, chunk records have {}",
                lexical.len(),
                records.len()
            )));
        }
        for store in self.vectors.values() {
            let ids: BTreeSet<&ChunkId> = store.ids().collect();
            if ids != records {
                return Err(IndexError::Invariant(format!(
                    "vector store {} has {} ids, chunk records have {}",
                    store.model_key(),
                    ids.len(),
                    records.len()
                )));
            }
        }
        Ok(())
    }
}

/// The only mutation path for index state.
#[derive(Debug)]
pub struct DualIndexWriter {
    state: IndexState,
}

impl DualIndexWriter {
    /// Stage changes on a private copy of `base`.
    #[must_use]
    pub fn new(base: &IndexState) -> Self {
        Self {
            state: base.clone(),
        }
    }

    /// Staged view, including changes made so far.
    #[must_use]
    pub fn staged(&self) -> &IndexState {
        &self.state
    }

    /// Insert `chunk` into the chunk records, lexical index, entity index and
    /// every vector store. `vectors` must hold one vector per store, keyed by
    /// model. On error nothing is changed.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Invariant`] if a store's vector is missing or an
    /// unknown model is supplied, or [`IndexError::DimensionMismatch`] if a
    /// vector has the wrong width.
    pub fn add_chunk(&mut self, chunk: Chunk, vectors: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        for (model, store) in &self.state.vectors {
            let vector = vectors.get(model).ok_or_else(|| {
                IndexError::Invariant(format!(
                    "no {model} vector supplied for chunk {}",
                    chunk.chunk_id
                ))
            })?;
            store.check_dimension(vector)?;
        }
        if let Some(extra) = vectors.keys().find(|k| !self.state.vectors.contains_key(*k)) {
            return Err(IndexError::Invariant(format!(
                "vector supplied for model {extra} without a store"
            )));
        }

        self.remove_chunk(&chunk.chunk_id);
        let id = chunk.chunk_id.clone();
        for (model, store) in &mut self.state.vectors {
            if let Some(vector) = vectors.get(model) {
                store.add(id.clone(), vector.clone())?;
            }
        }
        self.state.lexical.add(&id, &tokenize(&chunk.text));
        if let Some(name) = &chunk.name {
            self.state.entities.add(name, &id);
        }
        self.state.chunks.insert(id, chunk);
        Ok(())
    }

    /// Remove `id` from every store. Returns whether it was present.
    pub fn remove_chunk(&mut self, id: &ChunkId) -> bool {
        let Some(chunk) = self.state.chunks.remove(id) else {
            return false;
        };
        self.state.lexical.remove(id);
        for store in self.state.vectors.values_mut() {
            store.remove(id);
        }
        if let Some(name) = &chunk.name {
            self.state.entities.remove(name, id);
        }
        true
    }

    /// Attach a vector store for a new model. It must cover exactly the
    /// current chunk ids.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Invariant`] if the store already exists or its
    /// ids differ from the chunk records.
    pub fn add_vector_store(&mut self, store: VectorIndex) -> Result<()> {
        let model = store.model_key().to_string();
        if self.state.vectors.contains_key(&model) {
            return Err(IndexError::Invariant(format!(
                "vector store for {model} already exists"
            )));
        }
        let ids: BTreeSet<&ChunkId> = store.ids().collect();
        let records: BTreeSet<&ChunkId> = self.state.chunks.keys().collect();
        if ids != records {
            return Err(IndexError::Invariant(format!(
                "new store for {model} covers {} of {} chunks",
                ids.len(),
                records.len()
            )));
        }
        self.state.vectors.insert(model, store);
        Ok(())
    }

    pub fn set_manifest_entry(&mut self, entry: ManifestEntry) {
        self.state.manifest.insert(entry);
    }

    pub fn remove_manifest_entry(&mut self, file_path: &str) -> Option<ManifestEntry> {
        self.state.manifest.remove(file_path)
    }

    /// Stored vector for `id` under `model`, if staged.
    #[must_use]
    pub fn vector_of(&self, model: &str, id: &ChunkId) -> Option<Vec<f32>> {
        self.state
            .vectors
            .get(model)
            .and_then(|s| s.get(id))
            .map(<[f32]>::to_vec)
    }

    /// Seal the staged state as the next version.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Invariant`] if the stores disagree on ids.
    pub fn finish(mut self) -> Result<IndexState> {
        self.state.check_invariant()?;
        self.state.version += 1;
        Ok(self.state)
    }
}
