//! Project registry: metadata, snapshots and model switching per project.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use quarry_embed::EmbedderPool;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, OnceCell};

use crate::context::embedding_text;
use crate::dual::{DualIndexWriter, IndexState};
use crate::error::{IndexError, Result};
use crate::lexical::Bm25Params;
use crate::storage::ProjectStore;
use crate::vector::{HnswParams, VectorIndex};

const SWITCH_EMBED_BATCH: usize = 64;

/// Persisted description of an indexed project (`project.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub project_path: PathBuf,
    pub project_hash: String,
    pub project_name: String,
    /// Active model used for dense queries.
    pub embedding_model: String,
    pub model_dimension: usize,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Every model that owns a vector store for this project.
    #[serde(default)]
    pub models: Vec<String>,
}

/// Stable short hash of a canonical project path.
#[must_use]
pub fn project_hash(canonical: &Path) -> String {
    let hex = blake3::hash(canonical.to_string_lossy().as_bytes()).to_hex();
    hex[..16].to_string()
}

/// Outcome of [`ProjectRegistry::switch_model`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwitchReport {
    pub model: String,
    pub dimension: usize,
    /// Chunks embedded to build a new store; zero when the store existed.
    pub embedded: usize,
}

/// One loaded project. Readers take `snapshot()`; writers hold the writer
/// lock for the whole batch and publish through `commit`.
#[derive(Debug)]
pub struct Project {
    root: PathBuf,
    store: ProjectStore,
    meta: RwLock<ProjectMetadata>,
    state: RwLock<Arc<IndexState>>,
    writer: Mutex<()>,
    recovered: Vec<String>,
}

impl Project {
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn hash(&self) -> String {
        self.metadata().project_hash
    }

    #[must_use]
    pub fn metadata(&self) -> ProjectMetadata {
        self.meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn active_model(&self) -> String {
        self.meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .embedding_model
            .clone()
    }

    /// Current committed state. The returned `Arc` stays valid across commits.
    #[must_use]
    pub fn snapshot(&self) -> Arc<IndexState> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Files whose entries were invalidated when an interrupted batch was
    /// found at load time.
    #[must_use]
    pub fn recovered_files(&self) -> &[String] {
        &self.recovered
    }

    /// Whether a reindex or model switch currently holds the writer lock.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.writer.try_lock().is_err()
    }

    pub(crate) fn store(&self) -> &ProjectStore {
        &self.store
    }

    pub(crate) async fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    pub(crate) fn try_lock_writer(&self) -> Result<MutexGuard<'_, ()>> {
        self.writer.try_lock().map_err(|_| IndexError::Busy)
    }

    /// Persist `state` and publish it. The caller holds the writer lock.
    pub(crate) async fn commit(
        &self,
        state: IndexState,
        active: Option<(String, usize)>,
    ) -> Result<Arc<IndexState>> {
        let state = Arc::new(state);
        let mut meta = self.metadata();
        meta.chunk_count = state.len();
        meta.models = state.models();
        meta.updated_at = Utc::now();
        if let Some((model, dimension)) = active {
            meta.embedding_model = model;
            meta.model_dimension = dimension;
        }

        let store = self.store.clone();
        let to_disk = Arc::clone(&state);
        let meta_disk = meta.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            store.save_checkpoint(&to_disk)?;
            store.save_metadata(&meta_disk)?;
            store.clear_journal()
        })
        .await
        .map_err(|e| IndexError::Other(format!("checkpoint task failed: {e}")))??;

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&state);
        *self.meta.write().unwrap_or_else(PoisonError::into_inner) = meta;
        Ok(state)
    }

    fn set_active_model(&self, model: &str, dimension: usize) -> Result<()> {
        let mut meta = self.metadata();
        meta.embedding_model = model.to_string();
        meta.model_dimension = dimension;
        meta.updated_at = Utc::now();
        self.store.save_metadata(&meta)?;
        *self.meta.write().unwrap_or_else(PoisonError::into_inner) = meta;
        Ok(())
    }
}

/// Settings shared by every project in a registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub data_dir: PathBuf,
    pub default_model: String,
    pub bm25: Bm25Params,
    pub hnsw: HnswParams,
}

type ProjectSlot = Arc<OnceCell<Arc<Project>>>;

/// Registry of projects keyed by canonical path.
///
/// The map lock only guards slot lookup. Loading a project happens inside
/// its own slot, so a slow load never delays other projects.
#[derive(Debug)]
pub struct ProjectRegistry {
    config: RegistryConfig,
    pool: Arc<EmbedderPool>,
    projects: Mutex<HashMap<PathBuf, ProjectSlot>>,
}

impl ProjectRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig, pool: Arc<EmbedderPool>) -> Self {
        Self {
            config,
            pool,
            projects: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<EmbedderPool> {
        &self.pool
    }

    /// Load a project, creating its metadata on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist, the default model is
    /// unknown, or project storage cannot be written.
    pub async fn create_or_load(&self, path: &Path) -> Result<Arc<Project>> {
        self.open(path, true).await
    }

    /// Load a project that was indexed before.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::UnknownProject`] if the project has no metadata.
    pub async fn get(&self, path: &Path) -> Result<Arc<Project>> {
        self.open(path, false).await
    }

    async fn open(&self, path: &Path, create: bool) -> Result<Arc<Project>> {
        let canonical = match std::fs::canonicalize(path) {
            Ok(p) => p,
            Err(_) if !create => {
                return Err(IndexError::UnknownProject(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let slot = Arc::clone(
            self.projects
                .lock()
                .await
                .entry(canonical.clone())
                .or_default(),
        );
        match slot.get_or_try_init(|| self.load(&canonical, create)).await {
            Ok(project) => Ok(Arc::clone(project)),
            Err(e) => {
                let mut projects = self.projects.lock().await;
                if projects
                    .get(&canonical)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && !s.initialized())
                {
                    projects.remove(&canonical);
                }
                Err(e)
            }
        }
    }

    async fn load(&self, canonical: &Path, create: bool) -> Result<Arc<Project>> {
        let hash = project_hash(canonical);
        let store = ProjectStore::new(&self.config.data_dir, &hash);
        let meta = match store.load_metadata() {
            Ok(Some(meta)) => meta,
            Ok(None) if create => self.new_metadata(canonical, &hash, &store).await?,
            Err(IndexError::Corrupt(msg)) if create => {
                tracing::warn!(project = %canonical.display(), "replacing corrupt metadata: {msg}");
                self.new_metadata(canonical, &hash, &store).await?
            }
            Ok(None) | Err(IndexError::Corrupt(_)) => {
                return Err(IndexError::UnknownProject(canonical.display().to_string()));
            }
            Err(e) => return Err(e),
        };

        let (bm25, hnsw) = (self.config.bm25, self.config.hnsw);
        let disk = store.clone();
        let (state, meta, recovered) =
            tokio::task::spawn_blocking(move || load_state(&disk, meta, bm25, hnsw))
                .await
                .map_err(|e| IndexError::Other(format!("project load task failed: {e}")))??;
        tracing::info!(
            project = %canonical.display(),
            hash = %hash,
            chunks = state.len(),
            model = %meta.embedding_model,
            "project loaded"
        );

        Ok(Arc::new(Project {
            root: canonical.to_path_buf(),
            store,
            meta: RwLock::new(meta),
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
            recovered,
        }))
    }

    async fn new_metadata(
        &self,
        canonical: &Path,
        hash: &str,
        store: &ProjectStore,
    ) -> Result<ProjectMetadata> {
        let model = self.config.default_model.clone();
        if !self.pool.is_known(&model) {
            return Err(IndexError::UnknownModel(model));
        }
        let dimension = self.pool.dimension(&model).await?;
        let now = Utc::now();
        let meta = ProjectMetadata {
            project_path: canonical.to_path_buf(),
            project_hash: hash.to_string(),
            project_name: canonical
                .file_name()
                .map_or_else(|| hash.to_string(), |n| n.to_string_lossy().to_string()),
            embedding_model: model.clone(),
            model_dimension: dimension,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
            models: vec![model],
        };
        store.save_metadata(&meta)?;
        Ok(meta)
    }

    /// Metadata of every project found under the data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory exists but cannot be read.
    pub fn list(&self) -> Result<Vec<ProjectMetadata>> {
        let entries = match std::fs::read_dir(&self.config.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let Some(hash) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match ProjectStore::new(&self.config.data_dir, &hash).load_metadata() {
                Ok(Some(meta)) => out.push(meta),
                Ok(None) => {}
                Err(e) => tracing::warn!(project = %hash, "skipping unreadable project: {e}"),
            }
        }
        out.sort_by(|a, b| a.project_path.cmp(&b.project_path));
        Ok(out)
    }

    /// Forget a project and delete its storage. Returns whether anything
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage directory cannot be removed.
    pub async fn remove(&self, path: &Path) -> Result<bool> {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let project = self
            .projects
            .lock()
            .await
            .remove(&canonical)
            .and_then(|slot| slot.get().cloned());
        let _guard = match &project {
            Some(p) => Some(p.lock_writer().await),
            None => None,
        };
        let store = ProjectStore::new(&self.config.data_dir, &project_hash(&canonical));
        let existed = project.is_some() || store.dir().exists();
        store.remove_all()?;
        if existed {
            tracing::info!(project = %canonical.display(), "project removed");
        }
        Ok(existed)
    }

    /// Make `model_key` the project's active model.
    ///
    /// An existing store for the key is reused as is. Otherwise every chunk
    /// record is embedded with the new model, without re-chunking, and the
    /// new store is committed next to the existing ones.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::UnknownModel`] for unregistered keys,
    /// [`IndexError::DimensionMismatch`] if the model's width disagrees with
    /// its existing store, or any embedding and persistence error.
    pub async fn switch_model(&self, project: &Project, model_key: &str) -> Result<SwitchReport> {
        if !self.pool.is_known(model_key) {
            return Err(IndexError::UnknownModel(model_key.to_string()));
        }
        let _guard = project.lock_writer().await;
        let dimension = self.pool.dimension(model_key).await?;
        let snapshot = project.snapshot();

        if let Some(store) = snapshot.vector(model_key) {
            if store.dimension() != dimension {
                return Err(IndexError::DimensionMismatch {
                    model: model_key.to_string(),
                    expected: store.dimension(),
                    actual: dimension,
                });
            }
            project.set_active_model(model_key, dimension)?;
            tracing::info!(model = model_key, "switched to existing vector store");
            return Ok(SwitchReport {
                model: model_key.to_string(),
                dimension,
                embedded: 0,
            });
        }

        let records: Vec<_> = snapshot.chunks().collect();
        let mut store = VectorIndex::new(model_key, dimension, self.config.hnsw);
        for batch in records.chunks(SWITCH_EMBED_BATCH) {
            let texts: Vec<String> = batch.iter().map(|c| embedding_text(c)).collect();
            let embeddings = self.pool.embed(model_key, texts).await?;
            for (chunk, embedding) in batch.iter().zip(embeddings) {
                store.add(chunk.chunk_id.clone(), embedding.vector)?;
            }
        }

        let mut writer = DualIndexWriter::new(&snapshot);
        writer.add_vector_store(store)?;
        let state = writer.finish()?;
        project
            .commit(state, Some((model_key.to_string(), dimension)))
            .await?;

        tracing::info!(
            model = model_key,
            dimension,
            embedded = records.len(),
            "built vector store for new model"
        );
        Ok(SwitchReport {
            model: model_key.to_string(),
            dimension,
            embedded: records.len(),
        })
    }
}

fn load_state(
    store: &ProjectStore,
    mut meta: ProjectMetadata,
    bm25: Bm25Params,
    hnsw: HnswParams,
) -> Result<(IndexState, ProjectMetadata, Vec<String>)> {
    if !meta.models.contains(&meta.embedding_model) {
        meta.models.push(meta.embedding_model.clone());
        meta.models.sort();
    }

    let loaded = match store.load_checkpoint(&meta.models, bm25, hnsw) {
        Ok(state) => state,
        Err(IndexError::Corrupt(msg)) => {
            tracing::warn!(dir = %store.dir().display(), "discarding corrupt checkpoint: {msg}");
            None
        }
        Err(e) => return Err(e),
    };

    let Some(mut state) = loaded else {
        meta.models = vec![meta.embedding_model.clone()];
        meta.chunk_count = 0;
        let empty = IndexState::empty(
            bm25,
            vec![VectorIndex::new(
                meta.embedding_model.clone(),
                meta.model_dimension,
                hnsw,
            )],
        );
        return Ok((empty, meta, Vec::new()));
    };

    let journal = store.read_journal();
    if !journal.is_empty() {
        let invalidated = state.invalidate_files(&journal);
        tracing::warn!(
            dir = %store.dir().display(),
            files = journal.len(),
            invalidated,
            "recovering from interrupted reindex"
        );
    }
    meta.chunk_count = state.len();
    Ok((state, meta, journal))
}
