//! Process-wide embedding model pool.
//!
//! Each registered model key owns a slot holding a `OnceCell`. The first
//! caller for an unloaded key runs the loader; concurrent callers await the
//! same cell and share the result. A failed load leaves the cell empty so a
//! later call can retry, and never touches other keys' slots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::error::{EmbedError, Result};
use crate::hashed::HashEmbedder;
use crate::provider::{Backend, Embedder, Embedding, ModelSpec};

/// Builds an embedder for a spec. Called on the blocking thread pool.
pub trait ModelLoader: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if weights are missing or the device is unusable.
    fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn Embedder>>;
}

/// Loader dispatching on [`Backend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BackendLoader;

impl ModelLoader for BackendLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn Embedder>> {
        match &spec.backend {
            Backend::Hash {
                dimension,
                max_tokens,
            } => Ok(Arc::new(HashEmbedder::new(
                spec.key.clone(),
                *dimension,
                *max_tokens,
            ))),
            #[cfg(feature = "candle")]
            Backend::Candle {
                repo_id,
                max_tokens,
                device,
                ..
            } => {
                let device = crate::candle_provider::parse_device(device)?;
                let model = crate::candle_provider::CandleEmbedder::load(
                    &spec.key,
                    repo_id,
                    *max_tokens,
                    &device,
                )?;
                Ok(Arc::new(model))
            }
            #[cfg(not(feature = "candle"))]
            Backend::Candle { .. } => Err(EmbedError::ModelLoad(format!(
                "model {} needs the `candle` feature",
                spec.key
            ))),
        }
    }
}

/// A model resident in the pool.
pub struct LoadedModel {
    spec: ModelSpec,
    embedder: Arc<dyn Embedder>,
    // Mutual-exclusion region for inference on this instance.
    gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("key", &self.spec.key)
            .field("dimension", &self.embedder.dimension())
            .finish_non_exhaustive()
    }
}

impl LoadedModel {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.spec.key
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    #[must_use]
    pub fn max_tokens(&self) -> usize {
        self.embedder.max_tokens()
    }
}

type Slot = Arc<OnceCell<Arc<LoadedModel>>>;

pub struct EmbedderPool {
    specs: HashMap<String, ModelSpec>,
    slots: Mutex<HashMap<String, Slot>>,
    loader: Arc<dyn ModelLoader>,
}

impl std::fmt::Debug for EmbedderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.specs.keys().collect();
        keys.sort();
        f.debug_struct("EmbedderPool")
            .field("models", &keys)
            .finish_non_exhaustive()
    }
}

impl EmbedderPool {
    #[must_use]
    pub fn new(specs: Vec<ModelSpec>) -> Self {
        Self::with_loader(specs, Arc::new(BackendLoader))
    }

    #[must_use]
    pub fn with_loader(specs: Vec<ModelSpec>, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            specs: specs.into_iter().map(|s| (s.key.clone(), s)).collect(),
            slots: Mutex::new(HashMap::new()),
            loader,
        }
    }

    #[must_use]
    pub fn is_known(&self, key: &str) -> bool {
        self.specs.contains_key(key)
    }

    #[must_use]
    pub fn spec(&self, key: &str) -> Option<&ModelSpec> {
        self.specs.get(key)
    }

    /// Keys of models currently resident, sorted.
    #[must_use]
    pub fn loaded_keys(&self) -> Vec<String> {
        let Ok(slots) = self.slots.lock() else {
            return Vec::new();
        };
        let mut keys: Vec<String> = slots
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn slot(&self, key: &str) -> Result<Slot> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|e| EmbedError::Other(format!("model pool lock poisoned: {e}")))?;
        Ok(Arc::clone(
            slots
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        ))
    }

    /// Load `key` if it is not resident yet. Idempotent and single-flight.
    ///
    /// # Errors
    ///
    /// Returns [`EmbedError::UnknownModel`] for unregistered keys, or the
    /// loader's error if loading fails.
    pub async fn ensure_loaded(&self, key: &str) -> Result<Arc<LoadedModel>> {
        let spec = self
            .specs
            .get(key)
            .cloned()
            .ok_or_else(|| EmbedError::UnknownModel(key.to_owned()))?;
        let cell = self.slot(key)?;
        let loader = Arc::clone(&self.loader);

        let model = cell
            .get_or_try_init(|| async move {
                tracing::info!(model = %spec.key, "loading embedding model");
                let load_spec = spec.clone();
                let embedder = tokio::task::spawn_blocking(move || loader.load(&load_spec))
                    .await
                    .map_err(|e| EmbedError::ModelLoad(format!("loader task failed: {e}")))?
                    .inspect_err(|e| {
                        tracing::warn!(model = %spec.key, "embedding model load failed: {e}");
                    })?;

                if let Some(expected) = spec.declared_dimension()
                    && expected != embedder.dimension()
                {
                    return Err(EmbedError::DimensionMismatch {
                        model: spec.key.clone(),
                        expected,
                        actual: embedder.dimension(),
                    });
                }

                Ok(Arc::new(LoadedModel {
                    spec,
                    embedder,
                    gate: tokio::sync::Mutex::new(()),
                }))
            })
            .await?;
        Ok(Arc::clone(model))
    }

    /// Dimension of `key`, loading the model if the spec does not declare it.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or loading fails.
    pub async fn dimension(&self, key: &str) -> Result<usize> {
        let spec = self
            .specs
            .get(key)
            .ok_or_else(|| EmbedError::UnknownModel(key.to_owned()))?;
        match spec.declared_dimension() {
            Some(dim) => Ok(dim),
            None => Ok(self.ensure_loaded(key).await?.dimension()),
        }
    }

    /// Embed `texts` with model `key`, preserving order.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be loaded, inference fails, or the
    /// model returns vectors of the wrong width.
    pub async fn embed(&self, key: &str, texts: Vec<String>) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.ensure_loaded(key).await?;
        let expected_len = texts.len();

        let _guard = if model.embedder.concurrent_safe() {
            None
        } else {
            Some(model.gate.lock().await)
        };

        let embedder = Arc::clone(&model.embedder);
        let out = tokio::task::spawn_blocking(move || embedder.embed_batch(&texts))
            .await
            .map_err(|e| EmbedError::Inference(format!("embedding task failed: {e}")))??;

        if out.len() != expected_len {
            return Err(EmbedError::Inference(format!(
                "model {key} returned {} embeddings for {expected_len} inputs",
                out.len()
            )));
        }
        let dimension = model.dimension();
        if let Some(bad) = out.iter().find(|e| e.vector.len() != dimension) {
            return Err(EmbedError::DimensionMismatch {
                model: key.to_owned(),
                expected: dimension,
                actual: bad.vector.len(),
            });
        }
        Ok(out)
    }

    /// Drop the resident instance for `key`. Holders of the old `Arc` keep it.
    pub fn unload(&self, key: &str) -> bool {
        let Ok(mut slots) = self.slots.lock() else {
            return false;
        };
        let removed = slots.remove(key).is_some_and(|cell| cell.initialized());
        if removed {
            tracing::info!(model = key, "embedding model unloaded");
        }
        removed
    }
}
