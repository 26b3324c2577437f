//! Facade exposing the indexing and search calls to outer layers.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use quarry_embed::EmbedderPool;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::discovery::FileDiscovery;
use crate::error::{IndexError, Result};
use crate::indexer::{Indexer, ReindexReport};
use crate::registry::{ProjectMetadata, ProjectRegistry, SwitchReport};
use crate::rerank::{OverlapReranker, Reranker};
use crate::retriever::{self, SearchHit, SearchRequest};

/// Point-in-time view of a project for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub metadata: ProjectMetadata,
    pub version: u64,
    pub files: usize,
    pub chunks: usize,
    pub busy: bool,
    pub recovered_files: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

pub struct Engine {
    registry: ProjectRegistry,
    indexer: Indexer,
    discovery: Arc<dyn FileDiscovery>,
    reranker: Arc<dyn Reranker>,
    search_defaults: SearchRequest,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("indexer", &self.indexer)
            .field("search_defaults", &self.search_defaults)
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn new(
        registry: ProjectRegistry,
        indexer: Indexer,
        discovery: Arc<dyn FileDiscovery>,
        search_defaults: SearchRequest,
    ) -> Self {
        Self {
            registry,
            indexer,
            discovery,
            reranker: Arc::new(OverlapReranker),
            search_defaults,
        }
    }

    #[must_use]
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<EmbedderPool> {
        self.registry.pool()
    }

    /// Search defaults from configuration; callers override fields per call.
    #[must_use]
    pub fn search_defaults(&self) -> &SearchRequest {
        &self.search_defaults
    }

    /// Discover and reindex `path`, queueing behind any running reindex.
    ///
    /// # Errors
    ///
    /// See [`Indexer::reindex`].
    pub async fn reindex(&self, path: &Path) -> Result<ReindexReport> {
        self.reindex_with_cancel(path, &CancellationToken::new())
            .await
    }

    /// # Errors
    ///
    /// Returns [`IndexError::Cancelled`] if `cancel` fires before commit.
    pub async fn reindex_with_cancel(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ReindexReport> {
        let project = self.registry.create_or_load(path).await?;
        let files = self.discover(project.root()).await?;
        self.indexer.reindex(&project, files, cancel).await
    }

    /// Reindex unless one is already running for the project.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Busy`] if the project is being reindexed.
    pub async fn try_reindex(&self, path: &Path) -> Result<ReindexReport> {
        let project = self.registry.create_or_load(path).await?;
        if project.is_busy() {
            return Err(IndexError::Busy);
        }
        let files = self.discover(project.root()).await?;
        self.indexer
            .try_reindex(&project, files, &CancellationToken::new())
            .await
    }

    /// Search the committed snapshot of `path`.
    ///
    /// # Errors
    ///
    /// Returns a caller error for invalid requests or unknown projects.
    pub async fn search(
        &self,
        path: &Path,
        query: &str,
        request: &SearchRequest,
    ) -> Result<Vec<SearchHit>> {
        request.validate()?;
        let project = self.registry.get(path).await?;
        let snapshot = project.snapshot();
        let model = project.active_model();
        retriever::search(
            &snapshot,
            self.pool(),
            &model,
            query,
            request,
            self.reranker.as_ref(),
        )
        .await
    }

    /// # Errors
    ///
    /// See [`ProjectRegistry::switch_model`].
    pub async fn switch_model(&self, path: &Path, model_key: &str) -> Result<SwitchReport> {
        let project = self.registry.create_or_load(path).await?;
        self.registry.switch_model(&project, model_key).await
    }

    /// # Errors
    ///
    /// Returns [`IndexError::UnknownProject`] if the project was never indexed.
    pub async fn status(&self, path: &Path) -> Result<ProjectStatus> {
        let project = self.registry.get(path).await?;
        let snapshot = project.snapshot();
        Ok(ProjectStatus {
            metadata: project.metadata(),
            version: snapshot.version(),
            files: snapshot.manifest().len(),
            chunks: snapshot.len(),
            busy: project.is_busy(),
            recovered_files: project.recovered_files().to_vec(),
            checked_at: Utc::now(),
        })
    }

    async fn discover(&self, root: &Path) -> Result<Vec<String>> {
        let discovery = Arc::clone(&self.discovery);
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || discovery.discover(&root))
            .await
            .map_err(|e| IndexError::Other(format!("discovery task failed: {e}")))?
    }
}
