//! Builds the embedder pool and engine from a loaded [`Config`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quarry_embed::EmbedderPool;
use quarry_index::{Engine, Indexer, ProjectRegistry, RegistryConfig};

use crate::config::Config;

/// Priority: CLI `--config` > `QUARRY_CONFIG` env > `<config dir>/quarry/config.toml`.
#[must_use]
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("QUARRY_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir().map_or_else(
        || PathBuf::from("config/default.toml"),
        |d| d.join("quarry").join("config.toml"),
    )
}

/// Load and validate the configuration at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be parsed or a setting is invalid.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = Config::load(path)?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

#[must_use]
pub fn build_pool(config: &Config) -> Arc<EmbedderPool> {
    Arc::new(EmbedderPool::new(config.embedding.models.clone()))
}

/// Wire registry, indexer, discovery and search defaults into an [`Engine`].
///
/// # Errors
///
/// Returns an error if the data directory cannot be created.
pub fn build_engine(config: &Config) -> anyhow::Result<Engine> {
    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!(
            "failed to create data directory {}",
            config.storage.data_dir.display()
        )
    })?;

    let pool = build_pool(config);
    let registry = ProjectRegistry::new(
        RegistryConfig {
            data_dir: config.storage.data_dir.clone(),
            default_model: config.embedding.default_model.clone(),
            bm25: config.index.bm25(),
            hnsw: config.index.hnsw(),
        },
        Arc::clone(&pool),
    );
    let indexer = Indexer::new(pool, config.index.indexer());

    tracing::debug!(
        data_dir = %config.storage.data_dir.display(),
        default_model = %config.embedding.default_model,
        models = config.embedding.models.len(),
        "engine configured"
    );

    Ok(Engine::new(
        registry,
        indexer,
        Arc::new(config.index.discovery()),
        config.search.to_request(),
    ))
}

#[must_use]
pub fn watch_debounce(config: &Config) -> Duration {
    Duration::from_millis(config.index.watch_debounce_ms)
}

#[cfg(test)]
mod tests {
    use quarry_index::SearchMode;

    use super::*;

    fn config_in(data: &Path) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = data.join("state");
        config.embedding.default_model = "hash-32".into();
        config.embedding.models = vec![quarry_embed::ModelSpec::hash("hash-32", 32)];
        config.index.extra_extensions = vec!["src".into()];
        config
    }

    #[test]
    fn cli_path_wins() {
        let path = resolve_config_path(Some(Path::new("/etc/quarry.toml")));
        assert_eq!(path, PathBuf::from("/etc/quarry.toml"));
    }

    #[test]
    fn load_config_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[search]\ntop_k = 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn pool_knows_configured_models() {
        let dir = tempfile::tempdir().unwrap();
        let pool = build_pool(&config_in(dir.path()));
        assert!(pool.is_known("hash-32"));
        assert!(!pool.is_known("hash-384"));
    }

    #[tokio::test]
    async fn built_engine_indexes_and_searches() {
        let data = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.src"), "function foo(){}").unwrap();
        std::fs::write(src.path().join("b.src"), "function bar(){}").unwrap();

        let config = config_in(data.path());
        let engine = build_engine(&config).unwrap();
        assert!(config.storage.data_dir.is_dir());

        let report = engine.reindex(src.path()).await.unwrap();
        assert_eq!(report.added, 2);

        let mut req = engine.search_defaults().clone();
        req.mode = SearchMode::Lexical;
        let hits = engine.search(src.path(), "foo", &req).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "a.src");

        let status = engine.status(src.path()).await.unwrap();
        assert_eq!(status.metadata.embedding_model, "hash-32");
        assert_eq!(status.files, 2);
    }
}
