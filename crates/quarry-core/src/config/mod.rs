mod env;
mod types;


pub use types::*;

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, bail};
use quarry_index::SearchMode;

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        let search = &self.search;
        for (name, w) in [
            ("bm25_weight", search.bm25_weight),
            ("dense_weight", search.dense_weight),
            ("entity_boost", search.entity_boost),
        ] {
            if !w.is_finite() || w < 0.0 {
                bail!("search.{name} must be a non-negative number, got {w}");
            }
        }
        if search.search_mode == SearchMode::Hybrid
            && search.bm25_weight == 0.0
            && search.dense_weight == 0.0
        {
            bail!("search.bm25_weight and search.dense_weight cannot both be zero");
        }
        if search.top_k == 0 {
            bail!("search.top_k must be at least 1");
        }
        if search.candidate_multiplier == 0 {
            bail!("search.candidate_multiplier must be at least 1");
        }

        let mut keys = BTreeSet::new();
        for spec in &self.embedding.models {
            if !keys.insert(spec.key.as_str()) {
                bail!("embedding model {} is declared twice", spec.key);
            }
            if spec.declared_dimension() == Some(0) {
                bail!("embedding model {} has zero dimension", spec.key);
            }
        }
        if !keys.contains(self.embedding.default_model.as_str()) {
            bail!(
                "embedding.default_model {} is not among embedding.models",
                self.embedding.default_model
            );
        }

        let index = &self.index;
        if index.batch_size == 0 {
            bail!("index.batch_size must be at least 1");
        }
        if index.hnsw_m < 2 {
            bail!("index.hnsw_m must be at least 2");
        }
        if index.hnsw_ef_search == 0 || index.hnsw_ef_construction == 0 {
            bail!("index.hnsw_ef_search and index.hnsw_ef_construction must be positive");
        }
        if !(index.bm25_k1.is_finite() && index.bm25_k1 >= 0.0) {
            bail!("index.bm25_k1 must be non-negative");
        }
        if !(0.0..=1.0).contains(&index.bm25_b) {
            bail!("index.bm25_b must lie in [0, 1]");
        }
        Ok(())
    }
}
