use std::path::PathBuf;
use std::str::FromStr;

use quarry_index::SearchMode;

use super::Config;

/// Parse `key` when set; invalid values are dropped with a warning.
fn parsed<T: FromStr>(key: &str) -> Option<T> {
    let v = std::env::var(key).ok()?;
    if let Ok(parsed) = v.trim().parse::<T>() {
        Some(parsed)
    } else {
        tracing::warn!("ignoring invalid {key} value: {v}");
        None
    }
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_DATA_DIR")
            && !v.trim().is_empty()
        {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("QUARRY_DEFAULT_MODEL") {
            self.embedding.default_model = v;
        }
        if let Some(mode) = parsed::<SearchMode>("QUARRY_SEARCH_MODE") {
            self.search.search_mode = mode;
        }
        if let Some(w) = parsed::<f32>("QUARRY_BM25_WEIGHT") {
            self.search.bm25_weight = w;
        }
        if let Some(w) = parsed::<f32>("QUARRY_DENSE_WEIGHT") {
            self.search.dense_weight = w;
        }
        if let Some(enabled) = parsed::<bool>("QUARRY_ENTITY_TRACKING") {
            self.search.entity_tracking = enabled;
        }
        if let Some(enabled) = parsed::<bool>("QUARRY_RERANKER_ENABLED") {
            self.search.reranker_enabled = enabled;
        }
        if let Some(k) = parsed::<usize>("QUARRY_TOP_K") {
            self.search.top_k = k;
        }
        if let Ok(v) = std::env::var("QUARRY_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LOG_FILE") {
            self.log.file = (!v.is_empty()).then(|| PathBuf::from(v));
        }
    }
}
