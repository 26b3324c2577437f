use std::path::PathBuf;

use quarry_embed::ModelSpec;
use quarry_index::{Bm25Params, HnswParams, IndexerConfig, SearchMode, SearchRequest, WalkDiscovery};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

pub(crate) fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quarry")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_models")]
    pub models: Vec<ModelSpec>,
}

fn default_model() -> String {
    "hash-384".into()
}

fn default_models() -> Vec<ModelSpec> {
    vec![ModelSpec::hash("hash-384", 384)]
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            models: default_models(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub search_mode: SearchMode,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_bm25_weight")]
    pub bm25_weight: f32,
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f32,
    #[serde(default = "default_entity_tracking")]
    pub entity_tracking: bool,
    #[serde(default = "default_entity_boost")]
    pub entity_boost: f32,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default)]
    pub reranker_enabled: bool,
}

fn default_top_k() -> usize {
    10
}

fn default_bm25_weight() -> f32 {
    0.4
}

fn default_dense_weight() -> f32 {
    0.6
}

fn default_entity_tracking() -> bool {
    true
}

fn default_entity_boost() -> f32 {
    0.5
}

fn default_candidate_multiplier() -> usize {
    4
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            search_mode: SearchMode::default(),
            top_k: default_top_k(),
            bm25_weight: default_bm25_weight(),
            dense_weight: default_dense_weight(),
            entity_tracking: default_entity_tracking(),
            entity_boost: default_entity_boost(),
            candidate_multiplier: default_candidate_multiplier(),
            reranker_enabled: false,
        }
    }
}

impl SearchConfig {
    /// Request defaults handed to the engine; CLI flags override per call.
    #[must_use]
    pub fn to_request(&self) -> SearchRequest {
        SearchRequest {
            mode: self.search_mode,
            top_k: self.top_k,
            bm25_weight: self.bm25_weight,
            dense_weight: self.dense_weight,
            entity_tracking: self.entity_tracking,
            entity_boost: self.entity_boost,
            candidate_multiplier: self.candidate_multiplier,
            rerank: self.reranker_enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IndexConfig {
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f32,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f32,
    #[serde(default = "default_hnsw_m")]
    pub hnsw_m: usize,
    #[serde(default = "default_hnsw_ef_construction")]
    pub hnsw_ef_construction: usize,
    #[serde(default = "default_hnsw_ef_search")]
    pub hnsw_ef_search: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_ignore_dirs")]
    pub ignore_dirs: Vec<String>,
    /// Extensions indexed as whole-file chunks on top of the known languages.
    #[serde(default)]
    pub extra_extensions: Vec<String>,
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
}

fn default_bm25_k1() -> f32 {
    1.2
}

fn default_bm25_b() -> f32 {
    0.75
}

fn default_hnsw_m() -> usize {
    16
}

fn default_hnsw_ef_construction() -> usize {
    200
}

fn default_hnsw_ef_search() -> usize {
    64
}

fn default_batch_size() -> usize {
    32
}

fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

fn default_ignore_dirs() -> Vec<String> {
    WalkDiscovery::default().ignore_dirs
}

fn default_watch_debounce_ms() -> u64 {
    1000
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            hnsw_m: default_hnsw_m(),
            hnsw_ef_construction: default_hnsw_ef_construction(),
            hnsw_ef_search: default_hnsw_ef_search(),
            batch_size: default_batch_size(),
            max_file_bytes: default_max_file_bytes(),
            ignore_dirs: default_ignore_dirs(),
            extra_extensions: Vec::new(),
            watch_debounce_ms: default_watch_debounce_ms(),
        }
    }
}

impl IndexConfig {
    #[must_use]
    pub fn bm25(&self) -> Bm25Params {
        Bm25Params {
            k1: self.bm25_k1,
            b: self.bm25_b,
        }
    }

    #[must_use]
    pub fn hnsw(&self) -> HnswParams {
        HnswParams {
            m: self.hnsw_m,
            ef_construction: self.hnsw_ef_construction,
            ef_search: self.hnsw_ef_search,
        }
    }

    #[must_use]
    pub fn indexer(&self) -> IndexerConfig {
        IndexerConfig {
            batch_size: self.batch_size,
        }
    }

    #[must_use]
    pub fn discovery(&self) -> WalkDiscovery {
        WalkDiscovery {
            ignore_dirs: self.ignore_dirs.clone(),
            max_file_bytes: self.max_file_bytes,
            extra_extensions: self.extra_extensions.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also append log lines to this file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}
