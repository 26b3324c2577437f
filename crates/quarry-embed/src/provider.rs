use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A single embedding plus whether its input was cut to the model's budget.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub truncated: bool,
}

/// A loaded embedding model.
///
/// Implementations are blocking; the pool runs them on the blocking thread pool.
pub trait Embedder: Send + Sync {
    fn model_key(&self) -> &str;

    /// Width of every vector this model returns.
    fn dimension(&self) -> usize;

    /// Token budget per input. Longer inputs are truncated, never rejected.
    fn max_tokens(&self) -> usize;

    /// Whether two `embed_batch` calls on this instance may overlap.
    fn concurrent_safe(&self) -> bool {
        false
    }

    /// Embed every text, preserving order.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or the forward pass fails.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;
}

fn default_max_tokens() -> usize {
    512
}

fn default_device() -> String {
    "cpu".into()
}

/// Which implementation backs a model key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum Backend {
    /// Deterministic feature-hashing embedder, no weights required.
    Hash {
        dimension: usize,
        #[serde(default = "default_max_tokens")]
        max_tokens: usize,
    },
    /// BERT-family model from the `HuggingFace` Hub, run through candle.
    Candle {
        repo_id: String,
        #[serde(default)]
        dimension: Option<usize>,
        #[serde(default = "default_max_tokens")]
        max_tokens: usize,
        #[serde(default = "default_device")]
        device: String,
    },
}

/// Registration of one model key in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub key: String,
    #[serde(flatten)]
    pub backend: Backend,
}

impl ModelSpec {
    #[must_use]
    pub fn hash(key: impl Into<String>, dimension: usize) -> Self {
        Self {
            key: key.into(),
            backend: Backend::Hash {
                dimension,
                max_tokens: default_max_tokens(),
            },
        }
    }

    /// Dimension known before loading, if the spec declares one.
    #[must_use]
    pub fn declared_dimension(&self) -> Option<usize> {
        match &self.backend {
            Backend::Hash { dimension, .. } => Some(*dimension),
            Backend::Candle { dimension, .. } => *dimension,
        }
    }

    #[must_use]
    pub fn max_tokens(&self) -> usize {
        match &self.backend {
            Backend::Hash { max_tokens, .. } | Backend::Candle { max_tokens, .. } => *max_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_deserializes_hash_backend_with_defaults() {
        let spec: ModelSpec =
            serde_json::from_str(r#"{"key":"hash-64","backend":"hash","dimension":64}"#).unwrap();
        assert_eq!(spec, ModelSpec::hash("hash-64", 64));
        assert_eq!(spec.max_tokens(), 512);
        assert_eq!(spec.declared_dimension(), Some(64));
    }

    #[test]
    fn spec_deserializes_candle_backend() {
        let spec: ModelSpec = serde_json::from_str(
            r#"{"key":"minilm","backend":"candle","repo_id":"sentence-transformers/all-MiniLM-L6-v2","max_tokens":256}"#,
        )
        .unwrap();
        assert_eq!(spec.declared_dimension(), None);
        assert_eq!(spec.max_tokens(), 256);
        match spec.backend {
            Backend::Candle { device, .. } => assert_eq!(device, "cpu"),
            Backend::Hash { .. } => panic!("expected candle backend"),
        }
    }
}
