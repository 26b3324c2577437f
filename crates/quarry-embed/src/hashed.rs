//! Feature-hashing embedder.
//!
//! Each identifier token is hashed with blake3 into a signed bucket; the
//! bucket counts are L2-normalised. Needs no weights and is fully
//! deterministic, which makes it the offline default and the test backend.

use crate::error::Result;
use crate::provider::{Embedder, Embedding};

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    key: String,
    dimension: usize,
    max_tokens: usize,
}

impl HashEmbedder {
    #[must_use]
    pub fn new(key: impl Into<String>, dimension: usize, max_tokens: usize) -> Self {
        Self {
            key: key.into(),
            dimension: dimension.max(1),
            max_tokens: max_tokens.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Embedding {
        let tokens: Vec<String> = text
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();
        let truncated = tokens.len() > self.max_tokens;

        let mut vector = vec![0.0_f32; self.dimension];
        for token in tokens.iter().take(self.max_tokens) {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let mut head = [0u8; 8];
            head.copy_from_slice(&bytes[..8]);
            let bucket = u64::from_le_bytes(head) % self.dimension as u64;
            #[expect(clippy::cast_possible_truncation)]
            let bucket = bucket as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }

        Embedding { vector, truncated }
    }
}

impl Embedder for HashEmbedder {
    fn model_key(&self) -> &str {
        &self.key
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn concurrent_safe(&self) -> bool {
        true
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
