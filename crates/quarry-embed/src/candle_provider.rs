//! BERT sentence embeddings through candle.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::Tokenizer;

use crate::error::{EmbedError, Result};
use crate::provider::{Embedder, Embedding};

pub struct CandleEmbedder {
    key: String,
    model: Arc<BertModel>,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
    max_tokens: usize,
}

impl std::fmt::Debug for CandleEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleEmbedder")
            .field("key", &self.key)
            .field("device", &self.device)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

/// Map a config device name onto a candle device.
///
/// # Errors
///
/// Returns an error if the requested accelerator is unavailable.
pub fn parse_device(name: &str) -> Result<Device> {
    match name {
        "cpu" | "" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(0)
            .map_err(|e| EmbedError::ModelLoad(format!("cuda device unavailable: {e}"))),
        "metal" => Device::new_metal(0)
            .map_err(|e| EmbedError::ModelLoad(format!("metal device unavailable: {e}"))),
        other => Err(EmbedError::ModelLoad(format!("unknown device: {other}"))),
    }
}

impl CandleEmbedder {
    /// Load a BERT embedding model from `HuggingFace` Hub.
    ///
    /// # Errors
    ///
    /// Returns an error if model download or loading fails.
    pub fn load(key: &str, repo_id: &str, max_tokens: usize, device: &Device) -> Result<Self> {
        let api = hf_hub::api::sync::Api::new().map_err(|e| {
            EmbedError::ModelLoad(format!("failed to create HuggingFace API client: {e}"))
        })?;
        let repo = api.model(repo_id.to_owned());

        let fetch = |file: &str| {
            repo.get(file).map_err(|e| {
                EmbedError::ModelLoad(format!("failed to download {file} from {repo_id}: {e}"))
            })
        };
        let config_path = fetch("config.json")?;
        let tokenizer_path = fetch("tokenizer.json")?;
        let weights_path = fetch("model.safetensors")?;

        let config_str = std::fs::read_to_string(&config_path)
            .map_err(|e| EmbedError::ModelLoad(format!("failed to read BERT config: {e}")))?;
        let config: BertConfig = serde_json::from_str(&config_str)?;
        let dimension = config.hidden_size;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EmbedError::ModelLoad(format!("failed to load tokenizer: {e}")))?;

        // SAFETY: file is a valid safetensors downloaded from hf-hub, not modified during
        // VarBuilder lifetime
        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, device)? };
        let model = BertModel::load(vb, &config)?;

        tracing::info!(model = key, repo_id, dimension, "candle embedding model loaded");

        Ok(Self {
            key: key.to_owned(),
            model: Arc::new(model),
            tokenizer,
            device: device.clone(),
            dimension,
            max_tokens: max_tokens.max(1),
        })
    }

    fn embed_one(&self, text: &str) -> Result<Embedding> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EmbedError::Inference(format!("tokenizer encode failed: {e}")))?;

        let mut token_ids = encoding.get_ids().to_vec();
        let truncated = token_ids.len() > self.max_tokens;
        token_ids.truncate(self.max_tokens);
        let token_type_ids: Vec<u32> = vec![0; token_ids.len()];

        let input_ids = Tensor::new(token_ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(token_type_ids.as_slice(), &self.device)?.unsqueeze(0)?;

        let hidden = self.model.forward(&input_ids, &token_type_ids, None)?;

        let seq_len = hidden.dim(1)?;
        let sum = hidden.sum(1)?;
        let mean_pooled = (sum
            / f64::from(u32::try_from(seq_len).map_err(|e| {
                EmbedError::Inference(format!("sequence length overflow: {e}"))
            })?))?;

        let norm = mean_pooled.sqr()?.sum_keepdim(1)?.sqrt()?;
        let normalized = mean_pooled.broadcast_div(&norm)?.squeeze(0)?;

        Ok(Embedding {
            vector: normalized.to_vec1::<f32>()?,
            truncated,
        })
    }
}

impl Embedder for CandleEmbedder {
    fn model_key(&self) -> &str {
        &self.key
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        texts.iter().map(|t| self.embed_one(t)).collect()
    }
}
