#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown embedding model: {0}")]
    UnknownModel(String),

    #[error("model loading failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("model {model} produced {actual}-dimensional vectors, expected {expected}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },

    #[cfg(feature = "candle")]
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, EmbedError>;
