//! Error types for quarry-index.

use quarry_embed::EmbedError;

/// Errors that can occur during indexing and retrieval.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// IO error reading source files or checkpoint files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Embedding model error (load or inference).
    #[error("embedding error: {0}")]
    Embed(#[from] EmbedError),

    /// Tree-sitter parsing error.
    #[error("parse failed: {0}")]
    Parse(String),

    /// Unsupported or unrecognized language.
    #[error("unsupported language")]
    UnsupportedLanguage,

    /// File watcher error.
    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// `top_k` must be at least 1.
    #[error("top_k must be at least 1")]
    InvalidTopK,

    /// Fusion weights are negative, non-finite or both zero.
    #[error("invalid search weights: {0}")]
    InvalidWeights(String),

    /// Project was never indexed and has no metadata on disk.
    #[error("unknown project: {0}")]
    UnknownProject(String),

    /// Embedding model key is not registered.
    #[error("unknown embedding model: {0}")]
    UnknownModel(String),

    /// A loaded model's width disagrees with an existing vector store.
    #[error("dimension mismatch for model {model}: store has {expected}, got {actual}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },

    /// Another reindex of the same project is in flight.
    #[error("project is busy: a reindex is already running")]
    Busy,

    /// Reindex was cancelled before commit.
    #[error("reindex cancelled")]
    Cancelled,

    /// Persisted state could not be decoded.
    #[error("corrupt index state: {0}")]
    Corrupt(String),

    /// Vector, lexical and manifest id sets disagree.
    #[error("index invariant violated: {0}")]
    Invariant(String),

    /// Generic catch-all error.
    #[error("{0}")]
    Other(String),
}

/// How a failure should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; rejected synchronously with no state change.
    Caller,
    /// Aborts the triggering operation; committed state is untouched.
    Fatal,
    /// Confined to one project's storage.
    Project,
    /// Confined to one file; logged and counted.
    Local,
}

impl IndexError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTopK
            | Self::InvalidWeights(_)
            | Self::UnknownProject(_)
            | Self::UnknownModel(_)
            | Self::Busy => ErrorKind::Caller,
            Self::Embed(EmbedError::UnknownModel(_)) => ErrorKind::Caller,
            Self::Parse(_) | Self::UnsupportedLanguage => ErrorKind::Local,
            Self::Corrupt(_) => ErrorKind::Project,
            _ => ErrorKind::Fatal,
        }
    }
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
