//! Embedding backends and the process-wide model pool.
//!
//! Models are loaded lazily and at most once per key; inference on one loaded
//! instance is serialized when the backend cannot run concurrent calls.

#[cfg(feature = "candle")]
pub mod candle_provider;
pub mod error;
pub mod hashed;
pub mod pool;
pub mod provider;

pub use error::EmbedError;
pub use pool::{EmbedderPool, LoadedModel, ModelLoader};
pub use provider::{Backend, Embedder, Embedding, ModelSpec};
