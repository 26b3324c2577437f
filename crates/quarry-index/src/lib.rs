//! Code indexing and hybrid retrieval for quarry.
//!
//! Source files are split into AST chunks, embedded, and stored in a dual
//! index (HNSW vectors plus BM25 postings) that is only ever mutated through
//! [`dual::DualIndexWriter`]. Searches run against immutable snapshots, so
//! readers never wait on a reindex.

pub mod chunker;
pub mod context;
pub mod discovery;
pub mod dual;
pub mod engine;
pub mod entity;
pub mod error;
pub mod indexer;
pub mod languages;
pub mod lexical;
pub mod manifest;
pub mod registry;
pub mod rerank;
pub mod retriever;
pub mod storage;
pub mod vector;
pub mod watcher;

pub use chunker::{Chunk, ChunkId, chunk_file};
pub use discovery::{FileDiscovery, WalkDiscovery};
pub use dual::{DualIndexWriter, IndexState};
pub use engine::{Engine, ProjectStatus};
pub use error::{ErrorKind, IndexError, Result};
pub use indexer::{Indexer, IndexerConfig, ReindexReport};
pub use languages::{ChunkType, Lang};
pub use lexical::Bm25Params;
pub use registry::{Project, ProjectMetadata, ProjectRegistry, RegistryConfig, SwitchReport};
pub use rerank::{OverlapReranker, Reranker};
pub use retriever::{SearchHit, SearchMode, SearchRequest, format_hits};
pub use vector::HnswParams;
pub use watcher::IndexWatcher;
