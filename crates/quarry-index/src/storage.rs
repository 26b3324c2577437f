//! On-disk checkpoints for one project.
//!
//! ```text
//! <data_dir>/<project_hash>/
//!   project.json          metadata
//!   CURRENT               committed generation number
//!   pending.json          files touched by an uncommitted batch
//!   gen-<n>/manifest.json
//!   gen-<n>/chunks.json
//!   gen-<n>/lexical.json
//!   gen-<n>/vectors-<model>.json
//! ```
//!
//! Every file is written under a temporary name and renamed into place.
//! `CURRENT` is replaced last, so a crash leaves the previous generation
//! intact.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chunker::{Chunk, ChunkId};
use crate::dual::IndexState;
use crate::error::{IndexError, Result};
use crate::lexical::{Bm25Params, LexicalIndex};
use crate::manifest::Manifest;
use crate::registry::ProjectMetadata;
use crate::vector::{HnswParams, VectorIndex};

const METADATA_FILE: &str = "project.json";
const CURRENT_FILE: &str = "CURRENT";
const JOURNAL_FILE: &str = "pending.json";

#[derive(Serialize, Deserialize)]
struct VectorFile {
    model_key: String,
    dimension: usize,
    vectors: Vec<(ChunkId, Vec<f32>)>,
}

#[derive(Serialize, Deserialize)]
struct Journal {
    generation: u64,
    files: Vec<String>,
}

/// Storage root of one project.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    dir: PathBuf,
}

impl ProjectStore {
    #[must_use]
    pub fn new(data_dir: &Path, project_hash: &str) -> Self {
        Self {
            dir: data_dir.join(project_hash),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load `project.json`. `Ok(None)` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Corrupt`] if the file cannot be decoded.
    pub fn load_metadata(&self) -> Result<Option<ProjectMetadata>> {
        let path = self.dir.join(METADATA_FILE);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| IndexError::Corrupt(format!("{}: {e}", path.display())))
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_metadata(&self, meta: &ProjectMetadata) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_atomic(&self.dir.join(METADATA_FILE), &serde_json::to_vec_pretty(meta)?)
    }

    /// Record the files an in-progress batch will touch.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be written.
    pub fn write_journal(&self, generation: u64, files: &[String]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let journal = Journal {
            generation,
            files: files.to_vec(),
        };
        write_atomic(&self.dir.join(JOURNAL_FILE), &serde_json::to_vec(&journal)?)
    }

    /// Files left by an interrupted batch. An unreadable journal yields an
    /// empty list after a warning.
    #[must_use]
    pub fn read_journal(&self) -> Vec<String> {
        let path = self.dir.join(JOURNAL_FILE);
        let Ok(bytes) = fs::read(&path) else {
            return Vec::new();
        };
        match serde_json::from_slice::<Journal>(&bytes) {
            Ok(j) => j.files,
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring unreadable journal: {e}");
                Vec::new()
            }
        }
    }

    /// # Errors
    ///
    /// Returns an error if the journal exists but cannot be removed.
    pub fn clear_journal(&self) -> Result<()> {
        match fs::remove_file(self.dir.join(JOURNAL_FILE)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Committed generation, if any.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Corrupt`] if `CURRENT` is not a number.
    pub fn current_generation(&self) -> Result<Option<u64>> {
        let path = self.dir.join(CURRENT_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        text.trim()
            .parse()
            .map(Some)
            .map_err(|e| IndexError::Corrupt(format!("{}: {e}", path.display())))
    }

    /// Write `state` as generation `state.version()` and make it current.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be written.
    pub fn save_checkpoint(&self, state: &IndexState) -> Result<()> {
        let generation = state.version();
        let gen_dir = self.generation_dir(generation);
        fs::create_dir_all(&gen_dir)?;

        let chunks: Vec<&Chunk> = state.chunks().collect();
        write_atomic(&gen_dir.join("chunks.json"), &serde_json::to_vec(&chunks)?)?;
        write_atomic(
            &gen_dir.join("lexical.json"),
            &serde_json::to_vec(state.lexical())?,
        )?;
        for store in state.vector_stores() {
            let file = VectorFile {
                model_key: store.model_key().to_string(),
                dimension: store.dimension(),
                vectors: store.entries(),
            };
            write_atomic(
                &gen_dir.join(vector_file_name(store.model_key())),
                &serde_json::to_vec(&file)?,
            )?;
        }
        // Manifest last within the generation: its presence marks it complete.
        write_atomic(
            &gen_dir.join("manifest.json"),
            &serde_json::to_vec(state.manifest())?,
        )?;

        write_atomic(&self.dir.join(CURRENT_FILE), generation.to_string().as_bytes())?;
        self.prune_generations(generation);
        tracing::debug!(dir = %self.dir.display(), generation, "checkpoint written");
        Ok(())
    }

    /// Load the committed generation. `Ok(None)` if nothing was committed.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Corrupt`] if any generation file is missing or
    /// cannot be decoded, or if the parts disagree on chunk ids.
    pub fn load_checkpoint(
        &self,
        models: &[String],
        bm25: Bm25Params,
        hnsw: HnswParams,
    ) -> Result<Option<IndexState>> {
        let Some(generation) = self.current_generation()? else {
            return Ok(None);
        };
        let gen_dir = self.generation_dir(generation);

        let manifest: Manifest = read_json(&gen_dir.join("manifest.json"))?;
        let chunks: Vec<Chunk> = read_json(&gen_dir.join("chunks.json"))?;
        let mut lexical: LexicalIndex = read_json(&gen_dir.join("lexical.json"))?;
        lexical.set_params(bm25);

        let mut stores = Vec::with_capacity(models.len());
        for model in models {
            let file: VectorFile = read_json(&gen_dir.join(vector_file_name(model)))?;
            if file.model_key != *model {
                return Err(IndexError::Corrupt(format!(
                    "vector file for {model} holds {}",
                    file.model_key
                )));
            }
            let store = VectorIndex::from_entries(model.clone(), file.dimension, hnsw, file.vectors)
                .map_err(|e| IndexError::Corrupt(e.to_string()))?;
            stores.push(store);
        }

        IndexState::from_parts(generation, chunks, lexical, stores, manifest)
            .map(Some)
            .map_err(|e| IndexError::Corrupt(e.to_string()))
    }

    /// Delete the whole project directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn remove_all(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn generation_dir(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("gen-{generation}"))
    }

    fn prune_generations(&self, keep: u64) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let keep_name = format!("gen-{keep}");
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with("gen-")
                && name != keep_name
                && let Err(e) = fs::remove_dir_all(entry.path())
            {
                tracing::warn!(path = %entry.path().display(), "failed to prune generation: {e}");
            }
        }
    }
}

/// File name of a model's vector store; keys are sanitized and suffixed with
/// a short hash so distinct keys never collide.
fn vector_file_name(model_key: &str) -> String {
    let slug: String = model_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let hash = blake3::hash(model_key.as_bytes()).to_hex();
    format!("vectors-{slug}-{}.json", &hash[..8])
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| IndexError::Corrupt(format!("{}: {e}", path.display())))?;
    serde_json::from_slice(&bytes).map_err(|e| IndexError::Corrupt(format!("{}: {e}", path.display())))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::chunker::chunk_file;
    use crate::dual::DualIndexWriter;
    use crate::manifest::ManifestEntry;

    fn sample_state() -> IndexState {
        let base = IndexState::empty(
            Bm25Params::default(),
            vec![VectorIndex::new("hash-4", 4, HnswParams::default())],
        );
        let mut w = DualIndexWriter::new(&base);
        let chunk = chunk_file("a.src", "function foo(){}", None).pop().unwrap();
        let id = chunk.chunk_id.clone();
        let vectors = BTreeMap::from([("hash-4".to_string(), vec![1.0, 0.0, 0.0, 0.0])]);
        w.add_chunk(chunk, &vectors).unwrap();
        w.set_manifest_entry(ManifestEntry {
            file_path: "a.src".into(),
            content_hash: "h".into(),
            mtime: 0,
            chunk_ids: vec![id],
        });
        w.finish().unwrap()
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path(), "p");
        let state = sample_state();
        store.save_checkpoint(&state).unwrap();

        let loaded = store
            .load_checkpoint(
                &["hash-4".to_string()],
                Bm25Params::default(),
                HnswParams::default(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(loaded.version(), state.version());
        assert_eq!(loaded.manifest(), state.manifest());
        assert_eq!(loaded.lexical(), state.lexical());
        assert_eq!(
            loaded.vector("hash-4").unwrap().entries(),
            state.vector("hash-4").unwrap().entries()
        );
    }

    #[test]
    fn nothing_committed_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path(), "p");
        assert!(
            store
                .load_checkpoint(&[], Bm25Params::default(), HnswParams::default())
                .unwrap()
                .is_none()
        );
        assert!(store.load_metadata().unwrap().is_none());
    }

    #[test]
    fn old_generations_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path(), "p");
        let state = sample_state();
        store.save_checkpoint(&state).unwrap();

        let mut w = DualIndexWriter::new(&state);
        w.remove_manifest_entry("a.src");
        let id = state.chunks().next().unwrap().chunk_id.clone();
        w.remove_chunk(&id);
        let next = w.finish().unwrap();
        store.save_checkpoint(&next).unwrap();

        assert_eq!(store.current_generation().unwrap(), Some(2));
        assert!(!store.dir().join("gen-1").exists());
        assert!(store.dir().join("gen-2").exists());
    }

    #[test]
    fn corrupt_generation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path(), "p");
        store.save_checkpoint(&sample_state()).unwrap();
        fs::write(store.dir().join("gen-1").join("chunks.json"), b"{not json").unwrap();
        let err = store
            .load_checkpoint(
                &["hash-4".to_string()],
                Bm25Params::default(),
                HnswParams::default(),
            )
            .unwrap_err();
        assert!(matches!(err, IndexError::Corrupt(_)));
    }

    #[test]
    fn journal_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path(), "p");
        assert!(store.read_journal().is_empty());
        store
            .write_journal(3, &["a.rs".to_string(), "b.rs".to_string()])
            .unwrap();
        assert_eq!(store.read_journal(), vec!["a.rs", "b.rs"]);
        store.clear_journal().unwrap();
        store.clear_journal().unwrap();
        assert!(store.read_journal().is_empty());
    }

    #[test]
    fn vector_file_names_are_distinct() {
        assert_ne!(vector_file_name("a/b"), vector_file_name("a_b"));
        assert!(vector_file_name("hash-384").starts_with("vectors-hash-384-"));
    }
}
