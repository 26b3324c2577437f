//! Incremental reindex: hash → classify → chunk → embed → stage → commit.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use quarry_embed::EmbedderPool;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::chunker::{Chunk, ChunkId, blake3_hex, chunk_file};
use crate::context::embedding_text;
use crate::dual::{DualIndexWriter, IndexState};
use crate::error::{IndexError, Result};
use crate::languages::detect_language;
use crate::manifest::{ChangeSet, ManifestEntry, ScannedFile};
use crate::registry::Project;

/// Indexer configuration.
#[derive(Debug, Clone, Copy)]
pub struct IndexerConfig {
    /// Files per sub-batch; cancellation is checked between sub-batches.
    pub batch_size: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self { batch_size: 32 }
    }
}

/// Summary of a reindex run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub chunks_added: usize,
    pub chunks_removed: usize,
    /// Chunks whose vectors were carried over instead of re-embedded.
    pub chunks_reused: usize,
    pub embedded: usize,
    pub truncated: usize,
    pub failed_files: usize,
    /// Committed version, unchanged when nothing needed indexing.
    pub version: u64,
    pub duration_ms: u64,
}

struct Prepared {
    file_path: String,
    content_hash: String,
    mtime: i64,
    is_new: bool,
    chunks: Vec<Chunk>,
}

struct Planned {
    chunk: Chunk,
    vectors: BTreeMap<String, Vec<f32>>,
    fresh: bool,
}

/// Runs reindex batches against a project's snapshot.
#[derive(Debug)]
pub struct Indexer {
    pool: Arc<EmbedderPool>,
    config: IndexerConfig,
}

impl Indexer {
    #[must_use]
    pub fn new(pool: Arc<EmbedderPool>, config: IndexerConfig) -> Self {
        Self {
            pool,
            config: IndexerConfig {
                batch_size: config.batch_size.max(1),
            },
        }
    }

    /// Reindex `files` (project-relative paths), waiting for any in-flight
    /// reindex of the same project to finish first.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Cancelled`] if `cancel` fires before commit, or
    /// any embedding, invariant or persistence error. Committed state is
    /// untouched on error.
    pub async fn reindex(
        &self,
        project: &Project,
        files: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<ReindexReport> {
        let _guard = project.lock_writer().await;
        self.run(project, files, cancel).await
    }

    /// Like [`Indexer::reindex`] but rejects instead of queueing.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Busy`] if another reindex holds the project.
    pub async fn try_reindex(
        &self,
        project: &Project,
        files: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<ReindexReport> {
        let _guard = project.try_lock_writer()?;
        self.run(project, files, cancel).await
    }

    async fn run(
        &self,
        project: &Project,
        files: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<ReindexReport> {
        let start = Instant::now();
        let mut report = ReindexReport::default();
        if cancel.is_cancelled() {
            return Err(IndexError::Cancelled);
        }

        let snapshot = project.snapshot();
        report.version = snapshot.version();
        let models = snapshot.models();
        self.check_models(&snapshot, &models).await?;

        let root = project.root();
        tracing::info!(project = %root.display(), files = files.len(), "reindex started");

        let mut scanned = Vec::with_capacity(files.len());
        let mut unreadable = BTreeSet::new();
        let unique: BTreeSet<String> = files.into_iter().collect();
        for rel in unique {
            match scan_file(root, &rel).await {
                Ok(file) => scanned.push(file),
                Err(e) => {
                    tracing::warn!(file = %rel, "skipping unreadable file: {e}");
                    report.failed_files += 1;
                    unreadable.insert(rel);
                }
            }
        }

        let changes = snapshot.manifest().classify(scanned, &unreadable);
        report.unchanged = changes.unchanged.len();
        if changes.is_empty() {
            report.duration_ms = elapsed_ms(start);
            tracing::info!(unchanged = report.unchanged, "index up to date");
            return Ok(report);
        }

        let store = project.store();
        store.write_journal(snapshot.version() + 1, &changes.touched_paths())?;

        let staged = self
            .stage(root, &snapshot, &models, changes, cancel, &mut report)
            .await;
        let state = match staged {
            Ok(state) if !cancel.is_cancelled() => state,
            Ok(_) => {
                discard_journal(project);
                return Err(IndexError::Cancelled);
            }
            Err(e) => {
                discard_journal(project);
                return Err(e);
            }
        };

        let committed = project.commit(state, None).await?;
        report.version = committed.version();
        report.duration_ms = elapsed_ms(start);
        tracing::info!(
            added = report.added,
            modified = report.modified,
            deleted = report.deleted,
            unchanged = report.unchanged,
            chunks = committed.len(),
            embedded = report.embedded,
            reused = report.chunks_reused,
            failed = report.failed_files,
            version = report.version,
            duration_ms = report.duration_ms,
            "reindex committed"
        );
        Ok(report)
    }

    async fn check_models(&self, snapshot: &IndexState, models: &[String]) -> Result<()> {
        for model in models {
            let dimension = self.pool.dimension(model).await?;
            if let Some(store) = snapshot.vector(model)
                && store.dimension() != dimension
            {
                return Err(IndexError::DimensionMismatch {
                    model: model.clone(),
                    expected: store.dimension(),
                    actual: dimension,
                });
            }
        }
        Ok(())
    }

    async fn stage(
        &self,
        root: &Path,
        snapshot: &IndexState,
        models: &[String],
        changes: ChangeSet,
        cancel: &CancellationToken,
        report: &mut ReindexReport,
    ) -> Result<IndexState> {
        let mut writer = DualIndexWriter::new(snapshot);

        for path in &changes.deleted {
            if let Some(entry) = writer.remove_manifest_entry(path) {
                for id in &entry.chunk_ids {
                    if writer.remove_chunk(id) {
                        report.chunks_removed += 1;
                    }
                }
            }
            report.deleted += 1;
            tracing::debug!(file = %path, "removed deleted file");
        }

        let mut work: Vec<(ScannedFile, bool)> = changes
            .added
            .into_iter()
            .map(|f| (f, true))
            .chain(changes.modified.into_iter().map(|f| (f, false)))
            .collect();
        work.sort_by(|a, b| a.0.file_path.cmp(&b.0.file_path));

        for batch in work.chunks(self.config.batch_size) {
            if cancel.is_cancelled() {
                tracing::info!("reindex cancelled before commit");
                return Err(IndexError::Cancelled);
            }
            let prepared = prepare_batch(root, batch, report).await?;
            self.apply_batch(prepared, models, &mut writer, report)
                .await?;
        }

        writer.finish()
    }

    async fn apply_batch(
        &self,
        prepared: Vec<Prepared>,
        models: &[String],
        writer: &mut DualIndexWriter,
        report: &mut ReindexReport,
    ) -> Result<()> {
        let mut files: Vec<(Prepared, Vec<ChunkId>, Vec<Planned>)> = Vec::new();
        for mut file in prepared {
            let old_ids: Vec<ChunkId> = writer
                .staged()
                .manifest()
                .get(&file.file_path)
                .map(|e| e.chunk_ids.clone())
                .unwrap_or_default();
            let chunks = std::mem::take(&mut file.chunks);
            let planned = plan_file(writer, models, &old_ids, chunks);
            files.push((file, old_ids, planned));
        }

        self.embed_pending(&mut files, models, report).await?;

        for (file, old_ids, planned) in files {
            let new_ids: BTreeSet<&ChunkId> = planned.iter().map(|p| &p.chunk.chunk_id).collect();
            for id in old_ids.iter().filter(|id| !new_ids.contains(id)) {
                if writer.remove_chunk(id) {
                    report.chunks_removed += 1;
                }
            }

            let old: BTreeSet<&ChunkId> = old_ids.iter().collect();
            let mut chunk_ids = Vec::with_capacity(planned.len());
            for plan in planned {
                if !old.contains(&plan.chunk.chunk_id) {
                    report.chunks_added += 1;
                }
                if !plan.fresh {
                    report.chunks_reused += 1;
                }
                chunk_ids.push(plan.chunk.chunk_id.clone());
                writer.add_chunk(plan.chunk, &plan.vectors)?;
            }

            tracing::debug!(
                file = %file.file_path,
                chunks = chunk_ids.len(),
                new = file.is_new,
                "file indexed"
            );
            if file.is_new {
                report.added += 1;
            } else {
                report.modified += 1;
            }
            writer.set_manifest_entry(ManifestEntry {
                file_path: file.file_path,
                content_hash: file.content_hash,
                mtime: file.mtime,
                chunk_ids,
            });
        }
        Ok(())
    }

    /// Embed every planned chunk that has no reusable vector, once per model.
    async fn embed_pending(
        &self,
        files: &mut [(Prepared, Vec<ChunkId>, Vec<Planned>)],
        models: &[String],
        report: &mut ReindexReport,
    ) -> Result<()> {
        let mut pending: Vec<&mut Planned> = files
            .iter_mut()
            .flat_map(|(_, _, planned)| planned.iter_mut())
            .filter(|p| p.fresh)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = pending.iter().map(|p| embedding_text(&p.chunk)).collect();
        for model in models {
            let embeddings = self.pool.embed(model, texts.clone()).await?;
            for (plan, embedding) in pending.iter_mut().zip(embeddings) {
                plan.chunk.truncated |= embedding.truncated;
                plan.vectors.insert(model.clone(), embedding.vector);
            }
        }

        report.embedded += pending.len();
        report.truncated += pending.iter().filter(|p| p.chunk.truncated).count();
        Ok(())
    }
}

/// Decide per chunk whether a stored vector can be carried over: the same id
/// survives verbatim, or an old chunk of this file had the same content.
fn plan_file(
    writer: &DualIndexWriter,
    models: &[String],
    old_ids: &[ChunkId],
    chunks: Vec<Chunk>,
) -> Vec<Planned> {
    let staged = writer.staged();
    let old_by_hash: HashMap<&str, &ChunkId> = old_ids
        .iter()
        .filter_map(|id| staged.chunk(id).map(|c| (c.content_hash.as_str(), id)))
        .collect();

    chunks
        .into_iter()
        .map(|mut chunk| {
            let source = if staged.chunk(&chunk.chunk_id).is_some() && old_ids.contains(&chunk.chunk_id) {
                Some(chunk.chunk_id.clone())
            } else {
                old_by_hash.get(chunk.content_hash.as_str()).map(|id| (*id).clone())
            };

            let reused = source.and_then(|id| {
                let vectors: Option<BTreeMap<String, Vec<f32>>> = models
                    .iter()
                    .map(|m| writer.vector_of(m, &id).map(|v| (m.clone(), v)))
                    .collect();
                let truncated = staged.chunk(&id).is_some_and(|c| c.truncated);
                vectors.map(|v| (v, truncated))
            });

            match reused {
                Some((vectors, truncated)) => {
                    chunk.truncated = truncated;
                    Planned {
                        chunk,
                        vectors,
                        fresh: false,
                    }
                }
                None => Planned {
                    chunk,
                    vectors: BTreeMap::new(),
                    fresh: true,
                },
            }
        })
        .collect()
}

async fn prepare_batch(
    root: &Path,
    batch: &[(ScannedFile, bool)],
    report: &mut ReindexReport,
) -> Result<Vec<Prepared>> {
    let mut sources = Vec::with_capacity(batch.len());
    for (file, is_new) in batch {
        match read_source(root, &file.file_path).await {
            Ok((text, content_hash)) => sources.push((file.clone(), *is_new, text, content_hash)),
            Err(e) => {
                tracing::warn!(file = %file.file_path, "skipping unreadable file: {e}");
                report.failed_files += 1;
            }
        }
    }

    tokio::task::spawn_blocking(move || {
        sources
            .into_iter()
            .map(|(file, is_new, text, content_hash)| {
                let lang = detect_language(Path::new(&file.file_path));
                let chunks = chunk_file(&file.file_path, &text, lang);
                Prepared {
                    file_path: file.file_path,
                    content_hash,
                    mtime: file.mtime,
                    is_new,
                    chunks,
                }
            })
            .collect()
    })
    .await
    .map_err(|e| IndexError::Other(format!("chunking task failed: {e}")))
}

async fn scan_file(root: &Path, rel: &str) -> Result<ScannedFile> {
    let path = root.join(rel);
    let bytes = tokio::fs::read(&path).await?;
    std::str::from_utf8(&bytes).map_err(|e| IndexError::Parse(format!("{rel}: not UTF-8: {e}")))?;
    let mtime = tokio::fs::metadata(&path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
    Ok(ScannedFile {
        file_path: rel.to_string(),
        content_hash: blake3::hash(&bytes).to_hex().to_string(),
        mtime,
    })
}

async fn read_source(root: &Path, rel: &str) -> Result<(String, String)> {
    let text = tokio::fs::read_to_string(root.join(rel)).await?;
    let hash = blake3_hex(&text);
    Ok((text, hash))
}

fn discard_journal(project: &Project) {
    if let Err(e) = project.store().clear_journal() {
        tracing::warn!("failed to clear reindex journal: {e}");
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::chunk_file;
    use crate::lexical::Bm25Params;
    use crate::vector::{HnswParams, VectorIndex};

    fn base_with(chunks: &[Chunk]) -> IndexState {
        let base = IndexState::empty(
            Bm25Params::default(),
            vec![VectorIndex::new("m", 2, HnswParams::default())],
        );
        let mut w = DualIndexWriter::new(&base);
        for c in chunks {
            let vectors = BTreeMap::from([("m".to_string(), vec![1.0, 0.0])]);
            w.add_chunk(c.clone(), &vectors).unwrap();
        }
        w.set_manifest_entry(ManifestEntry {
            file_path: "a.src".into(),
            content_hash: "h".into(),
            mtime: 0,
            chunk_ids: chunks.iter().map(|c| c.chunk_id.clone()).collect(),
        });
        w.finish().unwrap()
    }

    #[test]
    fn surviving_chunk_reuses_vector() {
        let old = chunk_file("a.src", "function foo(){}", None);
        let state = base_with(&old);
        let writer = DualIndexWriter::new(&state);
        let ids: Vec<ChunkId> = old.iter().map(|c| c.chunk_id.clone()).collect();

        let planned = plan_file(&writer, &["m".to_string()], &ids, old.clone());
        assert_eq!(planned.len(), 1);
        assert!(!planned[0].fresh);
        assert!(planned[0].vectors.contains_key("m"));
    }

    #[test]
    fn same_content_at_new_lines_reuses_vector() {
        let old = chunk_file("a.src", "function foo(){}", None);
        let state = base_with(&old);
        let writer = DualIndexWriter::new(&state);
        let ids: Vec<ChunkId> = old.iter().map(|c| c.chunk_id.clone()).collect();

        let mut moved = old[0].clone();
        moved.start_line = 5;
        moved.end_line = 5;
        moved.chunk_id = ChunkId::derive("a.src", 5, 5, &moved.content_hash);
        let planned = plan_file(&writer, &["m".to_string()], &ids, vec![moved]);
        assert!(!planned[0].fresh);
    }

    #[test]
    fn changed_content_needs_embedding() {
        let old = chunk_file("a.src", "function foo(){}", None);
        let state = base_with(&old);
        let writer = DualIndexWriter::new(&state);
        let ids: Vec<ChunkId> = old.iter().map(|c| c.chunk_id.clone()).collect();

        let new = chunk_file("a.src", "function foo(){ return 1; }", None);
        let planned = plan_file(&writer, &["m".to_string()], &ids, new);
        assert!(planned[0].fresh);
        assert!(planned[0].vectors.is_empty());
    }

    #[test]
    fn report_defaults_are_zero() {
        let report = ReindexReport::default();
        assert_eq!(report.added + report.modified + report.deleted, 0);
        assert_eq!(IndexerConfig::default().batch_size, 32);
    }
}
