use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::error::Result;

/// Reindexes a project whenever files under it settle after a change.
pub struct IndexWatcher {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl IndexWatcher {
    /// Watch `root` recursively. Bursts of events within `debounce` collapse
    /// into one reindex; events arriving during a reindex queue at most one
    /// follow-up run.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem watcher cannot be initialized.
    pub fn start(root: &Path, engine: Arc<Engine>, debounce: Duration) -> Result<Self> {
        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(1);
        let watched = root.to_path_buf();
        let watched_root = root.to_path_buf();
        let state_dir = engine.registry().config().data_dir.clone();

        let mut debouncer = new_debouncer(
            debounce,
            move |events: std::result::Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
                let events = match events {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("index watcher error: {e}");
                        return;
                    }
                };
                let relevant = events.iter().any(|e| {
                    e.kind == DebouncedEventKind::Any
                        && is_source_event(&e.path, &watched_root, &state_dir)
                });
                if relevant {
                    // A full channel already holds a pending run.
                    let _ = notify_tx.try_send(());
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(root, notify::RecursiveMode::Recursive)?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let _debouncer = debouncer;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    msg = notify_rx.recv() => {
                        if msg.is_none() {
                            break;
                        }
                        match engine.reindex_with_cancel(&watched, &token).await {
                            Ok(report) => tracing::info!(
                                project = %watched.display(),
                                added = report.added,
                                modified = report.modified,
                                deleted = report.deleted,
                                "watch reindex finished"
                            ),
                            Err(e) => tracing::warn!(project = %watched.display(), "watch reindex failed: {e}"),
                        }
                    }
                }
            }
        });

        Ok(Self { cancel, handle })
    }

    /// Stop watching and wait for an in-flight reindex to wind down.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!("index watcher task failed: {e}");
        }
    }
}

/// Events inside hidden directories of the project or the index's own
/// storage never trigger a reindex.
fn is_source_event(path: &Path, root: &Path, state_dir: &Path) -> bool {
    if path.starts_with(state_dir) {
        return false;
    }
    let rel = path.strip_prefix(root).unwrap_or(path);
    !rel.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| s.starts_with('.') && s.len() > 1 && s != "..")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use quarry_embed::{EmbedderPool, ModelSpec};

    use crate::discovery::WalkDiscovery;
    use crate::indexer::{Indexer, IndexerConfig};
    use crate::lexical::Bm25Params;
    use crate::registry::{ProjectRegistry, RegistryConfig};
    use crate::retriever::SearchRequest;
    use crate::vector::HnswParams;

    fn engine(data_dir: &Path) -> Arc<Engine> {
        let pool = Arc::new(EmbedderPool::new(vec![ModelSpec::hash("hash-8", 8)]));
        let registry = ProjectRegistry::new(
            RegistryConfig {
                data_dir: data_dir.to_path_buf(),
                default_model: "hash-8".into(),
                bm25: Bm25Params::default(),
                hnsw: HnswParams::default(),
            },
            Arc::clone(&pool),
        );
        Arc::new(Engine::new(
            registry,
            Indexer::new(pool, IndexerConfig::default()),
            Arc::new(WalkDiscovery::default()),
            SearchRequest::default(),
        ))
    }

    #[test]
    fn hidden_and_state_paths_ignored() {
        let root = Path::new("/work/.tmp123");
        let state = Path::new("/data/quarry");
        assert!(is_source_event(Path::new("/work/.tmp123/src/main.rs"), root, state));
        assert!(!is_source_event(Path::new("/work/.tmp123/.git/index"), root, state));
        assert!(!is_source_event(Path::new("/data/quarry/abc/CURRENT"), root, state));
    }

    #[tokio::test]
    async fn start_and_stop_on_valid_directory() {
        let data = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let watcher =
            IndexWatcher::start(src.path(), engine(data.path()), Duration::from_millis(50)).unwrap();
        watcher.stop().await;
    }

    #[tokio::test]
    async fn start_with_nonexistent_directory_fails() {
        let data = tempfile::tempdir().unwrap();
        let result = IndexWatcher::start(
            Path::new("/nonexistent/path/xyz"),
            engine(data.path()),
            Duration::from_millis(50),
        );
        assert!(result.is_err());
    }
}
