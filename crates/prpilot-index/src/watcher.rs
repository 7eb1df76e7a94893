use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use prpilot_llm::EmbeddingProvider;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::reconciler::Reconciler;
use crate::scan::{ScanOptions, is_candidate};

pub struct IndexWatcher {
    _handle: tokio::task::JoinHandle<()>,
}

impl IndexWatcher {
    /// Watch `root` and reconcile `collection` after each debounced batch of
    /// changes to indexable paths.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem watcher cannot be initialized.
    pub fn start<P: EmbeddingProvider + 'static>(
        root: &Path,
        reconciler: Arc<Reconciler<P>>,
        collection: String,
    ) -> Result<Self> {
        let (notify_tx, mut notify_rx) = mpsc::channel::<Vec<PathBuf>>(16);

        let filter_root = root.to_path_buf();
        let registry = Arc::clone(reconciler.registry());
        let options = ScanOptions {
            ignore_dirs: reconciler.config().ignore_dirs.clone(),
            max_file_size: reconciler.config().max_file_size,
        };
        let debounce = Duration::from_millis(reconciler.config().watch_debounce_ms);

        let mut debouncer = new_debouncer(
            debounce,
            move |events: std::result::Result<
                Vec<notify_debouncer_mini::DebouncedEvent>,
                notify::Error,
            >| {
                let events = match events {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("index watcher error: {e}");
                        return;
                    }
                };

                let mut paths: Vec<PathBuf> = events
                    .into_iter()
                    .filter(|e| {
                        e.kind == DebouncedEventKind::Any
                            && is_candidate(&filter_root, &e.path, &registry, &options)
                    })
                    .map(|e| e.path)
                    .collect();
                paths.sort();
                paths.dedup();

                if !paths.is_empty() {
                    let _ = notify_tx.blocking_send(paths);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(root, notify::RecursiveMode::Recursive)?;

        let root = root.to_path_buf();
        let handle = tokio::spawn(async move {
            let _debouncer = debouncer;
            while let Some(mut paths) = notify_rx.recv().await {
                while let Ok(more) = notify_rx.try_recv() {
                    paths.extend(more);
                }
                tracing::debug!(
                    collection = %collection,
                    paths = paths.len(),
                    "change detected, reconciling"
                );
                if let Err(e) = reconciler.reconcile(&root, &collection, false).await {
                    tracing::warn!(collection = %collection, "reconcile failed: {e}");
                }
            }
        });

        Ok(Self { _handle: handle })
    }
}

#[cfg(test)]
mod tests {
    use prpilot_llm::mock::MockEmbedder;

    use super::*;
    use crate::config::IndexConfig;
    use crate::in_memory_store::InMemoryVectorStore;
    use crate::languages::GrammarRegistry;
    use crate::store::IndexStore;
    use crate::vector_store::VectorStore;

    async fn create_test_reconciler() -> Arc<Reconciler<MockEmbedder>> {
        let config = IndexConfig {
            watch_debounce_ms: 100,
            ..IndexConfig::default()
        };
        Arc::new(Reconciler::new(
            Arc::new(GrammarRegistry::builtin()),
            IndexStore::new(":memory:").await.unwrap(),
            Arc::new(InMemoryVectorStore::new()) as Arc<dyn VectorStore>,
            Arc::new(MockEmbedder::new(8)),
            config,
        ))
    }

    #[tokio::test]
    async fn start_with_valid_directory() {
        let dir = tempfile::tempdir().unwrap();
        let watcher =
            IndexWatcher::start(dir.path(), create_test_reconciler().await, "c".into());
        assert!(watcher.is_ok());
    }

    #[tokio::test]
    async fn start_with_nonexistent_directory_fails() {
        let result = IndexWatcher::start(
            Path::new("/nonexistent/path/xyz"),
            create_test_reconciler().await,
            "c".into(),
        );
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn change_triggers_reconcile() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let reconciler = create_test_reconciler().await;
        let _watcher = IndexWatcher::start(&root, Arc::clone(&reconciler), "c".into()).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(root.join("new.py"), "def fresh():\n    pass\n").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let manifest = reconciler.store().load_manifest("c").await.unwrap();
            if manifest.contains_key("new.py") {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "watcher never reconciled");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
