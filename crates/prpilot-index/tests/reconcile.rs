use std::fs;
use std::path::Path;
use std::sync::Arc;

use prpilot_index::chunker::ChunkKind;
use prpilot_index::config::IndexConfig;
use prpilot_index::in_memory_store::InMemoryVectorStore;
use prpilot_index::languages::GrammarRegistry;
use prpilot_index::retriever::changed_chunks;
use prpilot_index::store::EdgeKind;
use prpilot_index::{
    DependencyGraph, Direction, IndexStore, RetrievalMode, RetrievalRequest, Reconciler,
    Retriever, VectorStore,
};
use prpilot_llm::mock::MockEmbedder;
use tempfile::TempDir;

const COLLECTION: &str = "repo";

struct Harness {
    repo: TempDir,
    _db: TempDir,
    store: IndexStore,
    vectors: Arc<InMemoryVectorStore>,
    mock: Arc<MockEmbedder>,
    reconciler: Reconciler<MockEmbedder>,
}

impl Harness {
    async fn new() -> Self {
        let repo = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        let db_path = db.path().join("index.db");
        let store = IndexStore::new(db_path.to_str().unwrap()).await.unwrap();
        let vectors = Arc::new(InMemoryVectorStore::new());
        let mock = Arc::new(MockEmbedder::new(32));
        let config = IndexConfig {
            workers: 2,
            retry_base_ms: 1,
            ..IndexConfig::default()
        };
        let reconciler = Reconciler::new(
            Arc::new(GrammarRegistry::builtin()),
            store.clone(),
            Arc::clone(&vectors) as Arc<dyn VectorStore>,
            Arc::clone(&mock),
            config,
        );
        Self {
            repo,
            _db: db,
            store,
            vectors,
            mock,
            reconciler,
        }
    }

    fn root(&self) -> &Path {
        self.repo.path()
    }

    fn write(&self, rel: &str, contents: &str) {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    async fn reconcile(&self) -> prpilot_index::ReconcileReport {
        self.reconciler
            .reconcile(self.root(), COLLECTION, false)
            .await
            .unwrap()
    }

    fn retriever(&self) -> Retriever<MockEmbedder> {
        Retriever::new(
            Arc::new(GrammarRegistry::builtin()),
            self.store.clone(),
            Arc::clone(&self.vectors) as Arc<dyn VectorStore>,
            Arc::clone(&self.mock),
        )
        .with_repo_root(self.root())
    }
}

fn seed(h: &Harness) {
    h.write(
        "src/app.py",
        "import os\n\n\ndef main():\n    return run()\n\n\ndef run():\n    return os.getcwd()\n",
    );
    h.write(
        "src/util.js",
        "function add(a, b) {\n  return a + b;\n}\n\nfunction twice(x) {\n  return add(x, x);\n}\n",
    );
    h.write("README.md", "# Demo\n\nA small repository.\n");
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    let h = Harness::new().await;
    seed(&h);

    let first = h.reconcile().await;
    assert_eq!(first.added, 3);
    assert!(first.chunks_embedded > 0);

    let writes = h.vectors.write_count();
    h.mock.reset_counters();
    let second = h.reconcile().await;

    assert!(!second.changed());
    assert_eq!(second.unchanged, 3);
    assert_eq!(second.chunks_embedded, 0);
    assert_eq!(h.mock.calls(), 0);
    assert_eq!(h.vectors.write_count(), writes);
}

#[tokio::test]
async fn one_byte_change_touches_only_that_file() {
    let h = Harness::new().await;
    seed(&h);
    h.reconcile().await;

    let before_js = h.store.chunks_of_file(COLLECTION, "src/util.js").await.unwrap();
    h.write("README.md", "# Demo\n\nA small repository!\n");
    let report = h.reconcile().await;

    assert_eq!(report.modified, 1);
    assert_eq!(report.unchanged, 2);
    assert_eq!(report.added + report.deleted, 0);
    let after_js = h.store.chunks_of_file(COLLECTION, "src/util.js").await.unwrap();
    assert_eq!(before_js, after_js);

    let manifest = h.store.load_manifest(COLLECTION).await.unwrap();
    assert_eq!(
        manifest["README.md"],
        blake3::hash(b"# Demo\n\nA small repository!\n").to_hex().to_string()
    );
}

#[tokio::test]
async fn shifted_definition_replaces_old_vectors() {
    let h = Harness::new().await;
    seed(&h);
    h.reconcile().await;

    let old_ids: Vec<String> = h
        .store
        .chunks_of_file(COLLECTION, "src/app.py")
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(old_ids.len(), 2);
    assert_eq!(
        h.vectors
            .fetch_vectors(COLLECTION, old_ids.clone())
            .await
            .unwrap()
            .len(),
        2
    );

    // One extra byte before both definitions moves their start offsets.
    h.write(
        "src/app.py",
        "import os\n\n\n\ndef main():\n    return run()\n\n\ndef run():\n    return os.getcwd()\n",
    );
    let report = h.reconcile().await;
    assert_eq!(report.modified, 1);

    assert!(
        h.vectors
            .fetch_vectors(COLLECTION, old_ids.clone())
            .await
            .unwrap()
            .is_empty()
    );
    let new_ids: Vec<String> = h
        .store
        .chunks_of_file(COLLECTION, "src/app.py")
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(new_ids.len(), 2);
    assert!(new_ids.iter().all(|id| !old_ids.contains(id)));
    assert_eq!(
        h.vectors
            .fetch_vectors(COLLECTION, new_ids)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn deleted_file_leaves_no_trace() {
    let h = Harness::new().await;
    seed(&h);
    h.reconcile().await;

    let js_ids: Vec<String> = h
        .store
        .chunks_of_file(COLLECTION, "src/util.js")
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert!(!js_ids.is_empty());

    fs::remove_file(h.root().join("src/util.js")).unwrap();
    let report = h.reconcile().await;
    assert_eq!(report.deleted, 1);

    assert!(
        h.store
            .chunks_of_file(COLLECTION, "src/util.js")
            .await
            .unwrap()
            .is_empty()
    );
    assert!(h.store.raw_calls(COLLECTION, "src/util.js").await.unwrap().is_empty());
    assert!(
        h.vectors
            .fetch_vectors(COLLECTION, js_ids)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        !h.store
            .load_manifest(COLLECTION)
            .await
            .unwrap()
            .contains_key("src/util.js")
    );
}

#[tokio::test]
async fn syntax_error_degrades_to_paragraphs() {
    let h = Harness::new().await;
    h.write("broken.py", "def broken(:\n    pass\n\nclass Fine:\n    pass\n");
    let report = h.reconcile().await;

    assert_eq!(report.degraded, 1);
    let chunks = h.store.chunks_of_file(COLLECTION, "broken.py").await.unwrap();
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| c.kind == ChunkKind::Paragraph));
    assert!(chunks.iter().all(|c| c.language == "python"));
    assert!(h.store.raw_calls(COLLECTION, "broken.py").await.unwrap().is_empty());
}

#[tokio::test]
async fn cross_file_edge_resolves_then_demotes() {
    let h = Harness::new().await;
    h.write("a.py", "from b import helper\n\n\ndef main():\n    return helper()\n");
    h.write("b.py", "def helper():\n    return 1\n");
    h.reconcile().await;

    let main_id = h.store.chunks_of_file(COLLECTION, "a.py").await.unwrap()[0]
        .id
        .clone();
    let helper_id = h.store.chunks_of_file(COLLECTION, "b.py").await.unwrap()[0]
        .id
        .clone();

    let edges = h.store.call_edges(COLLECTION).await.unwrap();
    let edge = edges.iter().find(|e| e.call.callee == "helper").unwrap();
    assert_eq!(edge.call.caller, main_id);
    assert_eq!(edge.target.as_deref(), Some(helper_id.as_str()));
    assert_eq!(edge.kind(), EdgeKind::DirectCall);

    let graph = DependencyGraph::load(&h.store, COLLECTION).await.unwrap();
    let reached = graph.reachable(std::slice::from_ref(&main_id), 1, Direction::Callees);
    assert_eq!(reached.len(), 1);
    assert_eq!(reached[0].chunk_id, helper_id);

    fs::remove_file(h.root().join("b.py")).unwrap();
    let report = h.reconcile().await;
    assert_eq!(report.deleted, 1);
    assert_eq!(report.edges_demoted, 1);

    let edges = h.store.call_edges(COLLECTION).await.unwrap();
    let edge = edges.iter().find(|e| e.call.callee == "helper").unwrap();
    assert_eq!(edge.target, None);
    assert_eq!(edge.kind(), EdgeKind::Unresolved);

    let graph = DependencyGraph::load(&h.store, COLLECTION).await.unwrap();
    let reached = graph.reachable(std::slice::from_ref(&main_id), 1, Direction::Callees);
    assert!(reached.is_empty());

    h.write("b.py", "def helper():\n    return 2\n");
    h.reconcile().await;
    let edges = h.store.call_edges(COLLECTION).await.unwrap();
    let edge = edges.iter().find(|e| e.call.callee == "helper").unwrap();
    assert!(edge.target.is_some());
}

#[tokio::test]
async fn retrieval_embed_calls_per_mode() {
    let h = Harness::new().await;
    seed(&h);
    h.reconcile().await;

    let diff = "\
--- a/src/app.py
+++ b/src/app.py
@@ -4,6 +4,6 @@
 def main():
-    return run()
+    return run() or 0


 def run():
-    return os.getcwd()
+    return os.getcwd() + '/'
";
    h.write(
        "src/app.py",
        "import os\n\n\ndef main():\n    return run() or 0\n\n\ndef run():\n    return os.getcwd() + '/'\n",
    );
    let changed = changed_chunks(&h.store, COLLECTION, diff).await.unwrap();
    let names: Vec<&str> = changed.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["main", "run"]);

    let retriever = h.retriever();
    let mut request = RetrievalRequest {
        mode: RetrievalMode::Fast,
        top_k: 3,
        diff_text: diff.to_string(),
        changed,
    };

    h.mock.reset_counters();
    let fast = retriever.retrieve(COLLECTION, &request).await.unwrap();
    assert_eq!(h.mock.calls(), 0);
    assert!(!fast.is_empty());
    assert!(fast.len() <= 3);
    assert!(fast.windows(2).all(|w| w[0].score >= w[1].score));

    request.mode = RetrievalMode::Precise;
    h.mock.reset_counters();
    let precise = retriever.retrieve(COLLECTION, &request).await.unwrap();
    assert_eq!(h.mock.calls(), 2);
    assert!(!precise.is_empty());

    request.mode = RetrievalMode::Diff;
    h.mock.reset_counters();
    let by_diff = retriever.retrieve(COLLECTION, &request).await.unwrap();
    assert_eq!(h.mock.calls(), 1);
    assert!(!by_diff.is_empty());
    let hit = &by_diff[0];
    assert!(hit.start_line >= 1 && hit.end_line >= hit.start_line);
    assert!(!hit.text.is_empty());
}
