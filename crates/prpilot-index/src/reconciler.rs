//! Incremental index reconciliation: diff → retract → extract → embed → commit.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use prpilot_llm::EmbeddingProvider;
use rayon::prelude::*;

use crate::callgraph::{CallGraphBuilder, RawCall, SourceFile};
use crate::chunker::{Chunk, ChunkerConfig, extract};
use crate::config::IndexConfig;
use crate::context::contextualize_for_embedding;
use crate::embedder::{BatchEmbedder, EmbedOptions, estimate_tokens};
use crate::error::{IndexError, Result};
use crate::languages::{GrammarRegistry, TEXT_LANGUAGE, Tier};
use crate::scan::{ScanOptions, ScannedFile, scan};
use crate::store::{CollectionMeta, FileRecord, IndexStore, unix_now};
use crate::vector_store::{CHUNK_ID_KEY, FILE_PATH_KEY, VectorPoint, VectorStore};

/// Summary of one reconcile run.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Unreadable or policy-excluded files.
    pub skipped: usize,
    /// Files left unindexed this run after embedding failures.
    pub failed: usize,
    /// Tier-1 files indexed as paragraphs after a parse failure.
    pub degraded: usize,
    pub chunks_embedded: usize,
    pub chunks_reused: usize,
    /// Chunks indexed without a vector because they exceed the token cap.
    pub chunks_oversized: usize,
    pub edges_written: usize,
    /// Inbound edges demoted to unresolved by retraction.
    pub edges_demoted: u64,
    /// Stored embedding model differed, forcing a full run.
    pub model_changed: bool,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl ReconcileReport {
    /// Whether the run added, modified or deleted anything.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.added + self.modified + self.deleted > 0
    }
}

/// A file after extraction and call analysis.
#[derive(Debug)]
struct ExtractedFile {
    path: String,
    language: String,
    tier: Tier,
    degraded: bool,
    content_hash: String,
    imports: String,
    chunks: Vec<Chunk>,
    calls: Vec<RawCall>,
}

/// Files that differ from the manifest.
#[derive(Debug, Default)]
struct ChangeSet {
    /// Added and modified files, in scan order.
    changed: Vec<ScannedFile>,
    added: Vec<String>,
    modified: Vec<String>,
    deleted: Vec<String>,
}

/// Where a chunk's vector comes from.
enum VectorSource {
    Reused(Vec<f32>),
    Job(usize),
    Oversized,
}

/// Vector sources per extracted file, with the embedding results they point
/// into.
struct FileVectors {
    sources: Vec<Vec<VectorSource>>,
    embedded: Vec<Option<Vec<f32>>>,
    /// Indexes into the extracted files with at least one failed embedding.
    failed_files: HashSet<usize>,
}

/// Keeps one collection's vectors, chunks, graph and manifest in step with
/// a working tree.
pub struct Reconciler<P> {
    registry: Arc<GrammarRegistry>,
    store: IndexStore,
    vectors: Arc<dyn VectorStore>,
    provider: Arc<P>,
    callgraph: Arc<CallGraphBuilder>,
    config: IndexConfig,
}

impl<P: EmbeddingProvider + 'static> Reconciler<P> {
    #[must_use]
    pub fn new(
        registry: Arc<GrammarRegistry>,
        store: IndexStore,
        vectors: Arc<dyn VectorStore>,
        provider: Arc<P>,
        config: IndexConfig,
    ) -> Self {
        let callgraph = Arc::new(CallGraphBuilder::new(&config.external_tools));
        Self {
            registry,
            store,
            vectors,
            provider,
            callgraph,
            config,
        }
    }

    #[must_use]
    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<GrammarRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            ignore_dirs: self.config.ignore_dirs.clone(),
            max_file_size: self.config.max_file_size,
        }
    }

    fn embed_options(&self) -> EmbedOptions {
        EmbedOptions {
            batch_size: self.config.embed_batch_size,
            concurrency: self.config.embed_concurrency,
            max_retries: self.config.max_retries,
            retry_base: Duration::from_millis(self.config.retry_base_ms),
        }
    }

    /// Bring `collection` up to date with the tree at `root`.
    ///
    /// A run with no changes performs no writes. Files whose embeddings fail
    /// are left out of the manifest and retried on the next run.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read, the vector store is
    /// unreachable, or a commit fails. No manifest entry is written for a file
    /// whose commit did not complete.
    pub async fn reconcile(
        &self,
        root: &Path,
        collection: &str,
        force_full: bool,
    ) -> Result<ReconcileReport> {
        let started = std::time::Instant::now();
        let mut report = ReconcileReport::default();

        let meta = self.store.collection_meta(collection).await?;
        let model_id = self.provider.model_id().to_string();
        report.model_changed = meta.as_ref().is_some_and(|m| m.model_id != model_id);
        if report.model_changed {
            tracing::info!(
                collection,
                model = %model_id,
                "embedding model changed, rebuilding collection"
            );
        }

        let plan = self
            .diff(root, collection, force_full || report.model_changed, &mut report)
            .await?;
        if !report.changed() {
            report.duration_ms = elapsed_ms(started);
            tracing::info!(
                collection,
                unchanged = report.unchanged,
                skipped = report.skipped,
                "index up to date"
            );
            return Ok(report);
        }

        let mut collection_exists = self.vectors.collection_exists(collection).await?;
        if report.model_changed && collection_exists {
            self.vectors.delete_collection(collection).await?;
            collection_exists = false;
        }

        let reuse = self
            .retract(collection, &plan, collection_exists, &mut report)
            .await?;

        let extracted = self.extract_all(plan.changed).await?;
        report.degraded = extracted.iter().filter(|f| f.degraded).count();

        let vectors = self.embed_changed(&extracted, &reuse, &mut report).await;

        let dimension = meta
            .as_ref()
            .filter(|_| !report.model_changed)
            .map_or(0, |m| m.dimension);
        let dimension = self
            .commit(
                collection,
                &extracted,
                vectors,
                collection_exists,
                dimension,
                &mut report,
            )
            .await?;

        self.store
            .relink(collection, self.config.resolution_policy)
            .await?;
        self.store
            .put_collection_meta(&CollectionMeta {
                name: collection.to_string(),
                model_id,
                dimension,
                built_at: unix_now(),
            })
            .await?;

        report.duration_ms = elapsed_ms(started);
        tracing::info!(
            collection,
            added = report.added,
            modified = report.modified,
            deleted = report.deleted,
            unchanged = report.unchanged,
            skipped = report.skipped,
            failed = report.failed,
            embedded = report.chunks_embedded,
            reused = report.chunks_reused,
            edges = report.edges_written,
            duration_ms = report.duration_ms,
            "reconcile complete"
        );
        Ok(report)
    }

    /// Scan the tree and compare it with the stored manifest.
    async fn diff(
        &self,
        root: &Path,
        collection: &str,
        full: bool,
        report: &mut ReconcileReport,
    ) -> Result<ChangeSet> {
        let manifest = self.store.load_manifest(collection).await?;
        let scanned = {
            let root: PathBuf = root.to_path_buf();
            let registry = Arc::clone(&self.registry);
            let options = self.scan_options();
            tokio::task::spawn_blocking(move || scan(&root, &registry, &options)).await?
        };
        report.skipped = scanned.failures.len() + scanned.excluded;
        for failure in &scanned.failures {
            report
                .errors
                .push(format!("{}: {}", failure.rel_path, failure.reason));
        }

        let unreadable: HashSet<&str> = scanned
            .failures
            .iter()
            .map(|f| f.rel_path.as_str())
            .collect();
        let present: HashSet<&str> = scanned.files.iter().map(|f| f.rel_path.as_str()).collect();
        let mut plan = ChangeSet::default();
        for file in &scanned.files {
            match manifest.get(&file.rel_path) {
                None => {
                    report.added += 1;
                    plan.added.push(file.rel_path.clone());
                    plan.changed.push(file.clone());
                }
                Some(hash) if full || *hash != file.content_hash => {
                    report.modified += 1;
                    plan.modified.push(file.rel_path.clone());
                    plan.changed.push(file.clone());
                }
                Some(_) => report.unchanged += 1,
            }
        }
        plan.deleted = manifest
            .keys()
            .filter(|p| !present.contains(p.as_str()) && !unreadable.contains(p.as_str()))
            .cloned()
            .collect();
        plan.deleted.sort();
        report.deleted = plan.deleted.len();
        Ok(plan)
    }

    /// Remove every trace of modified and deleted files, returning the old
    /// vectors of modified files keyed by chunk content hash.
    ///
    /// Added paths lose any vectors left behind by an interrupted commit.
    async fn retract(
        &self,
        collection: &str,
        plan: &ChangeSet,
        collection_exists: bool,
        report: &mut ReconcileReport,
    ) -> Result<HashMap<String, HashMap<String, Vec<f32>>>> {
        let mut reuse = HashMap::new();
        if collection_exists {
            for path in &plan.modified {
                reuse.insert(path.clone(), self.old_vectors(collection, path).await?);
            }
            for path in &plan.added {
                self.vectors.delete_by_file(collection, path).await?;
            }
        }
        for path in plan.modified.iter().chain(&plan.deleted) {
            if collection_exists {
                self.vectors.delete_by_file(collection, path).await?;
            }
            report.edges_demoted += self.store.retract_file(collection, path).await?;
            tracing::debug!(file = %path, "retracted");
        }
        Ok(reuse)
    }

    /// Decide per chunk whether its vector is reused, embedded or skipped.
    /// Returns the texts to embed, the file index of each text, and one
    /// source per chunk.
    fn plan_vectors(
        &self,
        extracted: &[ExtractedFile],
        reuse: &HashMap<String, HashMap<String, Vec<f32>>>,
        report: &mut ReconcileReport,
    ) -> (Vec<String>, Vec<usize>, Vec<Vec<VectorSource>>) {
        let max_tokens = self.config.max_embed_tokens;
        let mut texts: Vec<String> = Vec::new();
        let mut job_file: Vec<usize> = Vec::new();
        let mut sources: Vec<Vec<VectorSource>> = Vec::with_capacity(extracted.len());
        for (file_idx, file) in extracted.iter().enumerate() {
            let old = reuse.get(&file.path);
            let mut per_chunk = Vec::with_capacity(file.chunks.len());
            for chunk in &file.chunks {
                let text = contextualize_for_embedding(chunk, &file.imports);
                let tokens = estimate_tokens(&text);
                if tokens > max_tokens {
                    tracing::warn!(
                        file = %file.path,
                        chunk = %chunk.name,
                        tokens,
                        "chunk exceeds embedding token limit, indexing without vector"
                    );
                    report.chunks_oversized += 1;
                    per_chunk.push(VectorSource::Oversized);
                } else if let Some(vector) = old.and_then(|m| m.get(&chunk.content_hash)) {
                    report.chunks_reused += 1;
                    per_chunk.push(VectorSource::Reused(vector.clone()));
                } else {
                    per_chunk.push(VectorSource::Job(texts.len()));
                    texts.push(text);
                    job_file.push(file_idx);
                }
            }
            sources.push(per_chunk);
        }
        (texts, job_file, sources)
    }

    /// Embed every chunk that cannot reuse a stored vector.
    async fn embed_changed(
        &self,
        extracted: &[ExtractedFile],
        reuse: &HashMap<String, HashMap<String, Vec<f32>>>,
        report: &mut ReconcileReport,
    ) -> FileVectors {
        let (texts, job_file, sources) = self.plan_vectors(extracted, reuse, report);
        let embedder = BatchEmbedder::new(Arc::clone(&self.provider), self.embed_options());
        let embedded = embedder.embed(texts).await;
        report.errors.extend(embedded.errors);
        let mut failed_files: HashSet<usize> = HashSet::new();
        for (job, vector) in embedded.vectors.iter().enumerate() {
            if vector.is_some() {
                report.chunks_embedded += 1;
            } else {
                failed_files.insert(job_file[job]);
            }
        }
        FileVectors {
            sources,
            embedded: embedded.vectors,
            failed_files,
        }
    }

    /// Upsert vectors and commit each file whose embeddings all succeeded.
    /// Returns the collection's vector dimension.
    async fn commit(
        &self,
        collection: &str,
        extracted: &[ExtractedFile],
        vectors: FileVectors,
        mut collection_exists: bool,
        mut dimension: u64,
        report: &mut ReconcileReport,
    ) -> Result<u64> {
        let FileVectors {
            sources,
            embedded,
            failed_files,
        } = vectors;
        for (file_idx, (file, per_chunk)) in extracted.iter().zip(sources).enumerate() {
            if failed_files.contains(&file_idx) {
                report.failed += 1;
                tracing::warn!(file = %file.path, "embedding failed, will retry next run");
                continue;
            }

            let mut points = Vec::new();
            for (chunk, source) in file.chunks.iter().zip(per_chunk) {
                let vector = match source {
                    VectorSource::Reused(v) => v,
                    VectorSource::Job(job) => match embedded.get(job).cloned().flatten() {
                        Some(v) => v,
                        None => continue,
                    },
                    VectorSource::Oversized => continue,
                };
                points.push(VectorPoint {
                    id: chunk.id.clone(),
                    payload: chunk_payload(chunk),
                    vector,
                });
            }

            if let Some(first) = points.first() {
                let dim = u64::try_from(first.vector.len())?;
                if !collection_exists {
                    self.vectors.ensure_collection(collection, dim).await?;
                    collection_exists = true;
                }
                dimension = dim;
                self.vectors.upsert(collection, points).await?;
            }

            let record = FileRecord {
                path: file.path.clone(),
                language: file.language.clone(),
                tier: file.tier,
                content_hash: file.content_hash.clone(),
                chunk_ids: file.chunks.iter().map(|c| c.id.clone()).collect(),
                indexed_at: unix_now(),
            };
            self.store
                .commit_file(collection, &record, &file.chunks, &file.calls)
                .await?;
            report.edges_written += file.calls.len();
            tracing::debug!(
                file = %file.path,
                chunks = file.chunks.len(),
                calls = file.calls.len(),
                "committed"
            );
        }
        Ok(dimension)
    }

    /// Content hash → stored vector for a file's current chunks.
    async fn old_vectors(&self, collection: &str, path: &str) -> Result<HashMap<String, Vec<f32>>> {
        let old_chunks = self.store.chunks_of_file(collection, path).await?;
        if old_chunks.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = old_chunks.iter().map(|c| c.id.clone()).collect();
        let mut stored = self.vectors.fetch_vectors(collection, ids).await?;
        Ok(old_chunks
            .into_iter()
            .filter_map(|c| stored.remove(&c.id).map(|v| (c.content_hash, v)))
            .collect())
    }

    async fn extract_all(&self, files: Vec<ScannedFile>) -> Result<Vec<ExtractedFile>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let registry = Arc::clone(&self.registry);
        let callgraph = Arc::clone(&self.callgraph);
        let chunker = self.config.chunker();
        let workers = self.config.workers.max(1);

        tokio::task::spawn_blocking(move || {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|e| IndexError::Other(format!("worker pool: {e}")))?;
            Ok(pool.install(|| {
                files
                    .par_iter()
                    .map(|file| extract_file(&registry, &callgraph, &chunker, file))
                    .collect()
            }))
        })
        .await?
    }
}

fn extract_file(
    registry: &GrammarRegistry,
    callgraph: &CallGraphBuilder,
    chunker: &ChunkerConfig,
    file: &ScannedFile,
) -> ExtractedFile {
    let entry = file.language.and_then(|id| registry.get(id));
    let extraction = extract(entry, &file.rel_path, &file.source, chunker);

    let calls = match (entry, extraction.tree.as_ref()) {
        (Some(entry), Some(tree)) => callgraph.extract(
            &SourceFile {
                path: &file.rel_path,
                abs_path: &file.abs_path,
                source: &file.source,
                entry,
                tree: Some(tree),
            },
            &extraction.chunks,
        ),
        _ => Vec::new(),
    };

    ExtractedFile {
        path: file.rel_path.clone(),
        language: entry.map_or(TEXT_LANGUAGE, |e| e.id).to_string(),
        tier: extraction.tier,
        degraded: extraction.degraded,
        content_hash: file.content_hash.clone(),
        imports: extraction.imports,
        chunks: extraction.chunks,
        calls,
    }
}

fn chunk_payload(chunk: &Chunk) -> HashMap<String, serde_json::Value> {
    HashMap::from([
        (CHUNK_ID_KEY.to_string(), chunk.id.clone().into()),
        (FILE_PATH_KEY.to_string(), chunk.file_path.clone().into()),
        ("name".to_string(), chunk.name.clone().into()),
        ("kind".to_string(), chunk.kind.as_str().into()),
        ("language".to_string(), chunk.language.clone().into()),
        ("start_line".to_string(), chunk.start_line.into()),
        ("end_line".to_string(), chunk.end_line.into()),
        ("content_hash".to_string(), chunk.content_hash.clone().into()),
    ])
}

fn elapsed_ms(started: std::time::Instant) -> u64 {
    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}
