//! Similarity retrieval for a change: whole-diff, stored-vector and
//! re-extracted query modes.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use prpilot_llm::EmbeddingProvider;

use crate::chunker::{Chunk, ChunkerConfig, extract};
use crate::context::contextualize_for_embedding;
use crate::diff::{changed_lines, overlapping_chunks};
use crate::error::{IndexError, Result};
use crate::languages::GrammarRegistry;
use crate::store::IndexStore;
use crate::vector_store::{ScoredVectorPoint, VectorStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrievalMode {
    /// Embed the diff text once.
    #[default]
    Diff,
    /// Reuse the stored vectors of the changed chunks.
    Fast,
    /// Re-embed each changed chunk from its post-change source.
    Precise,
}

impl FromStr for RetrievalMode {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "diff" => Ok(Self::Diff),
            "fast" => Ok(Self::Fast),
            "precise" => Ok(Self::Precise),
            other => Err(IndexError::Config(format!("unknown retrieval mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest {
    pub mode: RetrievalMode,
    pub top_k: usize,
    pub diff_text: String,
    /// Stored chunks touched by the change.
    pub changed: Vec<Chunk>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub chunk_id: String,
    pub score: f32,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub start_byte: usize,
    pub end_byte: usize,
    pub name: String,
    pub kind: String,
    pub text: String,
}

/// Collection name derived from a repository name: `/`, `.` and `-` become `_`.
#[must_use]
pub fn sanitize_collection_name(repo: &str) -> String {
    repo.replace(['/', '.', '-'], "_")
}

/// Deduplicate hits across queries keeping each chunk's best score, then
/// take the `top_k` highest. Ties order by chunk id.
#[must_use]
pub fn merge_results(
    hits: impl IntoIterator<Item = ScoredVectorPoint>,
    top_k: usize,
) -> Vec<ScoredVectorPoint> {
    let mut best: HashMap<String, ScoredVectorPoint> = HashMap::new();
    for hit in hits {
        match best.get(&hit.id) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(hit.id.clone(), hit);
            }
        }
    }
    let mut merged: Vec<ScoredVectorPoint> = best.into_values().collect();
    merged.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    merged.truncate(top_k);
    merged
}

/// Stored chunks overlapping the lines a unified diff touches.
///
/// # Errors
///
/// Returns an error if the chunk table cannot be read.
pub async fn changed_chunks(
    store: &IndexStore,
    collection: &str,
    diff_text: &str,
) -> Result<Vec<Chunk>> {
    let mut out = Vec::new();
    for (path, lines) in changed_lines(diff_text) {
        let chunks = store.chunks_of_file(collection, &path).await?;
        out.extend(overlapping_chunks(&chunks, &lines).into_iter().cloned());
    }
    Ok(out)
}

/// Post-change version of `stored`: same kind and name, nearest start line.
fn rematch<'c>(stored: &Chunk, fresh: &'c [Chunk]) -> Option<&'c Chunk> {
    fresh
        .iter()
        .filter(|c| c.kind == stored.kind && c.name == stored.name)
        .min_by_key(|c| c.start_line.abs_diff(stored.start_line))
}

pub struct Retriever<P> {
    registry: Arc<GrammarRegistry>,
    store: IndexStore,
    vectors: Arc<dyn VectorStore>,
    provider: Arc<P>,
    chunker: ChunkerConfig,
    /// Working tree holding post-change sources for precise mode.
    repo_root: Option<PathBuf>,
    /// Query texts are cut to this many characters before embedding.
    max_query_chars: usize,
}

impl<P: EmbeddingProvider + 'static> Retriever<P> {
    #[must_use]
    pub fn new(
        registry: Arc<GrammarRegistry>,
        store: IndexStore,
        vectors: Arc<dyn VectorStore>,
        provider: Arc<P>,
    ) -> Self {
        Self {
            registry,
            store,
            vectors,
            provider,
            chunker: ChunkerConfig::default(),
            repo_root: None,
            max_query_chars: 8191 * 4,
        }
    }

    #[must_use]
    pub fn with_repo_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.repo_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.chunker = chunker;
        self
    }

    #[must_use]
    pub fn with_max_query_tokens(mut self, tokens: usize) -> Self {
        self.max_query_chars = tokens.saturating_mul(4);
        self
    }

    /// Chunks most similar to the change in `request`.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding, vector search or chunk lookup fails.
    pub async fn retrieve(
        &self,
        collection: &str,
        request: &RetrievalRequest,
    ) -> Result<Vec<QueryResult>> {
        if request.top_k == 0 {
            return Ok(Vec::new());
        }
        if !self.vectors.collection_exists(collection).await? {
            tracing::warn!(collection, "collection has no vectors, nothing to retrieve");
            return Ok(Vec::new());
        }
        let queries = match request.mode {
            RetrievalMode::Diff => self.diff_queries(&request.diff_text).await?,
            RetrievalMode::Fast => self.fast_queries(collection, &request.changed).await?,
            RetrievalMode::Precise => self.precise_queries(&request.changed).await?,
        };

        let queries = if queries.is_empty() && request.mode != RetrievalMode::Diff {
            tracing::debug!(
                mode = ?request.mode,
                "no usable changed chunks, falling back to diff query"
            );
            self.diff_queries(&request.diff_text).await?
        } else {
            queries
        };
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let limit = u64::try_from(request.top_k)?;
        let mut hits = Vec::new();
        for vector in queries {
            hits.extend(self.vectors.search(collection, vector, limit).await?);
        }
        let merged = merge_results(hits, request.top_k);
        let results = self.hydrate(collection, merged).await?;
        tracing::debug!(
            collection,
            mode = ?request.mode,
            results = results.len(),
            "retrieval complete"
        );
        Ok(results)
    }

    async fn diff_queries(&self, diff_text: &str) -> Result<Vec<Vec<f32>>> {
        if diff_text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let text: String = diff_text
            .replace('\n', " ")
            .chars()
            .take(self.max_query_chars)
            .collect();
        let vector = self.provider.embed(&text).await?;
        Ok(vec![vector])
    }

    async fn fast_queries(&self, collection: &str, changed: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        if changed.is_empty() {
            return Ok(Vec::new());
        }
        let ids = changed.iter().map(|c| c.id.clone()).collect();
        let mut stored = self.vectors.fetch_vectors(collection, ids).await?;
        let mut seen = BTreeSet::new();
        let queries: Vec<Vec<f32>> = changed
            .iter()
            .filter(|c| seen.insert(c.id.as_str()))
            .filter_map(|c| stored.remove(&c.id))
            .collect();
        if queries.len() < seen.len() {
            tracing::debug!(
                missing = seen.len() - queries.len(),
                "changed chunks without stored vectors"
            );
        }
        Ok(queries)
    }

    async fn precise_queries(&self, changed: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        let mut fresh_by_file: HashMap<&str, (String, Vec<Chunk>)> = HashMap::new();
        let mut queries = Vec::with_capacity(changed.len());
        for chunk in changed {
            if !fresh_by_file.contains_key(chunk.file_path.as_str()) {
                let fresh = self.reextract(&chunk.file_path).await;
                fresh_by_file.insert(chunk.file_path.as_str(), fresh);
            }
            let (imports, fresh) = fresh_by_file
                .get(chunk.file_path.as_str())
                .map(|(i, f)| (i.as_str(), f.as_slice()))
                .unwrap_or_default();
            let current = rematch(chunk, fresh).unwrap_or(chunk);
            let text: String = contextualize_for_embedding(current, imports)
                .chars()
                .take(self.max_query_chars)
                .collect();
            queries.push(self.provider.embed(&text).await?);
        }
        Ok(queries)
    }

    /// Imports and chunks of the post-change file, empty when unavailable.
    async fn reextract(&self, rel_path: &str) -> (String, Vec<Chunk>) {
        let Some(root) = self.repo_root.as_deref() else {
            return (String::new(), Vec::new());
        };
        let abs: PathBuf = root.join(rel_path);
        let source = match tokio::fs::read_to_string(&abs).await {
            Ok(source) => source,
            Err(e) => {
                tracing::debug!(file = %rel_path, "post-change source unavailable: {e}");
                return (String::new(), Vec::new());
            }
        };
        let entry = match self.registry.lookup(Path::new(rel_path)) {
            crate::languages::Lookup::Language(entry) => Some(entry),
            _ => None,
        };
        let extraction = extract(entry, rel_path, &source, &self.chunker);
        (extraction.imports, extraction.chunks)
    }

    async fn hydrate(
        &self,
        collection: &str,
        merged: Vec<ScoredVectorPoint>,
    ) -> Result<Vec<QueryResult>> {
        let ids: Vec<String> = merged.iter().map(|h| h.id.clone()).collect();
        let chunks: HashMap<String, Chunk> = self
            .store
            .chunks_by_ids(collection, &ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        Ok(merged
            .into_iter()
            .filter_map(|hit| {
                let chunk = chunks.get(&hit.id)?;
                Some(QueryResult {
                    chunk_id: hit.id,
                    score: hit.score,
                    file_path: chunk.file_path.clone(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    start_byte: chunk.start_byte,
                    end_byte: chunk.end_byte,
                    name: chunk.name.clone(),
                    kind: chunk.kind.as_str().to_string(),
                    text: chunk.text.clone(),
                })
            })
            .collect())
    }
}
