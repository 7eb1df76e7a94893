//! Batched, bounded-concurrency embedding with transient-error retry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use prpilot_llm::retry::retry_transient;
use prpilot_llm::{EmbeddingProvider, LlmError};
use tokio::task::JoinSet;

/// Rough token count used for the embedding size guard.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

#[derive(Debug, Clone)]
pub struct EmbedOptions {
    pub batch_size: usize,
    /// Batches in flight at once.
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            concurrency: 4,
            max_retries: 3,
            retry_base: Duration::from_millis(500),
        }
    }
}

/// Vectors in input order; `None` where the batch failed for good.
#[derive(Debug, Default)]
pub struct EmbedResults {
    pub vectors: Vec<Option<Vec<f32>>>,
    pub failed_batches: usize,
    pub errors: Vec<String>,
}

pub struct BatchEmbedder<P> {
    provider: Arc<P>,
    options: EmbedOptions,
}

impl<P: EmbeddingProvider + 'static> BatchEmbedder<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, options: EmbedOptions) -> Self {
        Self { provider, options }
    }

    /// Embed `texts` in batches with at most `concurrency` requests in
    /// flight. A batch whose retries are exhausted leaves its slots `None`;
    /// other batches are unaffected.
    pub async fn embed(&self, texts: Vec<String>) -> EmbedResults {
        let total = texts.len();
        let mut results = EmbedResults {
            vectors: vec![None; total],
            ..EmbedResults::default()
        };
        if texts.is_empty() {
            return results;
        }

        let batch_size = self.options.batch_size.max(1);
        let concurrency = self.options.concurrency.max(1);
        let mut pending: HashSet<usize> = HashSet::new();
        let mut set: JoinSet<(usize, Result<Vec<Vec<f32>>, LlmError>)> = JoinSet::new();

        let mut texts = texts.into_iter();
        let mut start = 0;
        while start < total {
            while set.len() >= concurrency {
                if let Some(joined) = set.join_next().await {
                    Self::collect(joined, &mut pending, &mut results, batch_size);
                }
            }

            let batch: Vec<String> = texts.by_ref().take(batch_size).collect();
            let len = batch.len();
            let provider = Arc::clone(&self.provider);
            let max_retries = self.options.max_retries;
            let base = self.options.retry_base;
            pending.insert(start);
            set.spawn(async move {
                let result =
                    retry_transient(max_retries, base, || provider.embed_batch(&batch)).await;
                let result = result.and_then(|vectors| {
                    if vectors.len() == len {
                        Ok(vectors)
                    } else {
                        Err(LlmError::CountMismatch {
                            expected: len,
                            actual: vectors.len(),
                        })
                    }
                });
                (start, result)
            });
            start += len;
        }

        while let Some(joined) = set.join_next().await {
            Self::collect(joined, &mut pending, &mut results, batch_size);
        }

        // Tasks that panicked never reported their batch.
        for start in pending {
            results.failed_batches += 1;
            results
                .errors
                .push(format!("embedding batch at {start} aborted"));
        }

        tracing::debug!(
            texts = total,
            failed_batches = results.failed_batches,
            "embedding pass complete"
        );
        results
    }

    fn collect(
        joined: Result<(usize, Result<Vec<Vec<f32>>, LlmError>), tokio::task::JoinError>,
        pending: &mut HashSet<usize>,
        results: &mut EmbedResults,
        batch_size: usize,
    ) {
        let (start, outcome) = match joined {
            Ok(done) => done,
            Err(e) => {
                tracing::error!("embedding task failed: {e}");
                return;
            }
        };
        pending.remove(&start);
        match outcome {
            Ok(vectors) => {
                for (offset, vector) in vectors.into_iter().enumerate() {
                    results.vectors[start + offset] = Some(vector);
                }
            }
            Err(e) => {
                tracing::warn!(
                    batch_start = start,
                    batch_size,
                    "embedding batch failed: {e}"
                );
                results.failed_batches += 1;
                results.errors.push(format!("embedding batch at {start}: {e}"));
            }
        }
    }
}
