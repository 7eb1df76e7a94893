//! Test-only deterministic embedding provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::LlmError;
use crate::provider::EmbeddingProvider;

/// Hashing bag-of-words embedder.
///
/// Every alphanumeric token is hashed into one of `dim` buckets and the result
/// is L2-normalised, so texts sharing identifiers land close together. Clones
/// share their counters.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    pub dim: usize,
    pub model: String,
    calls: Arc<AtomicUsize>,
    texts: Arc<AtomicUsize>,
    transient_failures: Arc<AtomicUsize>,
    poison: Arc<Mutex<Option<String>>>,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

impl MockEmbedder {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            model: "mock-embedding".into(),
            calls: Arc::new(AtomicUsize::new(0)),
            texts: Arc::new(AtomicUsize::new(0)),
            transient_failures: Arc::new(AtomicUsize::new(0)),
            poison: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_owned();
        self
    }

    /// Fail the next `n` batch calls with a transient rate-limit error.
    pub fn fail_next(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Permanently reject any batch containing a text with `marker`.
    pub fn poison(&self, marker: Option<&str>) {
        if let Ok(mut guard) = self.poison.lock() {
            *guard = marker.map(str::to_owned);
        }
    }

    /// Number of `embed_batch` invocations so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of texts submitted so far.
    #[must_use]
    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.texts.store(0, Ordering::SeqCst);
    }

    #[must_use]
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim.max(1)];
        let buckets = u64::try_from(v.len()).unwrap_or(1);
        for token in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
        {
            let digest = blake3::hash(token.as_bytes());
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&digest.as_bytes()[..8]);
            let bucket = usize::try_from(u64::from_le_bytes(prefix) % buckets).unwrap_or(0);
            v[bucket] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl EmbeddingProvider for MockEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LlmError::RateLimited);
        }

        let poison = self.poison.lock().ok().and_then(|g| g.clone());
        if let Some(marker) = poison
            && texts.iter().any(|t| t.contains(&marker))
        {
            return Err(LlmError::Other(format!("rejected input containing {marker}")));
        }

        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
