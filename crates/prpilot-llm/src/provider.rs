use std::future::Future;

use crate::error::LlmError;

/// Source of fixed-dimension text embeddings.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts.
    ///
    /// The result holds exactly one vector per input text, in input order.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response does not match the batch.
    fn embed_batch(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, LlmError>> + Send;

    /// Identity of the embedding model; persisted with an index so a model
    /// change can be detected.
    fn model_id(&self) -> &str;

    fn name(&self) -> &'static str;

    /// Embed a single text as a one-element batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying batch call fails or returns nothing.
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, LlmError>> + Send {
        let batch = vec![text.to_owned()];
        async move {
            let mut vectors = self.embed_batch(&batch).await?;
            vectors.pop().ok_or(LlmError::EmptyResponse {
                provider: self.name(),
            })
        }
    }
}
