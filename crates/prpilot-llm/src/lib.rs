//! Embedding provider abstraction and an OpenAI-compatible HTTP backend.

pub mod error;
pub mod http;
#[cfg(feature = "mock")]
pub mod mock;
pub mod openai;
pub mod provider;
pub mod retry;

pub use error::LlmError;
pub use provider::EmbeddingProvider;
