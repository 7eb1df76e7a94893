#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("{provider} returned HTTP {status}")]
    Status { provider: &'static str, status: u16 },

    #[error("empty response from {provider}")]
    EmptyResponse { provider: &'static str },

    #[error("expected {expected} embeddings, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Whether retrying the same request later may succeed.
    ///
    /// Rate limiting, timeouts, connection failures and server-side errors are
    /// transient; malformed responses and client errors are permanent.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Status { status, .. } => *status >= 500 || *status == 408,
            Self::Json(_)
            | Self::EmptyResponse { .. }
            | Self::CountMismatch { .. }
            | Self::Other(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;
