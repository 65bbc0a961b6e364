//! Error types for the embeddings system.

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors that can occur in the embeddings system.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// API request failed.
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Provider returned a different number of vectors than texts sent.
    #[error("provider returned {actual} embeddings for {expected} texts")]
    CountMismatch { expected: usize, actual: usize },

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Similarity threshold outside (0, 1].
    #[error("similarity threshold must be in (0, 1], got {0}")]
    InvalidThreshold(f32),

    /// Cache error.
    #[error("cache error: {0}")]
    Cache(String),

    /// Encoding or decoding a cache artifact failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EmbeddingError {
    /// Whether the error came from the embedding backend rather than from
    /// local data or storage.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            Self::ApiRequest(_)
                | Self::InvalidResponse(_)
                | Self::RateLimited { .. }
                | Self::CountMismatch { .. }
                | Self::Http(_)
        )
    }
}
