//! Error types for the deduplication engine.

use biodedup_embeddings::EmbeddingError;
use thiserror::Error;

/// Result type alias for dedup operations.
pub type Result<T> = std::result::Result<T, DedupError>;

/// Errors that can occur while deduplicating corpora.
#[derive(Error, Debug)]
pub enum DedupError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Corpus name not known to the source.
    #[error("unknown corpus: {0}")]
    UnknownCorpus(String),

    /// A configured text column is absent from the corpus header.
    #[error("corpus {corpus} has no column named {column:?}")]
    MissingColumn { corpus: String, column: String },

    /// The corpus header names the same column more than once.
    #[error("corpus {corpus} has more than one column named {column:?}")]
    DuplicateColumn { corpus: String, column: String },

    /// Embedding, similarity or cache error.
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// Cached vectors do not line up with the records they describe.
    #[error(
        "cached embeddings for {key} hold {cached} vectors but the corpus has {records} records"
    )]
    CacheMisaligned {
        key: String,
        cached: usize,
        records: usize,
    },

    /// CSV error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Config file could not be parsed.
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad failure classes, used to decide how far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad configuration: fatal before any corpus is touched.
    Configuration,
    /// Embedding backend failure: aborts the current corpus.
    Provider,
    /// Vector dimensionality or count mismatch: aborts the current corpus.
    Shape,
    /// Filesystem or input-format failure: aborts the current corpus.
    Io,
}

impl DedupError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_)
            | Self::UnknownCorpus(_)
            | Self::MissingColumn { .. }
            | Self::Toml(_) => ErrorKind::Configuration,
            Self::Embedding(EmbeddingError::InvalidThreshold(_)) => ErrorKind::Configuration,
            Self::Embedding(EmbeddingError::DimensionMismatch { .. })
            | Self::CacheMisaligned { .. } => ErrorKind::Shape,
            Self::Embedding(e) if e.is_provider_failure() => ErrorKind::Provider,
            Self::Embedding(_) | Self::DuplicateColumn { .. } | Self::Csv(_) | Self::Io(_) => {
                ErrorKind::Io
            }
        }
    }
}
