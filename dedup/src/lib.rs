//! # Corpus Deduplication
//!
//! This crate keeps a growing multi-source text corpus free of duplicate and
//! near-duplicate records, combining:
//!
//! - **Text Composition**: Selected columns joined into one canonical string
//! - **Embeddings**: Batched encoding with a per-corpus cache
//! - **Dedup Policy**: Within-corpus and cross-corpus removal, per field
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Dedup Pipeline                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  CorpusSource ──► compose ──► embed-or-cached                   │
//! │                                     │                           │
//! │                                     ▼                           │
//! │                  within-dedup ──► cross-dedup (prior caches)    │
//! │                                     │                           │
//! │                                     ▼                           │
//! │               RecordWriter (.csv) + EmbeddingCache (.bin)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use biodedup_core::{CorpusSelection, DedupConfig, DedupPipeline};
//!
//! let pipeline = DedupPipeline::builder()
//!     .with_config(DedupConfig::from_toml_file("dedup.toml")?)
//!     .with_provider(Arc::new(OpenAIProvider::new()))
//!     .build()
//!     .await?;
//!
//! let report = pipeline.run(&CorpusSelection::All).await?;
//! ```

pub mod config;
pub mod corpus;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod policy;
pub mod source;

pub use config::{CorpusConfig, DedupConfig, EmbeddingConfig, SimilarityConfig};
pub use corpus::{Corpus, FieldRole, MISSING_VALUE, Record, TextSchema, compose, compose_corpus};
pub use error::{DedupError, ErrorKind, Result};
pub use output::RecordWriter;
pub use pipeline::{
    CorpusFailure, CorpusOutcome, CorpusSelection, CorpusSummary, DedupPipeline,
    DedupPipelineBuilder, RunReport, Stage,
};
pub use policy::{DedupPolicy, Survivors};
pub use source::{CorpusSource, CsvCorpusSource};

// Re-export from dependencies for convenience
pub use biodedup_embeddings::{
    Embedding, EmbeddingCache, EmbeddingProvider, OpenAIProvider, SimilarityThreshold,
};
