//! # Embeddings
//!
//! This crate provides embedding generation, a per-corpus embedding cache and
//! memory-bounded similarity search for the corpus deduplication engine.
//!
//! ## Features
//!
//! - **Embedding Generation**: Convert text to dense vectors in fixed-size batches
//! - **Embedding Cache**: One artifact per corpus, loaded instead of recomputed
//! - **Chunked Similarity**: All pairs above a threshold without an N×N matrix
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EmbeddingProvider ──► Embedding ──► EmbeddingCache             │
//! │       │                    │                                    │
//! │       ▼                    ▼                                    │
//! │  OpenAI-compatible   SimilarityEngine (within / across)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod engine;
pub mod error;
pub mod provider;
pub mod similarity;

pub use cache::{CacheEntry, EmbeddingCache};
pub use engine::SimilarityEngine;
pub use error::{EmbeddingError, Result};
pub use provider::{EmbeddingProvider, OpenAIProvider, encode_in_batches};
pub use similarity::{SimilarityThreshold, cosine_similarity};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;

/// Number of texts sent to a provider per call.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Number of rows compared per similarity block.
pub const DEFAULT_CHUNK_SIZE: usize = 8000;
