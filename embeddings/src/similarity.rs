//! Similarity computation for embeddings.

use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, Result};

/// Compute the cosine similarity between two embeddings.
///
/// Returns a value between -1.0 and 1.0, where:
/// - 1.0 means identical vectors
/// - 0.0 means orthogonal vectors
/// - -1.0 means opposite vectors
///
/// A zero vector is treated as orthogonal to everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let dot_product = dot(a, b);
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return Ok(0.0);
    }

    Ok(dot_product / (magnitude_a * magnitude_b))
}

/// Dot product of two equally sized slices.
#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Normalize an embedding to unit length.
pub fn normalize(embedding: &mut [f32]) {
    let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for x in embedding.iter_mut() {
            *x /= magnitude;
        }
    }
}

/// Cosine similarity above which two records count as near-duplicates.
///
/// Always in (0, 1]. A pair is a near-duplicate only when its similarity is
/// strictly greater than the threshold, so a threshold of 1.0 never fires.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct SimilarityThreshold(f32);

impl SimilarityThreshold {
    /// Validate and wrap a threshold.
    pub fn new(value: f32) -> Result<Self> {
        if value > 0.0 && value <= 1.0 {
            Ok(Self(value))
        } else {
            Err(EmbeddingError::InvalidThreshold(value))
        }
    }

    /// The raw threshold value.
    pub fn value(self) -> f32 {
        self.0
    }

    /// Whether `similarity` is strictly above the threshold.
    #[inline]
    pub fn is_exceeded_by(self, similarity: f32) -> bool {
        similarity > self.0
    }
}

impl Default for SimilarityThreshold {
    fn default() -> Self {
        Self(0.9)
    }
}

impl TryFrom<f32> for SimilarityThreshold {
    type Error = EmbeddingError;

    fn try_from(value: f32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SimilarityThreshold> for f32 {
    fn from(threshold: SimilarityThreshold) -> Self {
        threshold.0
    }
}

impl std::fmt::Display for SimilarityThreshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
