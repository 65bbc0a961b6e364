//! Chunked all-pairs similarity search.
//!
//! The engine never materializes an N×N (or N×M) similarity matrix. Rows are
//! processed in contiguous chunks and only one chunk × columns block is alive
//! at a time, so peak memory is `O(chunk_size × N)` on top of the vectors.

use std::ops::Range;

use rayon::prelude::*;
use tracing::debug;

use crate::error::{EmbeddingError, Result};
use crate::similarity::{SimilarityThreshold, dot, normalize};
use crate::{DEFAULT_CHUNK_SIZE, Embedding};

/// Memory-bounded search for near-duplicate pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimilarityEngine {
    /// Rows per block for the set being deduplicated.
    chunk_size: usize,

    /// Rows per block for the reference set in cross-corpus mode.
    old_chunk_size: usize,
}

impl SimilarityEngine {
    /// Create an engine using `chunk_size` for both sides.
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            old_chunk_size: chunk_size,
        }
    }

    /// Use a separate chunk size for the reference set.
    pub fn with_old_chunk_size(mut self, old_chunk_size: usize) -> Self {
        self.old_chunk_size = old_chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn old_chunk_size(&self) -> usize {
        self.old_chunk_size
    }

    /// Mark near-duplicates inside one set.
    ///
    /// Returns a removal mask aligned with `vectors`. Rows are visited once in
    /// ascending index order; a row that is still kept removes every later,
    /// still-kept row whose similarity exceeds the threshold. The earliest
    /// member of any over-threshold group therefore survives, and no two
    /// survivors are similar. This is a chain relation rather than a
    /// clustering: two removed rows need not be similar to each other.
    pub fn within(
        &self,
        vectors: &[Embedding],
        threshold: SimilarityThreshold,
    ) -> Result<Vec<bool>> {
        let rows = UnitRows::from_vectors(vectors)?;
        let n = rows.len();
        let mut removed = vec![false; n];
        let mut block = Vec::new();

        for start in (0..n).step_by(self.chunk_size) {
            let end = (start + self.chunk_size).min(n);
            // Columns before `start` can never satisfy j > i for rows in this chunk.
            let width = n - start;
            rows.block(start..end, &rows, start..n, &mut block);

            for i in start..end {
                if removed[i] {
                    continue;
                }
                let row = &block[(i - start) * width..(i - start + 1) * width];
                for j in (i + 1)..n {
                    if !removed[j] && threshold.is_exceeded_by(row[j - start]) {
                        removed[j] = true;
                    }
                }
            }

            debug!(
                "Within pass: rows {start}..{end} of {n}, {} marked so far",
                removed.iter().filter(|r| **r).count()
            );
        }

        Ok(removed)
    }

    /// Mark rows of `new` that are near-duplicates of any row of `old`.
    ///
    /// Returns a removal mask aligned with `new`; `old` is never modified.
    /// The test is existential and order-independent, so chunks of `new` are
    /// evaluated in parallel.
    pub fn across(
        &self,
        new: &[Embedding],
        old: &[Embedding],
        threshold: SimilarityThreshold,
    ) -> Result<Vec<bool>> {
        let new_rows = UnitRows::from_vectors(new)?;
        let old_rows = UnitRows::from_vectors(old)?;
        let mut removed = vec![false; new_rows.len()];

        if new_rows.is_empty() || old_rows.is_empty() {
            return Ok(removed);
        }
        if new_rows.dimension != old_rows.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: old_rows.dimension,
                actual: new_rows.dimension,
            });
        }

        let m = old_rows.len();
        let chunk_size = self.chunk_size;
        let old_chunk_size = self.old_chunk_size;

        removed
            .par_chunks_mut(chunk_size)
            .enumerate()
            .for_each(|(chunk, mask)| {
                let start = chunk * chunk_size;
                let end = start + mask.len();
                let mut block = Vec::new();

                for old_start in (0..m).step_by(old_chunk_size) {
                    let old_end = (old_start + old_chunk_size).min(m);
                    let width = old_end - old_start;
                    new_rows.block(start..end, &old_rows, old_start..old_end, &mut block);

                    for (offset, flag) in mask.iter_mut().enumerate() {
                        if *flag {
                            continue;
                        }
                        let row = &block[offset * width..(offset + 1) * width];
                        *flag = row.iter().any(|s| threshold.is_exceeded_by(*s));
                    }

                    if mask.iter().all(|flag| *flag) {
                        break;
                    }
                }
            });

        debug!(
            "Across pass: {} of {} rows matched {m} reference rows",
            removed.iter().filter(|r| **r).count(),
            removed.len()
        );

        Ok(removed)
    }
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

/// Unit-length copies of a set of vectors in one contiguous buffer.
struct UnitRows {
    count: usize,
    dimension: usize,
    data: Vec<f32>,
}

impl UnitRows {
    fn from_vectors(vectors: &[Embedding]) -> Result<Self> {
        let dimension = vectors.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(vectors.len() * dimension);

        for vector in vectors {
            if vector.len() != dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: dimension,
                    actual: vector.len(),
                });
            }
            let offset = data.len();
            data.extend_from_slice(vector);
            normalize(&mut data[offset..]);
        }

        Ok(Self {
            count: vectors.len(),
            dimension,
            data,
        })
    }

    fn len(&self) -> usize {
        self.count
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dimension..(i + 1) * self.dimension]
    }

    /// Fill `out` with the row-major similarity block `rows × cols`.
    fn block(&self, rows: Range<usize>, other: &UnitRows, cols: Range<usize>, out: &mut Vec<f32>) {
        out.clear();
        out.reserve(rows.len() * cols.len());
        for i in rows {
            let a = self.row(i);
            out.extend(cols.clone().map(|j| dot(a, other.row(j))));
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::similarity::cosine_similarity;

    fn threshold(value: f32) -> SimilarityThreshold {
        SimilarityThreshold::new(value).unwrap()
    }

    fn unit(dimension: usize, axis: usize) -> Embedding {
        let mut v = vec![0.0; dimension];
        v[axis] = 1.0;
        v
    }

    /// `cos(θ)·e0 + sin(θ)·e_axis`, so its similarity to `e0` is `cos_theta`.
    fn tilted(cos_theta: f32, axis: usize) -> Embedding {
        let mut v = vec![0.0; 8];
        v[0] = cos_theta;
        v[axis] = (1.0 - cos_theta * cos_theta).sqrt();
        v
    }

    fn random_vectors(seed: u64, n: usize, dimension: usize) -> Vec<Embedding> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dimension).map(|_| rng.random_range(-1.0..1.0)).collect())
            .collect()
    }

    fn kept(removed: &[bool]) -> Vec<usize> {
        removed
            .iter()
            .enumerate()
            .filter(|(_, r)| !**r)
            .map(|(i, _)| i)
            .collect()
    }

    fn survivors(vectors: &[Embedding], removed: &[bool]) -> Vec<Embedding> {
        kept(removed).into_iter().map(|i| vectors[i].clone()).collect()
    }

    #[test]
    fn test_within_keeps_lowest_index() {
        let vectors = vec![
            unit(4, 0),
            unit(4, 1),
            unit(4, 2),
            unit(4, 0),
            unit(4, 3),
        ];
        let removed = SimilarityEngine::new(2).within(&vectors, threshold(0.9)).unwrap();
        assert_eq!(kept(&removed), vec![0, 1, 2, 4]);
    }

    #[test]
    fn test_within_single_record_is_kept() {
        let removed = SimilarityEngine::default()
            .within(&[vec![0.3, 0.4]], threshold(0.1))
            .unwrap();
        assert_eq!(removed, vec![false]);
    }

    #[test]
    fn test_within_empty_input() {
        let removed = SimilarityEngine::default().within(&[], threshold(0.9)).unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn test_within_is_a_chain_not_a_closure() {
        // a~b and b~c are above 0.8, a~c is 0.5.
        let (s30, c30) = (0.5_f32, 0.75_f32.sqrt());
        let vectors = vec![vec![1.0, 0.0], vec![c30, s30], vec![s30, c30]];
        let removed = SimilarityEngine::new(1).within(&vectors, threshold(0.8)).unwrap();
        assert_eq!(kept(&removed), vec![0, 2]);
    }

    #[test]
    fn test_within_zero_vectors_never_match() {
        let vectors = vec![vec![0.0, 0.0], vec![0.0, 0.0], vec![1.0, 0.0]];
        let removed = SimilarityEngine::default().within(&vectors, threshold(0.5)).unwrap();
        assert_eq!(removed, vec![false, false, false]);
    }

    #[test]
    fn test_within_independent_of_chunk_size() {
        let vectors = random_vectors(11, 80, 6);
        let reference = SimilarityEngine::new(vectors.len())
            .within(&vectors, threshold(0.7))
            .unwrap();
        assert!(reference.iter().any(|r| *r), "fixture should contain duplicates");

        for chunk_size in [1, 3, 7, 32, 1000] {
            let removed = SimilarityEngine::new(chunk_size)
                .within(&vectors, threshold(0.7))
                .unwrap();
            assert_eq!(removed, reference, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_within_survivors_are_pairwise_dissimilar() {
        let vectors = random_vectors(5, 60, 5);
        let removed = SimilarityEngine::new(16).within(&vectors, threshold(0.8)).unwrap();
        let kept = survivors(&vectors, &removed);

        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                assert!(cosine_similarity(a, b).unwrap() <= 0.8 + 1e-5);
            }
        }
    }

    #[test]
    fn test_within_is_idempotent() {
        let engine = SimilarityEngine::new(9);
        let vectors = random_vectors(23, 70, 6);
        let first = engine.within(&vectors, threshold(0.75)).unwrap();
        let kept = survivors(&vectors, &first);

        let second = engine.within(&kept, threshold(0.75)).unwrap();
        assert!(second.iter().all(|r| !*r));
    }

    #[test]
    fn test_within_is_deterministic() {
        let engine = SimilarityEngine::new(10);
        let vectors = random_vectors(42, 50, 4);
        let a = engine.within(&vectors, threshold(0.85)).unwrap();
        let b = engine.within(&vectors, threshold(0.85)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_within_removals_shrink_as_threshold_rises() {
        let vectors = vec![
            unit(8, 0),
            tilted(0.95, 1),
            tilted(0.85, 2),
            tilted(0.75, 3),
            unit(8, 7),
        ];
        let engine = SimilarityEngine::new(2);
        let counts: Vec<usize> = [0.6, 0.7, 0.8, 0.9, 0.96]
            .into_iter()
            .map(|t| {
                engine
                    .within(&vectors, threshold(t))
                    .unwrap()
                    .into_iter()
                    .filter(|r| *r)
                    .count()
            })
            .collect();

        assert_eq!(counts, vec![3, 3, 2, 1, 0]);
    }

    #[test]
    fn test_within_dimension_mismatch() {
        let vectors = vec![vec![1.0, 0.0], vec![1.0, 0.0, 0.0]];
        let err = SimilarityEngine::default()
            .within(&vectors, threshold(0.9))
            .unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_across_removes_any_match() {
        let old = vec![unit(4, 0), unit(4, 1)];
        let new = vec![unit(4, 2), unit(4, 1), unit(4, 3), unit(4, 0)];
        let removed = SimilarityEngine::new(3)
            .with_old_chunk_size(1)
            .across(&new, &old, threshold(0.9))
            .unwrap();
        assert_eq!(removed, vec![false, true, false, true]);
    }

    #[test]
    fn test_across_ignores_duplicates_inside_new_set() {
        let old = vec![unit(3, 0)];
        let new = vec![unit(3, 1), unit(3, 1)];
        let removed = SimilarityEngine::default()
            .across(&new, &old, threshold(0.9))
            .unwrap();
        assert_eq!(removed, vec![false, false]);
    }

    #[test]
    fn test_across_empty_reference_keeps_everything() {
        let new = vec![unit(3, 0), unit(3, 1)];
        let removed = SimilarityEngine::default()
            .across(&new, &[], threshold(0.9))
            .unwrap();
        assert_eq!(removed, vec![false, false]);
    }

    #[test]
    fn test_across_containment() {
        let old = random_vectors(1, 40, 5);
        let new = random_vectors(2, 90, 5);
        let removed = SimilarityEngine::new(8)
            .with_old_chunk_size(6)
            .across(&new, &old, threshold(0.8))
            .unwrap();
        assert!(removed.iter().any(|r| *r), "fixture should contain matches");

        for survivor in survivors(&new, &removed) {
            for reference in &old {
                assert!(cosine_similarity(&survivor, reference).unwrap() <= 0.8 + 1e-5);
            }
        }
    }

    #[test]
    fn test_across_independent_of_chunk_sizes() {
        let old = random_vectors(3, 30, 4);
        let new = random_vectors(4, 50, 4);
        let reference = SimilarityEngine::new(50)
            .across(&new, &old, threshold(0.85))
            .unwrap();

        for (chunk, old_chunk) in [(1, 1), (7, 3), (13, 30), (64, 2)] {
            let removed = SimilarityEngine::new(chunk)
                .with_old_chunk_size(old_chunk)
                .across(&new, &old, threshold(0.85))
                .unwrap();
            assert_eq!(removed, reference, "chunks {chunk}/{old_chunk}");
        }
    }

    #[test]
    fn test_across_dimension_mismatch() {
        let err = SimilarityEngine::default()
            .across(&[vec![1.0, 0.0]], &[vec![1.0, 0.0, 0.0]], threshold(0.9))
            .unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }
}
