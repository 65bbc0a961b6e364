//! Keep/remove decisions over a corpus and its embeddings.
//!
//! [`Survivors`] holds the records still in play together with the
//! embeddings of every field computed so far, all aligned. Each policy step
//! asks the similarity engine for a removal mask and applies it to the
//! records and to every attached field at once, so a question/answer corpus
//! deduplicated field by field never loses alignment.

use std::collections::HashSet;

use biodedup_embeddings::{Embedding, SimilarityEngine, SimilarityThreshold};
use indexmap::IndexMap;
use tracing::info;

use crate::corpus::{Corpus, FieldRole};
use crate::error::{DedupError, Result};

/// Records surviving deduplication so far, with aligned embeddings per field.
#[derive(Debug, Clone)]
pub struct Survivors {
    corpus: Corpus,
    fields: IndexMap<FieldRole, Vec<Embedding>>,
}

impl Survivors {
    /// Start from a freshly loaded corpus with no embeddings attached.
    pub fn new(corpus: Corpus) -> Self {
        Self {
            corpus,
            fields: IndexMap::new(),
        }
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    /// Attach the embeddings of `role`, one per surviving record.
    pub fn attach(&mut self, role: FieldRole, vectors: Vec<Embedding>) -> Result<()> {
        if vectors.len() != self.corpus.len() {
            return Err(DedupError::CacheMisaligned {
                key: role.cache_key(&self.corpus.name),
                cached: vectors.len(),
                records: self.corpus.len(),
            });
        }
        self.fields.insert(role, vectors);
        Ok(())
    }

    /// Keep only the records whose original index is in `indices`.
    ///
    /// Used to realign a corpus with a cache entry written by an earlier run
    /// that already dropped records. Fails without touching anything if some
    /// index names a record that is not present. Returns the number of
    /// records dropped.
    pub fn restrict(&mut self, role: FieldRole, indices: &[usize]) -> Result<usize> {
        let wanted: HashSet<usize> = indices.iter().copied().collect();
        let removed: Vec<bool> = self
            .corpus
            .records
            .iter()
            .map(|record| !wanted.contains(&record.index))
            .collect();

        let matched = removed.iter().filter(|r| !**r).count();
        if matched != indices.len() {
            return Err(DedupError::CacheMisaligned {
                key: role.cache_key(&self.corpus.name),
                cached: indices.len(),
                records: matched,
            });
        }
        Ok(self.apply(&removed))
    }

    /// Embeddings of `role`, if attached.
    pub fn vectors(&self, role: FieldRole) -> Option<&[Embedding]> {
        self.fields.get(&role).map(Vec::as_slice)
    }

    /// Attached fields in the order they were attached.
    pub fn fields(&self) -> impl Iterator<Item = (FieldRole, &[Embedding])> {
        self.fields.iter().map(|(role, v)| (*role, v.as_slice()))
    }

    /// Drop every record marked in `removed` along with its embeddings.
    fn apply(&mut self, removed: &[bool]) -> usize {
        for vectors in self.fields.values_mut() {
            let mut flags = removed.iter();
            vectors.retain(|_| !flags.next().copied().unwrap_or(false));
        }
        self.corpus.retain_unmarked(removed)
    }
}

/// Turns similarity results into removal decisions.
#[derive(Debug, Clone, Copy)]
pub struct DedupPolicy {
    engine: SimilarityEngine,
    threshold: SimilarityThreshold,
}

impl DedupPolicy {
    pub fn new(engine: SimilarityEngine, threshold: SimilarityThreshold) -> Self {
        Self { engine, threshold }
    }

    pub fn threshold(&self) -> SimilarityThreshold {
        self.threshold
    }

    /// Remove records whose `role` embedding duplicates an earlier record's.
    ///
    /// Returns the number of records dropped.
    pub fn drop_within(&self, survivors: &mut Survivors, role: FieldRole) -> Result<usize> {
        let vectors = attached(survivors, role)?;
        let removed = self.engine.within(vectors, self.threshold)?;
        let dropped = survivors.apply(&removed);

        info!(
            corpus = %survivors.corpus.name,
            field = %role,
            "Dropped {dropped} near-duplicates within corpus, {} remain",
            survivors.corpus.len()
        );
        Ok(dropped)
    }

    /// Remove records whose `role` embedding duplicates any vector in `old`.
    ///
    /// `old` holds embeddings of previously accepted corpora; it may be fed in
    /// pieces over several calls with the same overall result. Returns the
    /// number of records dropped.
    pub fn drop_across(
        &self,
        survivors: &mut Survivors,
        role: FieldRole,
        old: &[Embedding],
    ) -> Result<usize> {
        let vectors = attached(survivors, role)?;
        let removed = self.engine.across(vectors, old, self.threshold)?;
        let dropped = survivors.apply(&removed);

        info!(
            corpus = %survivors.corpus.name,
            field = %role,
            "Dropped {dropped} near-duplicates of {} previously accepted records, {} remain",
            old.len(),
            survivors.corpus.len()
        );
        Ok(dropped)
    }
}

fn attached(survivors: &Survivors, role: FieldRole) -> Result<&[Embedding]> {
    survivors.vectors(role).ok_or_else(|| {
        DedupError::Config(format!(
            "no {role} embeddings attached to {}",
            survivors.corpus.name
        ))
    })
}
