//! Per-corpus orchestration of a deduplication run.
//!
//! Corpora are processed strictly one after another. Each goes through
//! load, compose, embed (or cache hit), within-corpus dedup, cross-corpus
//! dedup against the cached embeddings of every corpus that precedes it,
//! and finally persistence of the surviving records and of any freshly
//! computed embeddings. A failure at any stage is recorded for that corpus
//! and the run moves on to the next one.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use biodedup_embeddings::{EmbeddingCache, EmbeddingProvider, encode_in_batches};
use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::DedupConfig;
use crate::corpus::{FieldRole, compose_corpus};
use crate::error::{DedupError, Result};
use crate::output::RecordWriter;
use crate::policy::{DedupPolicy, Survivors};
use crate::source::{CorpusSource, CsvCorpusSource};

/// Step of the per-corpus state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Compose,
    Embed,
    WithinDedup,
    LoadOldEmbeddings,
    CrossDedup,
    PersistRecords,
    PersistEmbeddings,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Compose => "compose",
            Self::Embed => "embed",
            Self::WithinDedup => "within-dedup",
            Self::LoadOldEmbeddings => "load-old-embeddings",
            Self::CrossDedup => "cross-dedup",
            Self::PersistRecords => "persist-records",
            Self::PersistEmbeddings => "persist-embeddings",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a corpus did not finish.
#[derive(Error, Debug)]
#[error("{stage} failed: {error}")]
pub struct CorpusFailure {
    /// Stage the corpus was in.
    pub stage: Stage,

    /// The underlying error.
    pub error: DedupError,
}

/// What happened to a corpus that finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusSummary {
    /// Corpus name.
    pub name: String,

    /// Records loaded from the source.
    pub input_records: usize,

    /// Original indices of the surviving records, ascending.
    pub kept_indices: Vec<usize>,

    /// Records dropped to match a cache entry written by an earlier run.
    pub cache_dropped: usize,

    /// Records dropped as near-duplicates of earlier records in the corpus.
    pub within_dropped: usize,

    /// Records dropped as near-duplicates of previously accepted corpora.
    pub across_dropped: usize,

    /// Fields whose embeddings came from the cache.
    pub cached_fields: Vec<FieldRole>,

    /// Where the surviving records were written.
    pub output_path: PathBuf,
}

impl CorpusSummary {
    pub fn kept(&self) -> usize {
        self.kept_indices.len()
    }
}

/// Outcome of one corpus.
#[derive(Debug)]
pub enum CorpusOutcome {
    Done(CorpusSummary),
    Failed(CorpusFailure),
}

/// Outcomes of a run, in processing order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: IndexMap<String, CorpusOutcome>,
}

impl RunReport {
    pub fn get(&self, name: &str) -> Option<&CorpusOutcome> {
        self.outcomes.get(name)
    }

    /// Summaries of the corpora that finished.
    pub fn succeeded(&self) -> impl Iterator<Item = &CorpusSummary> {
        self.outcomes.values().filter_map(|outcome| match outcome {
            CorpusOutcome::Done(summary) => Some(summary),
            CorpusOutcome::Failed(_) => None,
        })
    }

    /// Corpora that failed, with the reason.
    pub fn failed(&self) -> impl Iterator<Item = (&str, &CorpusFailure)> {
        self.outcomes
            .iter()
            .filter_map(|(name, outcome)| match outcome {
                CorpusOutcome::Failed(failure) => Some((name.as_str(), failure)),
                CorpusOutcome::Done(_) => None,
            })
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// True when at least one corpus ran and none of them finished.
    pub fn all_failed(&self) -> bool {
        !self.is_empty() && self.succeeded().next().is_none()
    }
}

/// Which corpora a run processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CorpusSelection {
    /// Every corpus the source knows.
    #[default]
    All,

    /// Only the named corpora. Still processed in the source's order.
    Named(Vec<String>),
}

/// Runs deduplication over the corpora of a source.
pub struct DedupPipeline {
    config: DedupConfig,
    source: Arc<dyn CorpusSource>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    writer: RecordWriter,
    policy: DedupPolicy,
}

impl DedupPipeline {
    /// Create a new pipeline builder.
    pub fn builder() -> DedupPipelineBuilder {
        DedupPipelineBuilder::new()
    }

    /// Validate `config` and prepare the cache and output directories.
    pub async fn new(
        config: DedupConfig,
        source: Arc<dyn CorpusSource>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let policy = DedupPolicy::new(config.similarity.engine(), config.threshold()?);
        let cache = EmbeddingCache::new(&config.cache_dir).await?;
        let writer = RecordWriter::new(&config.output_dir).await?;

        info!(
            "Dedup pipeline ready: provider {} ({}), cache {}",
            provider.name(),
            provider.model(),
            cache.dir().display()
        );

        Ok(Self {
            config,
            source,
            provider,
            cache,
            writer,
            policy,
        })
    }

    /// Resolve `selection` to corpus names in processing order.
    ///
    /// Fails on the first name the source does not know, before any corpus
    /// is touched.
    pub fn resolve(&self, selection: &CorpusSelection) -> Result<Vec<String>> {
        let known = self.source.known_corpora();
        match selection {
            CorpusSelection::All => Ok(known),
            CorpusSelection::Named(names) => {
                if let Some(unknown) = names.iter().find(|n| !known.contains(n)) {
                    return Err(DedupError::UnknownCorpus(unknown.clone()));
                }
                Ok(known.into_iter().filter(|k| names.contains(k)).collect())
            }
        }
    }

    /// Process the selected corpora one after another.
    ///
    /// Only an invalid selection fails the run as a whole; per-corpus
    /// failures are recorded in the report.
    pub async fn run(&self, selection: &CorpusSelection) -> Result<RunReport> {
        let known = self.source.known_corpora();
        let names = self.resolve(selection)?;
        info!(
            "Deduplicating {} corpora at threshold {}",
            names.len(),
            self.policy.threshold()
        );

        let mut report = RunReport::default();
        let mut failed = HashSet::new();
        for name in names {
            let position = known.iter().position(|k| *k == name).unwrap_or(0);
            let priors = &known[..position];

            let outcome = match self.process(&name, priors, &failed).await {
                Ok(summary) => {
                    info!(
                        corpus = %name,
                        "Kept {} of {} records ({} within, {} across)",
                        summary.kept(),
                        summary.input_records,
                        summary.within_dropped,
                        summary.across_dropped
                    );
                    CorpusOutcome::Done(summary)
                }
                Err(failure) => {
                    error!(
                        corpus = %name,
                        stage = %failure.stage,
                        "Corpus failed: {}",
                        failure.error
                    );
                    failed.insert(name.clone());
                    CorpusOutcome::Failed(failure)
                }
            };
            report.outcomes.insert(name, outcome);
        }

        Ok(report)
    }

    async fn process(
        &self,
        name: &str,
        priors: &[String],
        failed: &HashSet<String>,
    ) -> std::result::Result<CorpusSummary, CorpusFailure> {
        let corpus = self.source.load(name).await.at(Stage::Load)?;
        let input_records = corpus.len();
        let schema = corpus.schema.clone();
        let mut survivors = Survivors::new(corpus);

        let prior_keys = self
            .prior_keys(name, priors, failed)
            .await
            .at(Stage::LoadOldEmbeddings)?;

        let mut fresh = Vec::new();
        let mut cached_fields = Vec::new();
        let mut cache_dropped = 0;
        let mut within_dropped = 0;
        let mut across_dropped = 0;

        for (role, columns) in schema.fields() {
            let key = role.cache_key(name);
            let vectors = match self.cache.load(&key).await.at(Stage::Embed)? {
                Some(entry) => {
                    cache_dropped += survivors
                        .restrict(role, &entry.indices)
                        .at(Stage::Embed)?;
                    debug!(
                        corpus = %name,
                        field = %role,
                        "Using {} cached embeddings",
                        entry.len()
                    );
                    cached_fields.push(role);
                    entry.vectors
                }
                None => {
                    let texts =
                        compose_corpus(survivors.corpus(), columns, &self.config.separator);
                    debug!(corpus = %name, field = %role, "Composed {} texts", texts.len());
                    fresh.push(role);
                    encode_in_batches(
                        self.provider.as_ref(),
                        &texts,
                        self.config.embedding.batch_size,
                    )
                    .await
                    .at(Stage::Embed)?
                }
            };
            survivors.attach(role, vectors).at(Stage::Embed)?;

            within_dropped += self
                .policy
                .drop_within(&mut survivors, role)
                .at(Stage::WithinDedup)?;

            for prior_key in &prior_keys {
                if survivors.corpus().is_empty() {
                    break;
                }
                let Some(old) = self
                    .cache
                    .load(prior_key)
                    .await
                    .at(Stage::LoadOldEmbeddings)?
                else {
                    continue;
                };
                across_dropped += self
                    .policy
                    .drop_across(&mut survivors, role, &old.vectors)
                    .at(Stage::CrossDedup)?;
            }
        }

        let output_path = self
            .writer
            .write(survivors.corpus())
            .await
            .at(Stage::PersistRecords)?;

        let kept_indices = survivors.corpus().indices();
        for (role, vectors) in survivors.fields() {
            if fresh.contains(&role) {
                self.cache
                    .save(&role.cache_key(name), &kept_indices, vectors)
                    .await
                    .at(Stage::PersistEmbeddings)?;
            }
        }

        Ok(CorpusSummary {
            name: name.to_string(),
            input_records,
            kept_indices,
            cache_dropped,
            within_dropped,
            across_dropped,
            cached_fields,
            output_path,
        })
    }

    /// Cache keys of every entry stored for `priors`, any field role.
    ///
    /// Every field of the current corpus is compared against all of them,
    /// so a single-field corpus still meets the questions and answers of an
    /// earlier question/answer corpus.
    async fn prior_keys(
        &self,
        name: &str,
        priors: &[String],
        failed: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for prior in priors {
            let before = keys.len();
            for role in FieldRole::ALL {
                let key = role.cache_key(prior);
                if self.cache.contains(&key).await? {
                    keys.push(key);
                }
            }
            if keys.len() == before {
                if failed.contains(prior) {
                    warn!(corpus = %name, "Skipping {prior}: it failed earlier in this run");
                } else {
                    warn!(corpus = %name, "No cached embeddings for {prior}, not comparing");
                }
            }
        }
        Ok(keys)
    }
}

/// Tags an error with the stage it happened in.
trait AtStage<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, CorpusFailure>;
}

impl<T, E: Into<DedupError>> AtStage<T> for std::result::Result<T, E> {
    fn at(self, stage: Stage) -> std::result::Result<T, CorpusFailure> {
        self.map_err(|e| CorpusFailure {
            stage,
            error: e.into(),
        })
    }
}

/// Builder for [`DedupPipeline`].
pub struct DedupPipelineBuilder {
    config: DedupConfig,
    source: Option<Arc<dyn CorpusSource>>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
}

impl DedupPipelineBuilder {
    /// Create a new builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: DedupConfig::default(),
            source: None,
            provider: None,
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: DedupConfig) -> Self {
        self.config = config;
        self
    }

    /// Read corpora from `source` instead of the configured CSV files.
    pub fn with_source(mut self, source: Arc<dyn CorpusSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the embedding provider.
    pub fn with_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the similarity threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.config.threshold = threshold;
        self
    }

    /// Set the cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    /// Set the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    /// Build the pipeline.
    pub async fn build(self) -> Result<DedupPipeline> {
        let provider = self
            .provider
            .ok_or_else(|| DedupError::Config("no embedding provider configured".into()))?;
        let source = match self.source {
            Some(source) => source,
            None => Arc::new(CsvCorpusSource::from_config(&self.config)),
        };
        DedupPipeline::new(self.config, source, provider).await
    }
}

impl Default for DedupPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use biodedup_embeddings::Embedding;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::config::CorpusConfig;
    use crate::corpus::TextSchema;
    use crate::error::ErrorKind;

    struct NullProvider;

    #[async_trait]
    impl EmbeddingProvider for NullProvider {
        fn name(&self) -> &str {
            "null"
        }

        fn model(&self) -> &str {
            "none"
        }

        async fn encode(&self, texts: &[String]) -> biodedup_embeddings::Result<Vec<Embedding>> {
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }
    }

    fn config(dir: &TempDir) -> DedupConfig {
        DedupConfig::new(dir.path())
            .with_corpus(CorpusConfig::new("a", TextSchema::single(["text"])))
            .with_corpus(CorpusConfig::new("b", TextSchema::single(["text"])))
            .with_corpus(CorpusConfig::new("c", TextSchema::single(["text"])))
    }

    async fn pipeline(dir: &TempDir) -> DedupPipeline {
        DedupPipeline::builder()
            .with_config(config(dir))
            .with_provider(Arc::new(NullProvider))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_keeps_source_order() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir).await;

        assert_eq!(
            pipeline.resolve(&CorpusSelection::All).unwrap(),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            pipeline
                .resolve(&CorpusSelection::Named(vec!["c".into(), "a".into()]))
                .unwrap(),
            vec!["a", "c"]
        );
    }

    #[tokio::test]
    async fn test_resolve_rejects_unknown_names() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir).await;

        let err = pipeline
            .resolve(&CorpusSelection::Named(vec!["a".into(), "zzz".into()]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_build_requires_provider() {
        let dir = TempDir::new().unwrap();
        let result = DedupPipeline::builder().with_config(config(&dir)).build().await;
        assert!(matches!(result, Err(DedupError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_rejects_bad_threshold() {
        let dir = TempDir::new().unwrap();
        let result = DedupPipeline::builder()
            .with_config(config(&dir))
            .with_provider(Arc::new(NullProvider))
            .with_threshold(1.5)
            .build()
            .await;
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Configuration));
    }

    #[test]
    fn test_report_helpers() {
        let mut report = RunReport::default();
        assert!(!report.all_failed());

        report.outcomes.insert(
            "a".into(),
            CorpusOutcome::Failed(CorpusFailure {
                stage: Stage::Embed,
                error: DedupError::Config("boom".into()),
            }),
        );
        assert!(report.all_failed());

        report.outcomes.insert(
            "b".into(),
            CorpusOutcome::Done(CorpusSummary {
                name: "b".into(),
                input_records: 3,
                kept_indices: vec![0, 2],
                cache_dropped: 0,
                within_dropped: 1,
                across_dropped: 0,
                cached_fields: Vec::new(),
                output_path: PathBuf::from("b_deduplicated.csv"),
            }),
        );
        assert!(!report.all_failed());
        assert_eq!(report.len(), 2);
        assert_eq!(report.succeeded().map(CorpusSummary::kept).sum::<usize>(), 2);
        assert_eq!(
            report.failed().map(|(name, f)| (name, f.stage)).collect::<Vec<_>>(),
            vec![("a", Stage::Embed)]
        );
    }

    #[test]
    fn test_failure_display() {
        let failure = CorpusFailure {
            stage: Stage::CrossDedup,
            error: DedupError::UnknownCorpus("x".into()),
        };
        assert_eq!(failure.to_string(), "cross-dedup failed: unknown corpus: x");
    }
}
