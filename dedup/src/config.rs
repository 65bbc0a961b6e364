//! Configuration for a deduplication run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use biodedup_embeddings::{
    DEFAULT_BATCH_SIZE, DEFAULT_CHUNK_SIZE, SimilarityEngine, SimilarityThreshold,
};
use serde::{Deserialize, Serialize};

use crate::corpus::TextSchema;
use crate::error::{DedupError, Result};

/// Configuration for a deduplication run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Directory the CSV source reads corpora from.
    pub input_dir: PathBuf,

    /// Directory deduplicated corpora are written to.
    pub output_dir: PathBuf,

    /// Directory holding the embedding cache.
    pub cache_dir: PathBuf,

    /// Cosine similarity above which records are near-duplicates, in (0, 1].
    pub threshold: f32,

    /// Separator placed between composed columns.
    pub separator: String,

    /// Similarity engine configuration.
    pub similarity: SimilarityConfig,

    /// Embedding provider configuration.
    pub embedding: EmbeddingConfig,

    /// Known corpora, in processing order.
    pub corpora: Vec<CorpusConfig>,
}

impl DedupConfig {
    /// Create a configuration rooted at `data_dir` with default values.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            input_dir: data_dir.join("raw"),
            output_dir: data_dir.join("deduplicated"),
            cache_dir: data_dir.join("embeddings"),
            threshold: SimilarityThreshold::default().value(),
            separator: " ".to_string(),
            similarity: SimilarityConfig::default(),
            embedding: EmbeddingConfig::default(),
            corpora: Vec::new(),
        }
    }

    /// Parse a TOML configuration.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a TOML configuration file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DedupError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Add a corpus.
    pub fn with_corpus(mut self, corpus: CorpusConfig) -> Self {
        self.corpora.push(corpus);
        self
    }

    /// Set the similarity threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Set the similarity configuration.
    pub fn with_similarity(mut self, config: SimilarityConfig) -> Self {
        self.similarity = config;
        self
    }

    /// The validated similarity threshold.
    pub fn threshold(&self) -> Result<SimilarityThreshold> {
        Ok(SimilarityThreshold::new(self.threshold)?)
    }

    /// Look up a corpus by name.
    pub fn corpus(&self, name: &str) -> Option<&CorpusConfig> {
        self.corpora.iter().find(|c| c.name == name)
    }

    /// Check everything that can be checked before touching any corpus.
    pub fn validate(&self) -> Result<()> {
        self.threshold()?;

        if self.embedding.batch_size == 0 {
            return Err(DedupError::Config("embedding.batch_size must be positive".into()));
        }
        if self.similarity.chunk_size == 0 || self.similarity.old_chunk_size == 0 {
            return Err(DedupError::Config("similarity chunk sizes must be positive".into()));
        }

        let mut seen = HashSet::new();
        for corpus in &self.corpora {
            if corpus.name.is_empty() {
                return Err(DedupError::Config("corpus name must not be empty".into()));
            }
            if !seen.insert(corpus.name.as_str()) {
                return Err(DedupError::Config(format!("duplicate corpus name: {}", corpus.name)));
            }
            for (role, columns) in corpus.text.fields() {
                if columns.is_empty() {
                    return Err(DedupError::Config(format!(
                        "corpus {} has no {role} columns",
                        corpus.name
                    )));
                }
            }
        }

        Ok(())
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self::new("data")
    }
}

/// Configuration for the similarity engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    /// Rows per block for the corpus being deduplicated.
    pub chunk_size: usize,

    /// Rows per block for previously accepted embeddings.
    pub old_chunk_size: usize,
}

impl SimilarityConfig {
    /// Build the engine described by this configuration.
    pub fn engine(&self) -> SimilarityEngine {
        SimilarityEngine::new(self.chunk_size).with_old_chunk_size(self.old_chunk_size)
    }
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            old_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Configuration for the embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Base URL of an OpenAI-compatible embeddings API.
    pub base_url: String,

    /// Model to use for embeddings.
    pub model: String,

    /// Environment variable holding the API key, if the endpoint needs one.
    pub api_key_env: Option<String>,

    /// Texts per provider call.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// One known corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusConfig {
    /// Corpus name; also names its output file and cache entries.
    pub name: String,

    /// CSV file relative to the input directory. Defaults to `<name>.csv`.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Columns used for text composition.
    pub text: TextSchema,
}

impl CorpusConfig {
    /// Create a corpus entry.
    pub fn new(name: impl Into<String>, text: TextSchema) -> Self {
        Self {
            name: name.into(),
            file: None,
            text,
        }
    }

    /// Read the corpus from `file` instead of `<name>.csv`.
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// File name of the corpus relative to the input directory.
    pub fn file_name(&self) -> PathBuf {
        self.file
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.csv", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::ErrorKind;

    const SAMPLE: &str = r#"
input_dir = "/data/raw"
threshold = 0.85

[similarity]
chunk_size = 4000

[embedding]
base_url = "http://localhost:8080/v1"
model = "pubmedbert-base-embeddings"
api_key_env = "EMBED_KEY"

[[corpora]]
name = "pubmed_abstracts"
text = { columns = ["title", "abstract"] }

[[corpora]]
name = "medqa"
file = "medqa/train.csv"
text = { question = ["question"], answer = ["answer", "explanation"] }
"#;

    #[test]
    fn test_parse_toml() {
        let config = DedupConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.input_dir, PathBuf::from("/data/raw"));
        assert_eq!(config.output_dir, PathBuf::from("data/deduplicated"));
        assert_eq!(config.threshold, 0.85);
        assert_eq!(config.similarity.chunk_size, 4000);
        assert_eq!(config.similarity.old_chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.embedding.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.embedding.api_key_env.as_deref(), Some("EMBED_KEY"));

        assert_eq!(
            config.corpora[0].text,
            TextSchema::single(["title", "abstract"])
        );
        assert_eq!(
            config.corpora[1].text,
            TextSchema::dual(["question"], ["answer", "explanation"])
        );
        assert_eq!(
            config.corpora[0].file_name(),
            PathBuf::from("pubmed_abstracts.csv")
        );
        assert_eq!(
            config.corpus("medqa").unwrap().file_name(),
            PathBuf::from("medqa/train.csv")
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = DedupConfig::default();
        assert_eq!(config.threshold, 0.9);
        assert_eq!(config.separator, " ");
        assert_eq!(config.similarity.chunk_size, 8000);
        assert_eq!(config.embedding.batch_size, 64);
        assert!(config.corpora.is_empty());
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        for threshold in [0.0, -0.1, 1.5] {
            let err = DedupConfig::default()
                .with_threshold(threshold)
                .validate()
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration);
        }
        DedupConfig::default().with_threshold(1.0).validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_duplicate_corpora() {
        let config = DedupConfig::default()
            .with_corpus(CorpusConfig::new("a", TextSchema::single(["t"])))
            .with_corpus(CorpusConfig::new("a", TextSchema::single(["t"])));
        assert!(matches!(config.validate(), Err(DedupError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_columns() {
        let config = DedupConfig::default().with_corpus(CorpusConfig::new(
            "qa",
            TextSchema::dual(Vec::<String>::new(), vec!["a".to_string()]),
        ));
        assert!(matches!(config.validate(), Err(DedupError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = DedupConfig::default().with_similarity(SimilarityConfig {
            chunk_size: 0,
            old_chunk_size: 10,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_similarity_engine_uses_both_chunk_sizes() {
        let engine = SimilarityConfig {
            chunk_size: 500,
            old_chunk_size: 2000,
        }
        .engine();
        assert_eq!(engine.chunk_size(), 500);
        assert_eq!(engine.old_chunk_size(), 2000);
    }
}
