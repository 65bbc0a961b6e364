//! Dataset adapters.
//!
//! The engine only needs a named, ordered list of records plus the columns
//! to compose; how a dataset is downloaded and parsed lives behind
//! [`CorpusSource`].

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::{debug, info};

use crate::config::{CorpusConfig, DedupConfig};
use crate::corpus::{Corpus, Record};
use crate::error::{DedupError, Result};

/// Supplier of corpora by name.
#[async_trait]
pub trait CorpusSource: Send + Sync {
    /// Names of every corpus this source can load, in processing order.
    fn known_corpora(&self) -> Vec<String>;

    /// Load a corpus by name.
    async fn load(&self, name: &str) -> Result<Corpus>;
}

/// Reads each corpus from a CSV file with a header row.
///
/// Empty cells are treated as missing values.
pub struct CsvCorpusSource {
    /// Directory the corpus files are relative to.
    input_dir: PathBuf,

    /// Known corpora by name, in configuration order.
    corpora: IndexMap<String, CorpusConfig>,
}

impl CsvCorpusSource {
    /// Create a source over `corpora` stored under `input_dir`.
    pub fn new(
        input_dir: impl Into<PathBuf>,
        corpora: impl IntoIterator<Item = CorpusConfig>,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            corpora: corpora
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
        }
    }

    /// Create a source from the input directory and corpora of a run configuration.
    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(&config.input_dir, config.corpora.iter().cloned())
    }

    /// Path of the file backing `name`.
    pub fn path_for(&self, name: &str) -> Option<PathBuf> {
        self.corpora
            .get(name)
            .map(|c| self.input_dir.join(c.file_name()))
    }
}

#[async_trait]
impl CorpusSource for CsvCorpusSource {
    fn known_corpora(&self) -> Vec<String> {
        self.corpora.keys().cloned().collect()
    }

    async fn load(&self, name: &str) -> Result<Corpus> {
        let config = self
            .corpora
            .get(name)
            .ok_or_else(|| DedupError::UnknownCorpus(name.to_string()))?;
        let path = self.input_dir.join(config.file_name());

        debug!("Loading corpus {name} from {}", path.display());
        let content = tokio::fs::read(&path).await?;
        let corpus = parse_csv(name, &content, config)?;

        info!(
            "Loaded corpus {name}: {} records, {} columns",
            corpus.len(),
            corpus.columns.len()
        );
        Ok(corpus)
    }
}

/// Parse CSV bytes into a corpus, checking that the schema's columns exist.
fn parse_csv(name: &str, content: &[u8], config: &CorpusConfig) -> Result<Corpus> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(content);

    let columns: Vec<String> = reader.headers()?.iter().map(ToString::to_string).collect();
    let mut seen = HashSet::new();
    if let Some(column) = columns.iter().find(|c| !seen.insert(c.as_str())) {
        return Err(DedupError::DuplicateColumn {
            corpus: name.to_string(),
            column: column.clone(),
        });
    }
    if let Some(column) = config.text.columns().find(|c| !columns.contains(c)) {
        return Err(DedupError::MissingColumn {
            corpus: name.to_string(),
            column: column.clone(),
        });
    }

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row?;
        let values = columns
            .iter()
            .zip(row.iter())
            .map(|(column, value)| {
                let value = (!value.is_empty()).then(|| value.to_string());
                (column.clone(), value)
            })
            .collect();
        records.push(Record { index, values });
    }

    Ok(Corpus {
        name: name.to_string(),
        columns,
        records,
        schema: config.text.clone(),
    })
}
