//! Persistence of deduplicated corpora.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::info;

use crate::corpus::Corpus;
use crate::error::{DedupError, Result};

/// Writes surviving records as `<dir>/<corpus>_deduplicated.csv`.
#[derive(Debug, Clone)]
pub struct RecordWriter {
    /// Output directory.
    dir: PathBuf,
}

impl RecordWriter {
    /// Create a writer, creating `dir` if needed.
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Path the corpus named `name` is written to.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}_deduplicated.csv"))
    }

    /// Write `corpus` with its original header. Missing values become empty cells.
    pub async fn write(&self, corpus: &Corpus) -> Result<PathBuf> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&corpus.columns)?;
        for record in &corpus.records {
            writer.write_record(
                corpus
                    .columns
                    .iter()
                    .map(|column| record.get(column).unwrap_or_default()),
            )?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| DedupError::Io(e.into_error()))?;

        let path = self.path_for(&corpus.name);
        let staging = self.dir.join(format!(".{}_deduplicated.csv.tmp", corpus.name));
        fs::write(&staging, &bytes).await?;
        fs::rename(&staging, &path).await?;

        info!(
            "Wrote {} records of {} to {}",
            corpus.len(),
            corpus.name,
            path.display()
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::corpus::{Record, TextSchema};

    #[tokio::test]
    async fn test_write_keeps_header_and_order() {
        let dir = TempDir::new().unwrap();
        let writer = RecordWriter::new(dir.path().join("out")).await.unwrap();
        let corpus = Corpus {
            name: "trials".into(),
            columns: vec!["id".into(), "title".into(), "summary".into()],
            records: vec![
                Record::new(
                    0,
                    [("id", Some("NCT01")), ("title", Some("A, B")), ("summary", None)],
                ),
                Record::new(
                    3,
                    [("id", Some("NCT04")), ("title", Some("C")), ("summary", Some("D"))],
                ),
            ],
            schema: TextSchema::single(["title"]),
        };

        let path = writer.write(&corpus).await.unwrap();
        assert_eq!(path, dir.path().join("out/trials_deduplicated.csv"));

        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content, "id,title,summary\nNCT01,\"A, B\",\nNCT04,C,D\n");
    }

    #[tokio::test]
    async fn test_write_empty_corpus() {
        let dir = TempDir::new().unwrap();
        let writer = RecordWriter::new(dir.path()).await.unwrap();
        let corpus = Corpus {
            name: "empty".into(),
            columns: vec!["text".into()],
            records: Vec::new(),
            schema: TextSchema::single(["text"]),
        };

        let path = writer.write(&corpus).await.unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "text\n");
    }
}
