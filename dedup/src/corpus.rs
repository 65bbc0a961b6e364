//! Records, corpora and text composition.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// String a missing value composes to.
pub const MISSING_VALUE: &str = "nan";

/// One row of a corpus: column name → value, in header order.
///
/// `None` marks a missing value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Position of the record in the corpus as loaded.
    pub index: usize,

    /// Column values in header order.
    pub values: IndexMap<String, Option<String>>,
}

impl Record {
    /// Create a record from `(column, value)` pairs.
    pub fn new<I, K, V>(index: usize, values: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            index,
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.map(Into::into)))
                .collect(),
        }
    }

    /// Value of `column`, if present and not missing.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(|v| v.as_deref())
    }
}

/// Which part of a record a set of embeddings describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    /// All text columns of a single-field corpus.
    Text,
    /// The question side of a question/answer corpus.
    Question,
    /// The answer side of a question/answer corpus.
    Answer,
}

impl FieldRole {
    /// Every role, in the order cache entries of a corpus are looked up.
    pub const ALL: [FieldRole; 3] = [Self::Text, Self::Question, Self::Answer];

    /// Cache key for this field of `corpus`.
    pub fn cache_key(self, corpus: &str) -> String {
        match self {
            Self::Text => corpus.to_string(),
            Self::Question => format!("{corpus}_question"),
            Self::Answer => format!("{corpus}_answer"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Question => "question",
            Self::Answer => "answer",
        }
    }
}

impl std::fmt::Display for FieldRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Columns that make up the text of a corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextSchema {
    /// One composed text per record.
    Single { columns: Vec<String> },

    /// Question and answer composed and deduplicated separately.
    Dual {
        question: Vec<String>,
        answer: Vec<String>,
    },
}

impl TextSchema {
    /// Single-field schema over `columns`.
    pub fn single<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Single {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Question/answer schema.
    pub fn dual<I, J, S>(question: I, answer: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Dual {
            question: question.into_iter().map(Into::into).collect(),
            answer: answer.into_iter().map(Into::into).collect(),
        }
    }

    /// Fields in the order they are deduplicated.
    pub fn fields(&self) -> Vec<(FieldRole, &[String])> {
        match self {
            Self::Single { columns } => vec![(FieldRole::Text, columns.as_slice())],
            Self::Dual { question, answer } => vec![
                (FieldRole::Question, question.as_slice()),
                (FieldRole::Answer, answer.as_slice()),
            ],
        }
    }

    /// Every column referenced by the schema.
    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.fields()
            .into_iter()
            .flat_map(|(_, columns)| columns.iter())
    }
}

/// A named, ordered collection of records from one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corpus {
    /// Corpus name, unique within a run.
    pub name: String,

    /// Column header of the source, in order.
    pub columns: Vec<String>,

    /// Records in source order.
    pub records: Vec<Record>,

    /// Columns used for text composition.
    pub schema: TextSchema,
}

impl Corpus {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Original indices of the records currently in the corpus.
    pub fn indices(&self) -> Vec<usize> {
        self.records.iter().map(|r| r.index).collect()
    }

    /// Keep only records whose entry in `removed` is false.
    ///
    /// Returns the number of records dropped.
    pub(crate) fn retain_unmarked(&mut self, removed: &[bool]) -> usize {
        let before = self.records.len();
        let mut flags = removed.iter();
        self.records.retain(|_| !flags.next().copied().unwrap_or(false));
        before - self.records.len()
    }
}

/// Join the selected columns of `record` with `separator`.
///
/// Columns appear in the order given. Missing values become [`MISSING_VALUE`]
/// rather than being skipped, so composition never fails.
pub fn compose(record: &Record, columns: &[String], separator: &str) -> String {
    columns
        .iter()
        .map(|column| record.get(column).unwrap_or(MISSING_VALUE))
        .collect::<Vec<_>>()
        .join(separator)
}

/// Compose every record of `corpus`, in order.
pub fn compose_corpus(corpus: &Corpus, columns: &[String], separator: &str) -> Vec<String> {
    corpus
        .records
        .iter()
        .map(|record| compose(record, columns, separator))
        .collect()
}
