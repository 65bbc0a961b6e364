//! Per-corpus embedding cache.
//!
//! Each cache key (a corpus name, or a corpus name plus a field suffix) maps
//! to one artifact `<dir>/<key>_embeddings.bin`. An artifact stores the
//! vectors together with the original indices of the records they belong
//! to, so a corpus that lost records to deduplication can be realigned with
//! its entry later. A present artifact is ground truth: callers load it
//! instead of re-encoding, and nothing here ever invalidates it when the
//! underlying corpus changes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

const ARTIFACT_SUFFIX: &str = "_embeddings.bin";

/// On-disk layout of one cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheArtifact {
    /// Key the artifact was written under.
    key: String,

    /// Length of every vector.
    dimension: usize,

    /// Original record index of each vector.
    indices: Vec<usize>,

    /// The vectors, aligned with `indices`.
    vectors: Vec<Embedding>,
}

/// Vectors of one cache entry and the records they belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Original index of the record behind each vector, ascending.
    pub indices: Vec<usize>,

    /// One vector per index.
    pub vectors: Vec<Embedding>,
}

impl CacheEntry {
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

/// Directory-backed store of embedding arrays, one artifact per key.
///
/// Assumes a single writer; concurrent runs against the same directory are
/// not coordinated.
#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    /// Directory holding the artifacts.
    dir: PathBuf,
}

impl EmbeddingCache {
    /// Open (and create if needed) a cache rooted at `dir`.
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| EmbeddingError::Cache(format!("{}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    /// Directory holding the artifacts.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the artifact for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}{ARTIFACT_SUFFIX}"))
    }

    /// Check if an entry exists for `key`.
    pub async fn contains(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(fs::try_exists(self.path_for(key)).await?)
    }

    /// Load the entry stored under `key`, or `None` if there is no entry.
    pub async fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        validate_key(key)?;
        let path = self.path_for(key);

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No cached embeddings for {key}");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let artifact: CacheArtifact = bincode::deserialize(&bytes)?;
        if artifact.key != key {
            return Err(EmbeddingError::Cache(format!(
                "{} holds embeddings for {}, expected {key}",
                path.display(),
                artifact.key
            )));
        }
        if artifact.indices.len() != artifact.vectors.len() {
            return Err(EmbeddingError::Cache(format!(
                "{} holds {} indices for {} vectors",
                path.display(),
                artifact.indices.len(),
                artifact.vectors.len()
            )));
        }
        for vector in &artifact.vectors {
            if vector.len() != artifact.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: artifact.dimension,
                    actual: vector.len(),
                });
            }
        }

        info!(
            "Loaded {} cached embeddings for {key} (dimension {})",
            artifact.vectors.len(),
            artifact.dimension
        );
        Ok(Some(CacheEntry {
            indices: artifact.indices,
            vectors: artifact.vectors,
        }))
    }

    /// Store `vectors` under `key`, replacing any previous entry.
    ///
    /// `indices[i]` is the original record index of `vectors[i]`. The
    /// artifact is written to a sibling temporary file and renamed into
    /// place, so readers never observe a half-written entry.
    pub async fn save(
        &self,
        key: &str,
        indices: &[usize],
        vectors: &[Embedding],
    ) -> Result<PathBuf> {
        validate_key(key)?;

        if indices.len() != vectors.len() {
            return Err(EmbeddingError::Cache(format!(
                "{} indices for {} vectors under {key}",
                indices.len(),
                vectors.len()
            )));
        }

        let dimension = vectors.first().map_or(0, Vec::len);
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }

        let artifact = CacheArtifact {
            key: key.to_string(),
            dimension,
            indices: indices.to_vec(),
            vectors: vectors.to_vec(),
        };
        let bytes = bincode::serialize(&artifact)?;

        let path = self.path_for(key);
        let staging = self.dir.join(format!(".{key}{ARTIFACT_SUFFIX}.tmp"));
        fs::write(&staging, &bytes).await?;
        fs::rename(&staging, &path).await?;

        info!(
            "Saved {} embeddings for {key} to {}",
            vectors.len(),
            path.display()
        );
        Ok(path)
    }

    /// Delete the entry for `key`. Returns whether an entry existed.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => {
                info!("Removed cached embeddings for {key}");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Keys of every entry currently in the cache, sorted.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(ARTIFACT_SUFFIX) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Keys become file names, so they must stay inside the cache directory.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\'])
        || key.contains("..")
    {
        return Err(EmbeddingError::Cache(format!("invalid cache key: {key:?}")));
    }
    Ok(())
}
