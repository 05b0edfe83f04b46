//! Metrics indexer interface and the local file backend.
//!
//! Indexing failures are reported to the caller but are never fatal to a
//! run; remote backends (opensearch, prometheus scrape) are external
//! collaborators behind the same trait.
use std::{fs, io::Write, path::PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::config::IndexerConfig;

/// Per-call indexing options.
#[derive(Debug, Clone)]
pub struct IndexingOpts {
    /// Discriminator grouping the documents, also used as the file stem by
    /// the local backend.
    pub metric_name: String,
}

/// Outcome of one indexing call.
#[derive(Debug)]
pub struct IndexerResponse {
    /// Documents successfully indexed.
    pub indexed: usize,
    /// Documents the backend rejected.
    pub errored: usize,
    /// Backend-specific detail.
    pub message: String,
}

impl std::fmt::Display for IndexerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "indexed {} documents, {} errored: {}",
            self.indexed, self.errored, self.message
        )
    }
}

/// Indexing failed wholesale.
#[derive(Debug, thiserror::Error)]
pub enum IndexingError {
    /// The backend could not persist the documents.
    #[error("indexing error: {0}")]
    Io(#[from] std::io::Error),
    /// The documents could not be serialized.
    #[error("indexing serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A metrics indexer backend.
pub trait Indexer: Send + Sync {
    /// Persist `documents` under the metric name in `opts`.
    fn index(&self, documents: &[Value], opts: &IndexingOpts)
        -> Result<IndexerResponse, IndexingError>;
}

/// Writes each metric as a JSON array file under a local directory.
pub struct LocalIndexer {
    directory: PathBuf,
}

impl LocalIndexer {
    /// Create the backend, ensuring the target directory exists.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, IndexingError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }
}

impl Indexer for LocalIndexer {
    fn index(
        &self,
        documents: &[Value],
        opts: &IndexingOpts,
    ) -> Result<IndexerResponse, IndexingError> {
        let path = self.directory.join(format!("{}.json", opts.metric_name));
        debug!(?path, count = documents.len(), "writing metric file");
        let mut file = fs::File::create(&path)?;
        serde_json::to_writer_pretty(&mut file, documents)?;
        file.flush()?;
        Ok(IndexerResponse {
            indexed: documents.len(),
            errored: 0,
            message: path.display().to_string(),
        })
    }
}

/// Build the configured indexer backend.
pub fn from_config(config: &IndexerConfig) -> Result<Box<dyn Indexer>, IndexingError> {
    match config {
        IndexerConfig::Local { metrics_directory } => {
            Ok(Box::new(LocalIndexer::new(metrics_directory)?))
        }
    }
}
