//! Per-subject vector indexes: the manifest that describes them, the artifacts
//! on disk, ingestion from source documents and the fallback chain that makes
//! a collection available.

pub mod bundle;
pub mod checksum;
pub mod documents;
pub mod ingest;
pub mod manifest;
pub mod store;
pub mod vector;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use checksum::compute_checksum;
pub use ingest::{IndexIngestor, IngestOutcome};
pub use manifest::{ArtifactPair, CollectionEntry, CollectionManifest, ManifestDocument};
pub use store::IndexStore;
pub use vector::{ChunkMetadata, LoadedCollection, Neighbor, RetrievedChunk, VectorIndex};

use crate::embedding::EmbeddingError;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt artifact {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("invalid bundle {path}: {reason}")]
    Bundle { path: PathBuf, reason: String },
    #[error("no text chunks generated for subject '{0}'")]
    NoChunks(String),
    #[error("collection '{0}' is not available locally and could not be installed")]
    Unavailable(String),
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("background task failed: {0}")]
    Task(String),
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(io::Error) -> IndexError + '_ {
    move |source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    }
}
