//! Retrieval-augmented answering over the per-subject indexes.

mod engine;
pub mod prompt;
pub mod subject;

use thiserror::Error;

pub use engine::{QueryEvent, QueryOutcome, QueryStream, RetrievalEngine};
pub use prompt::HistoryMessage;

use crate::embedding::EmbeddingError;
use crate::index::IndexError;
use crate::llm::RuntimeError;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("embedding model failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("index store failed: {0}")]
    Index(#[from] IndexError),
    #[error("language model failed: {0}")]
    Runtime(#[from] RuntimeError),
}
