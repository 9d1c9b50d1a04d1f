pub mod cache;
pub mod llama;

use async_trait::async_trait;
use thiserror::Error;

pub use cache::{CacheClock, EmbeddingCache, LogicalClock};
pub use llama::LlamaEmbedder;

use crate::llm::RuntimeError;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("no embedding model path is configured")]
    MissingModelPath,
    #[error("embedding server error: {0}")]
    Server(String),
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Turns texts into fixed-dimension vectors, one per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}
