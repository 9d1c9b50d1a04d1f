pub mod graph;
pub mod llama_server;
pub mod native;
pub mod runtime;
pub mod sampling;
pub mod stream;
pub mod tensor;
pub mod tokenizer;
pub mod types;

use thiserror::Error;

pub use runtime::{select_backend, BackendSelection, InferenceRuntime};
pub use stream::TokenStream;
pub use types::{Generation, GenerationRequest, RuntimeKind};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no language model path is configured")]
    MissingModelPath,
    #[error("model not found at {0}")]
    ModelNotFound(String),
    #[error("failed to load {backend} backend: {detail}")]
    BackendLoad { backend: RuntimeKind, detail: String },
    #[error("the {0} backend is not compiled into this build")]
    Unsupported(RuntimeKind),
    #[error("llama-server error: {0}")]
    Server(String),
    #[error("{0}")]
    Generation(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
