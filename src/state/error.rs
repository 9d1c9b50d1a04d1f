use thiserror::Error;

use super::ServiceStatus;
use crate::core::config::ConfigError;
use crate::rag::RetrievalError;

#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Failed to load configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to initialize retrieval engine: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Illegal state transition from {from} to {to}")]
    IllegalTransition {
        from: ServiceStatus,
        to: ServiceStatus,
    },
}
