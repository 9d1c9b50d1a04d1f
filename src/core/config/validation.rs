use thiserror::Error;

use super::settings::Settings;
use crate::llm::types::DevicePreference;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("{field} must be between {min} and {max}, got {actual}")]
    OutOfRange {
        field: String,
        min: String,
        max: String,
        actual: String,
    },
    #[error("{0}")]
    Invalid(String),
}

pub fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    let ingest = &settings.ingest;
    validate_range("ingest.chunk_size", ingest.chunk_size, 1, 1_000_000)?;
    if ingest.chunk_overlap >= ingest.chunk_size {
        return Err(ConfigError::Invalid(format!(
            "ingest.chunk_overlap ({}) must be smaller than ingest.chunk_size ({})",
            ingest.chunk_overlap, ingest.chunk_size
        )));
    }

    if settings.index.schema_version.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "index.schema_version must not be empty".to_string(),
        ));
    }

    let embedding = &settings.embedding;
    validate_range("embedding.cache_capacity", embedding.cache_capacity, 1, 10_000_000)?;
    validate_range("embedding.batch_size", embedding.batch_size, 1, 4096)?;
    validate_range("embedding.context_size", embedding.context_size, 1, 1_000_000)?;

    let llm = &settings.llm;
    validate_range("llm.batch_size", llm.batch_size, 1, 65_536)?;
    validate_range("llm.context_size", llm.context_size, 1, 10_000_000)?;
    validate_range("llm.max_tokens", llm.max_tokens, 1, 1_000_000)?;
    if !(0.0..=5.0).contains(&llm.temperature) {
        return Err(ConfigError::OutOfRange {
            field: "llm.temperature".to_string(),
            min: "0".to_string(),
            max: "5".to_string(),
            actual: llm.temperature.to_string(),
        });
    }
    if llm.gpu_layers < -1 {
        return Err(ConfigError::InvalidValue {
            key: "llm.gpu_layers".to_string(),
            value: llm.gpu_layers.to_string(),
        });
    }
    if let Some(device) = &llm.device {
        DevicePreference::parse(device).ok_or_else(|| ConfigError::InvalidValue {
            key: "llm.device".to_string(),
            value: device.clone(),
        })?;
    }

    let retrieval = &settings.retrieval;
    validate_range("retrieval.top_k", retrieval.top_k, 1, 1_000)?;
    if !retrieval.distance_threshold.is_finite() || retrieval.distance_threshold <= 0.0 {
        return Err(ConfigError::InvalidValue {
            key: "retrieval.distance_threshold".to_string(),
            value: retrieval.distance_threshold.to_string(),
        });
    }
    if retrieval.default_subject.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "retrieval.default_subject must not be empty".to_string(),
        ));
    }
    for subject in &retrieval.subjects {
        if subject.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "retrieval.subjects entries need a name".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_range(field: &str, actual: usize, min: usize, max: usize) -> Result<(), ConfigError> {
    if actual < min || actual > max {
        return Err(ConfigError::OutOfRange {
            field: field.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
