use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::defaults;
use crate::llm::types::{QuantizationMode, RuntimeKind};

/// Process-wide configuration, loaded and validated once at startup and then
/// handed down to every component by reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub index: IndexSettings,
    pub ingest: IngestSettings,
    pub embedding: EmbeddingSettings,
    pub llm: LlmSettings,
    pub retrieval: RetrievalSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub embeddings_root: PathBuf,
    pub manifest_path: PathBuf,
    pub data_root: PathBuf,
    pub base_bundle: Option<PathBuf>,
    pub base_bundle_version: Option<String>,
    pub subject_bundle_dir: Option<PathBuf>,
    pub schema_version: String,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            embeddings_root: PathBuf::from(defaults::EMBEDDINGS_ROOT),
            manifest_path: PathBuf::from(defaults::MANIFEST_PATH),
            data_root: PathBuf::from(defaults::DATA_ROOT),
            base_bundle: None,
            base_bundle_version: None,
            subject_bundle_dir: None,
            schema_version: defaults::INDEX_SCHEMA_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Chunk length in characters.
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks.
    pub chunk_overlap: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            chunk_size: defaults::CHUNK_SIZE,
            chunk_overlap: defaults::CHUNK_OVERLAP,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// GGUF embedding model served by a dedicated llama-server instance.
    pub model_path: Option<PathBuf>,
    pub cache_capacity: usize,
    pub batch_size: usize,
    pub port: u16,
    pub context_size: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            cache_capacity: defaults::EMBEDDING_CACHE_CAPACITY,
            batch_size: defaults::EMBEDDING_BATCH_SIZE,
            port: defaults::EMBEDDING_SERVER_PORT,
            context_size: defaults::EMBEDDING_CONTEXT_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model_path: Option<PathBuf>,
    /// Explicit backend override; sniffed from the model directory when unset.
    pub runtime: Option<RuntimeKind>,
    /// `auto`, `gpu`, `cpu`, `cuda`, `cuda:N` or `metal`.
    pub device: Option<String>,
    pub quantization: QuantizationMode,
    pub batch_size: usize,
    pub context_size: usize,
    pub threads: Option<usize>,
    pub gpu_layers: i32,
    pub port: u16,
    pub server_path: Option<PathBuf>,
    pub startup_timeout_secs: u64,
    pub max_tokens: usize,
    pub temperature: f32,
    pub warmup_prompt: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            runtime: None,
            device: None,
            quantization: QuantizationMode::None,
            batch_size: defaults::LLM_BATCH_SIZE,
            context_size: defaults::LLM_CONTEXT_SIZE,
            threads: None,
            gpu_layers: -1,
            port: defaults::LLM_SERVER_PORT,
            server_path: None,
            startup_timeout_secs: defaults::LLM_STARTUP_TIMEOUT_SECS,
            max_tokens: defaults::LLM_MAX_TOKENS,
            temperature: defaults::LLM_TEMPERATURE,
            warmup_prompt: defaults::WARMUP_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectProfile {
    pub name: String,
    /// Short topic list shown to the model when classifying questions.
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub default_subject: String,
    /// Subject that switches the prompt to the English-tutor persona.
    pub english_subject: String,
    pub subjects: Vec<SubjectProfile>,
    pub greetings: Vec<String>,
    pub top_k: usize,
    pub distance_threshold: f32,
    pub assistant_name: String,
    pub user_label: String,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            default_subject: defaults::DEFAULT_SUBJECT.to_string(),
            english_subject: defaults::ENGLISH_SUBJECT.to_string(),
            subjects: defaults::subjects(),
            greetings: defaults::greetings(),
            top_k: defaults::TOP_K,
            distance_threshold: defaults::DISTANCE_THRESHOLD,
            assistant_name: "Inti".to_string(),
            user_label: "Usuario".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Browser origins allowed by CORS; empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: defaults::SERVER_HOST.to_string(),
            port: defaults::SERVER_PORT,
            cors_origins: Vec::new(),
        }
    }
}
