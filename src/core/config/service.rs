use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use super::paths::AppPaths;
use super::settings::Settings;
use super::validation::{validate_settings, ConfigError};
use crate::llm::types::{QuantizationMode, RuntimeKind};

#[derive(Clone)]
pub struct ConfigService {
    paths: Arc<AppPaths>,
}

impl ConfigService {
    pub fn new(paths: Arc<AppPaths>) -> Self {
        Self { paths }
    }

    pub fn config_path(&self) -> PathBuf {
        if let Ok(path) = env::var("AULA_CONFIG_PATH") {
            return PathBuf::from(path);
        }

        let user_config = self.paths.data_dir.join("config.yml");
        if user_config.exists() {
            return user_config;
        }

        self.paths.project_root.join("config.yml")
    }

    /// Builds the process configuration: defaults, then the YAML file, then
    /// `AULA_*` environment overrides. Relative paths are anchored at the data
    /// directory and the result is validated before it is returned.
    pub fn load(&self) -> Result<Settings, ConfigError> {
        let mut settings = self.load_file()?;
        apply_env_overrides(&mut settings, |key| env::var(key).ok())?;
        self.resolve_paths(&mut settings);
        validate_settings(&settings)?;
        Ok(settings)
    }

    fn load_file(&self) -> Result<Settings, ConfigError> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(Settings::default());
        }

        let contents = fs::read_to_string(&path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if contents.trim().is_empty() {
            return Ok(Settings::default());
        }
        serde_yaml::from_str::<Settings>(&contents).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    fn resolve_paths(&self, settings: &mut Settings) {
        let paths = &self.paths;
        let index = &mut settings.index;
        index.embeddings_root = paths.resolve(&index.embeddings_root);
        index.manifest_path = paths.resolve(&index.manifest_path);
        index.data_root = paths.resolve(&index.data_root);
        index.base_bundle = index.base_bundle.as_deref().map(|p| paths.resolve(p));
        index.subject_bundle_dir = index.subject_bundle_dir.as_deref().map(|p| paths.resolve(p));

        settings.embedding.model_path = settings
            .embedding
            .model_path
            .as_deref()
            .map(|p| paths.resolve(p));
        settings.llm.model_path = settings.llm.model_path.as_deref().map(|p| paths.resolve(p));
    }
}

/// Applies environment-style overrides. `lookup` abstracts the environment so
/// the mapping can be exercised without touching process state.
pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(v) = get("AULA_EMBEDDINGS_ROOT") {
        settings.index.embeddings_root = PathBuf::from(v);
    }
    if let Some(v) = get("AULA_EMBEDDINGS_MANIFEST") {
        settings.index.manifest_path = PathBuf::from(v);
    }
    if let Some(v) = get("AULA_INDEX_DATA_ROOT") {
        settings.index.data_root = PathBuf::from(v);
    }
    if let Some(v) = get("AULA_INDEX_BASE_BUNDLE") {
        settings.index.base_bundle = Some(PathBuf::from(v));
    }
    if let Some(v) = get("AULA_INDEX_BASE_BUNDLE_VERSION") {
        settings.index.base_bundle_version = Some(v);
    }
    if let Some(v) = get("AULA_INDEX_SUBJECT_BUNDLE_DIR") {
        settings.index.subject_bundle_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = get("AULA_INDEX_SCHEMA_VERSION") {
        settings.index.schema_version = v;
    }
    if let Some(v) = get("AULA_EMBEDDING_MODEL_PATH") {
        settings.embedding.model_path = Some(PathBuf::from(v));
    }
    if let Some(v) = get("AULA_LLM_MODEL_PATH") {
        settings.llm.model_path = Some(PathBuf::from(v));
    }
    if let Some(v) = get("AULA_LLM_RUNTIME") {
        settings.llm.runtime = Some(parse_value::<RuntimeKind>("AULA_LLM_RUNTIME", &v)?);
    }
    if let Some(v) = get("AULA_LLM_DEVICE") {
        settings.llm.device = Some(v);
    }
    if let Some(v) = get("AULA_LLM_QUANTIZATION") {
        settings.llm.quantization = parse_value::<QuantizationMode>("AULA_LLM_QUANTIZATION", &v)?;
    }
    if let Some(v) = get("AULA_LLM_BATCH_SIZE") {
        settings.llm.batch_size = parse_value("AULA_LLM_BATCH_SIZE", &v)?;
    }
    if let Some(v) = get("AULA_LLM_CONTEXT_SIZE") {
        settings.llm.context_size = parse_value("AULA_LLM_CONTEXT_SIZE", &v)?;
    }
    if let Some(v) = lookup("AULA_LLM_WARMUP_PROMPT").filter(|v| !v.trim().is_empty()) {
        settings.llm.warmup_prompt = v;
    }
    if let Some(v) = get("AULA_LLAMA_SERVER_PATH") {
        settings.llm.server_path = Some(PathBuf::from(v));
    }
    if let Some(v) = get("AULA_DEFAULT_SUBJECT") {
        settings.retrieval.default_subject = v;
    }
    if let Some(v) = get("PORT") {
        settings.server.port = parse_value("PORT", &v)?;
    }

    Ok(())
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
