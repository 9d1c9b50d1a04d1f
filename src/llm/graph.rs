//! ONNX Runtime backend, compiled with the `onnx` feature.

use std::path::Path;

use super::types::SamplingParams;
use super::RuntimeError;
use crate::core::config::LlmSettings;

#[cfg(feature = "onnx")]
use std::sync::Arc;

/// Causal LM exported to ONNX plus its tokenizer. The graph is re-run over the
/// full sequence each step, so no past key/value inputs are required.
pub struct GraphBackend {
    #[cfg(feature = "onnx")]
    model: Arc<onnx::OnnxModel>,
}

impl GraphBackend {
    #[cfg(feature = "onnx")]
    pub async fn load(settings: &LlmSettings, model_dir: &Path) -> Result<Self, RuntimeError> {
        tracing::info!("Loading ONNX model from {}", model_dir.display());
        let model_dir = model_dir.to_path_buf();
        let threads = settings.threads;
        let model = tokio::task::spawn_blocking(move || onnx::OnnxModel::load(&model_dir, threads))
            .await
            .map_err(|e| RuntimeError::BackendLoad {
                backend: super::RuntimeKind::Graph,
                detail: e.to_string(),
            })??;
        tracing::info!("ONNX model loaded");
        Ok(Self {
            model: Arc::new(model),
        })
    }

    #[cfg(not(feature = "onnx"))]
    pub async fn load(_settings: &LlmSettings, model_dir: &Path) -> Result<Self, RuntimeError> {
        tracing::warn!(
            "ONNX support is not compiled in; cannot load {}",
            model_dir.display()
        );
        Err(RuntimeError::Unsupported(super::RuntimeKind::Graph))
    }

    #[cfg(feature = "onnx")]
    pub async fn complete(&self, prompt: &str, params: &SamplingParams) -> Result<String, RuntimeError> {
        let model = Arc::clone(&self.model);
        let prompt = prompt.to_string();
        let params = *params;
        tokio::task::spawn_blocking(move || model.generate(&prompt, &params))
            .await
            .map_err(|e| RuntimeError::Generation(e.to_string()))?
    }

    #[cfg(not(feature = "onnx"))]
    pub async fn complete(&self, _prompt: &str, _params: &SamplingParams) -> Result<String, RuntimeError> {
        Err(RuntimeError::Unsupported(super::RuntimeKind::Graph))
    }
}

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::Tensor;
    use tokenizers::Tokenizer;

    use crate::llm::sampling::Sampler;
    use crate::llm::tokenizer::{decode, encode_prompt, load_tokenizer, stop_token_ids};
    use crate::llm::types::{RuntimeKind, SamplingParams};
    use crate::llm::RuntimeError;

    pub struct OnnxModel {
        session: Mutex<Session>,
        tokenizer: Tokenizer,
        stop_ids: Vec<u32>,
    }

    fn load_err(detail: impl ToString) -> RuntimeError {
        RuntimeError::BackendLoad {
            backend: RuntimeKind::Graph,
            detail: detail.to_string(),
        }
    }

    fn gen_err(detail: impl ToString) -> RuntimeError {
        RuntimeError::Generation(detail.to_string())
    }

    fn find_graph(model_dir: &Path) -> Result<PathBuf, RuntimeError> {
        let candidates = [
            model_dir.join("model.onnx"),
            model_dir.join("onnx").join("model.onnx"),
            model_dir.join("decoder_model.onnx"),
        ];
        candidates
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| load_err(format!("no ONNX graph found in {}", model_dir.display())))
    }

    impl OnnxModel {
        pub fn load(model_dir: &Path, threads: Option<usize>) -> Result<Self, RuntimeError> {
            let graph = find_graph(model_dir)?;
            let tokenizer = load_tokenizer(model_dir, RuntimeKind::Graph)?;
            let mut builder = Session::builder()
                .map_err(load_err)?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(load_err)?;
            if let Some(threads) = threads {
                builder = builder.with_intra_threads(threads).map_err(load_err)?;
            }
            let session = builder.commit_from_file(&graph).map_err(load_err)?;
            let stop_ids = stop_token_ids(&tokenizer);
            Ok(Self {
                session: Mutex::new(session),
                tokenizer,
                stop_ids,
            })
        }

        pub fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String, RuntimeError> {
            let mut tokens = encode_prompt(&self.tokenizer, prompt)?;
            let prompt_len = tokens.len();
            let mut sampler = Sampler::new(params);
            let mut session = self
                .session
                .lock()
                .map_err(|_| gen_err("ONNX session lock poisoned"))?;

            for _ in 0..params.max_tokens {
                let ids: Vec<i64> = tokens.iter().map(|&t| i64::from(t)).collect();
                let len = ids.len();
                let input_ids = Tensor::from_array(([1usize, len], ids)).map_err(gen_err)?;
                let mask = Tensor::from_array(([1usize, len], vec![1i64; len])).map_err(gen_err)?;
                let outputs = session
                    .run(ort::inputs![
                        "input_ids" => input_ids,
                        "attention_mask" => mask,
                    ])
                    .map_err(gen_err)?;
                let (shape, data) = outputs["logits"]
                    .try_extract_tensor::<f32>()
                    .map_err(gen_err)?;
                let vocab = shape
                    .last()
                    .copied()
                    .filter(|v| *v > 0)
                    .ok_or_else(|| gen_err("logits output has no vocabulary axis"))?
                    as usize;
                if data.len() < vocab {
                    return Err(gen_err("logits output is shorter than its vocabulary"));
                }
                let mut last = data[data.len() - vocab..].to_vec();
                let next = sampler.sample(&mut last, &tokens);
                if self.stop_ids.contains(&next) {
                    break;
                }
                tokens.push(next);
            }

            let text = decode(&self.tokenizer, &tokens[prompt_len..])?;
            Ok(text.trim().to_string())
        }
    }
}
