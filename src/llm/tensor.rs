//! Safetensors backend running Gemma-family weights through candle.

use std::path::Path;

use tokio::sync::mpsc;

use super::types::SamplingParams;
use super::RuntimeError;
use crate::core::config::LlmSettings;

#[cfg(feature = "tensor")]
use std::sync::Arc;

pub struct TensorBackend {
    #[cfg(feature = "tensor")]
    model: Arc<candle::TensorModel>,
}

impl TensorBackend {
    #[cfg(feature = "tensor")]
    pub async fn load(settings: &LlmSettings, model_dir: &Path) -> Result<Self, RuntimeError> {
        tracing::info!("Loading safetensors model from {}", model_dir.display());
        let model_dir = model_dir.to_path_buf();
        let settings = settings.clone();
        let model = tokio::task::spawn_blocking(move || candle::TensorModel::load(&settings, &model_dir))
            .await
            .map_err(|e| RuntimeError::BackendLoad {
                backend: super::RuntimeKind::Tensor,
                detail: e.to_string(),
            })??;
        Ok(Self {
            model: Arc::new(model),
        })
    }

    #[cfg(not(feature = "tensor"))]
    pub async fn load(_settings: &LlmSettings, model_dir: &Path) -> Result<Self, RuntimeError> {
        tracing::warn!(
            "Tensor support is not compiled in; cannot load {}",
            model_dir.display()
        );
        Err(RuntimeError::Unsupported(super::RuntimeKind::Tensor))
    }

    #[cfg(feature = "tensor")]
    pub async fn complete(&self, prompt: &str, params: &SamplingParams) -> Result<String, RuntimeError> {
        let model = Arc::clone(&self.model);
        let prompt = prompt.to_string();
        let params = *params;
        let text = tokio::task::spawn_blocking(move || model.generate(&prompt, &params, |_| true))
            .await
            .map_err(|e| RuntimeError::Generation(e.to_string()))??;
        Ok(text.trim().to_string())
    }

    #[cfg(not(feature = "tensor"))]
    pub async fn complete(&self, _prompt: &str, _params: &SamplingParams) -> Result<String, RuntimeError> {
        Err(RuntimeError::Unsupported(super::RuntimeKind::Tensor))
    }

    /// Generates on a blocking thread, sending each decoded delta as soon as
    /// it is available. A closed receiver stops generation at the next token.
    #[cfg(feature = "tensor")]
    pub fn stream(
        &self,
        prompt: &str,
        params: &SamplingParams,
    ) -> mpsc::Receiver<Result<String, RuntimeError>> {
        let (tx, rx) = mpsc::channel(100);
        let model = Arc::clone(&self.model);
        let prompt = prompt.to_string();
        let params = *params;
        tokio::task::spawn_blocking(move || {
            let result = model.generate(&prompt, &params, |delta| {
                tx.blocking_send(Ok(delta.to_string())).is_ok()
            });
            if let Err(err) = result {
                let _ = tx.blocking_send(Err(err));
            }
        });
        rx
    }

    #[cfg(not(feature = "tensor"))]
    pub fn stream(
        &self,
        _prompt: &str,
        _params: &SamplingParams,
    ) -> mpsc::Receiver<Result<String, RuntimeError>> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(Err(RuntimeError::Unsupported(super::RuntimeKind::Tensor)));
        rx
    }
}

#[cfg(feature = "tensor")]
mod candle {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;
    use candle_transformers::models::gemma::{Config, Model};
    use tokenizers::Tokenizer;

    use crate::core::config::LlmSettings;
    use crate::llm::sampling::Sampler;
    use crate::llm::tokenizer::{
        decode, encode_prompt, load_tokenizer, stop_token_ids, IncrementalDecoder,
    };
    use crate::llm::types::{
        resolve_device_kind, DeviceKind, DevicePreference, QuantizationMode, RuntimeKind,
        SamplingParams,
    };
    use crate::llm::RuntimeError;

    pub struct TensorModel {
        model: Mutex<Model>,
        tokenizer: Tokenizer,
        device: Device,
        stop_ids: Vec<u32>,
    }

    fn load_err(detail: impl ToString) -> RuntimeError {
        RuntimeError::BackendLoad {
            backend: RuntimeKind::Tensor,
            detail: detail.to_string(),
        }
    }

    fn gen_err(detail: impl ToString) -> RuntimeError {
        RuntimeError::Generation(detail.to_string())
    }

    fn select_device(settings: &LlmSettings) -> Result<(Device, DeviceKind), RuntimeError> {
        let preference = settings.device.as_deref().and_then(DevicePreference::parse);
        let kind = resolve_device_kind(
            preference,
            candle_core::utils::cuda_is_available(),
            candle_core::utils::metal_is_available(),
        );
        let device = match kind {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(load_err)?,
            DeviceKind::Metal => Device::new_metal(0).map_err(load_err)?,
        };
        Ok((device, kind))
    }

    fn select_dtype(mode: QuantizationMode, kind: DeviceKind) -> DType {
        let default = if kind.is_accelerator() {
            DType::F16
        } else {
            DType::F32
        };
        match mode {
            QuantizationMode::None => default,
            QuantizationMode::Half => DType::F16,
            QuantizationMode::BFloat16 => DType::BF16,
            QuantizationMode::Int8 | QuantizationMode::Int4 => {
                tracing::warn!(
                    "Quantization {:?} is not available for safetensors weights; loading in {:?}",
                    mode,
                    default
                );
                default
            }
        }
    }

    fn weight_files(model_dir: &Path) -> Result<Vec<PathBuf>, RuntimeError> {
        let entries = std::fs::read_dir(model_dir).map_err(load_err)?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(load_err(format!(
                "no safetensors weights in {}",
                model_dir.display()
            )));
        }
        Ok(files)
    }

    impl TensorModel {
        pub fn load(settings: &LlmSettings, model_dir: &Path) -> Result<Self, RuntimeError> {
            let (device, kind) = select_device(settings)?;
            let dtype = select_dtype(settings.quantization, kind);
            tracing::info!("Using device {:?} with dtype {:?}", kind, dtype);

            let config_raw =
                std::fs::read_to_string(model_dir.join("config.json")).map_err(load_err)?;
            let config: Config = serde_json::from_str(&config_raw).map_err(load_err)?;
            let tokenizer = load_tokenizer(model_dir, RuntimeKind::Tensor)?;
            let files = weight_files(model_dir)?;

            // SAFETY: weight files are treated as read-only for the process lifetime.
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files, dtype, &device) }
                .map_err(load_err)?;
            let model = Model::new(false, &config, vb).map_err(load_err)?;
            let stop_ids = stop_token_ids(&tokenizer);

            Ok(Self {
                model: Mutex::new(model),
                tokenizer,
                device,
                stop_ids,
            })
        }

        /// Runs the decode loop. `emit` receives text deltas and returns false
        /// to stop early.
        pub fn generate(
            &self,
            prompt: &str,
            params: &SamplingParams,
            mut emit: impl FnMut(&str) -> bool,
        ) -> Result<String, RuntimeError> {
            let mut tokens = encode_prompt(&self.tokenizer, prompt)?;
            let prompt_len = tokens.len();
            let mut sampler = Sampler::new(params);
            let mut decoder = IncrementalDecoder::new(&self.tokenizer);
            let mut model = self
                .model
                .lock()
                .map_err(|_| gen_err("model lock poisoned"))?;
            model.clear_kv_cache();

            let mut offset = 0;
            for step in 0..params.max_tokens {
                let context = if step == 0 {
                    &tokens[..]
                } else {
                    &tokens[tokens.len() - 1..]
                };
                let input = Tensor::new(context, &self.device)
                    .and_then(|t| t.unsqueeze(0))
                    .map_err(gen_err)?;
                let logits = model.forward(&input, offset).map_err(gen_err)?;
                offset += context.len();

                let mut logits = logits
                    .squeeze(0)
                    .and_then(|t| t.squeeze(0))
                    .and_then(|t| t.to_dtype(DType::F32))
                    .and_then(|t| t.to_vec1::<f32>())
                    .map_err(gen_err)?;
                let next = sampler.sample(&mut logits, &tokens);
                if self.stop_ids.contains(&next) {
                    break;
                }
                tokens.push(next);

                if let Some(delta) = decoder.step(&tokens[prompt_len..])? {
                    if !emit(&delta) {
                        break;
                    }
                }
            }

            decode(&self.tokenizer, &tokens[prompt_len..])
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn accelerators_default_to_half_precision() {
            assert_eq!(select_dtype(QuantizationMode::None, DeviceKind::Cpu), DType::F32);
            assert_eq!(select_dtype(QuantizationMode::None, DeviceKind::Metal), DType::F16);
            assert_eq!(select_dtype(QuantizationMode::BFloat16, DeviceKind::Cpu), DType::BF16);
            assert_eq!(select_dtype(QuantizationMode::Int4, DeviceKind::Cpu), DType::F32);
        }

        #[test]
        fn missing_weights_are_a_load_error() {
            let dir = tempfile::tempdir().unwrap();
            let err = weight_files(dir.path()).unwrap_err();
            assert!(matches!(err, RuntimeError::BackendLoad { .. }));
        }
    }
}
