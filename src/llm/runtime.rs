use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use super::graph::GraphBackend;
use super::native::{NativeBackend, END_OF_TURN};
use super::stream::{error_text, TokenStream};
use super::tensor::TensorBackend;
use super::types::{Generation, GenerationRequest, RuntimeKind, SamplingParams};
use super::RuntimeError;
use crate::core::config::LlmSettings;

const WARMUP_MAX_TOKENS: usize = 8;

type FragmentReceiver = mpsc::Receiver<Result<String, RuntimeError>>;

/// Which backend a model path resolves to, and the file or directory the
/// backend should load.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSelection {
    pub kind: RuntimeKind,
    pub model_path: PathBuf,
}

/// An explicit override wins. Without one, a GGUF file (or a directory holding
/// one) selects the native backend and anything else the tensor backend.
pub fn select_backend(
    model_path: &Path,
    requested: Option<RuntimeKind>,
) -> Result<BackendSelection, RuntimeError> {
    if !model_path.exists() {
        return Err(RuntimeError::ModelNotFound(model_path.display().to_string()));
    }
    let gguf = find_gguf(model_path);

    let selection = match (requested, gguf) {
        (Some(RuntimeKind::Native), Some(file)) | (None, Some(file)) => BackendSelection {
            kind: RuntimeKind::Native,
            model_path: file,
        },
        (Some(RuntimeKind::Native), None) => {
            return Err(RuntimeError::BackendLoad {
                backend: RuntimeKind::Native,
                detail: format!("no .gguf file found in {}", model_path.display()),
            })
        }
        (Some(kind), _) => BackendSelection {
            kind,
            model_path: model_path.to_path_buf(),
        },
        (None, None) => BackendSelection {
            kind: RuntimeKind::Tensor,
            model_path: model_path.to_path_buf(),
        },
    };
    Ok(selection)
}

fn is_gguf(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"))
}

fn find_gguf(model_path: &Path) -> Option<PathBuf> {
    if model_path.is_file() {
        return is_gguf(model_path).then(|| model_path.to_path_buf());
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(model_path)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_gguf(path))
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

pub fn format_prompt(prompt: &str) -> String {
    format!(
        "<start_of_turn>user\n{}{}\n<start_of_turn>model\n",
        prompt, END_OF_TURN
    )
}

/// The loaded inference backend. Chosen once at construction; every backend
/// sees the same prompt template and the same error-as-text contract.
pub enum InferenceRuntime {
    Native(NativeBackend),
    Graph(GraphBackend),
    Tensor(TensorBackend),
    #[cfg(test)]
    Scripted(scripted::ScriptedBackend),
}

impl InferenceRuntime {
    /// Loads the configured backend and runs one warm-up generation.
    pub async fn initialize(settings: &LlmSettings, project_root: &Path) -> Result<Self, RuntimeError> {
        let runtime = Self::load(settings, project_root).await?;
        runtime.warm_up(&settings.warmup_prompt).await;
        Ok(runtime)
    }

    pub async fn load(settings: &LlmSettings, project_root: &Path) -> Result<Self, RuntimeError> {
        let model_path = settings
            .model_path
            .as_deref()
            .ok_or(RuntimeError::MissingModelPath)?;
        let selection = select_backend(model_path, settings.runtime)?;
        tracing::info!(
            "Selected {} runtime for {}",
            selection.kind,
            selection.model_path.display()
        );

        match selection.kind {
            RuntimeKind::Native => {
                let backend =
                    NativeBackend::load(settings, &selection.model_path, project_root).await?;
                Ok(Self::Native(backend))
            }
            RuntimeKind::Graph => match GraphBackend::load(settings, &selection.model_path).await {
                Ok(backend) => Ok(Self::Graph(backend)),
                Err(err) => {
                    tracing::warn!(
                        "ONNX backend unavailable ({}); falling back to transformers",
                        err
                    );
                    let backend = TensorBackend::load(settings, &selection.model_path).await?;
                    Ok(Self::Tensor(backend))
                }
            },
            RuntimeKind::Tensor => {
                let backend = TensorBackend::load(settings, &selection.model_path).await?;
                Ok(Self::Tensor(backend))
            }
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        match self {
            InferenceRuntime::Native(_) => RuntimeKind::Native,
            InferenceRuntime::Graph(_) => RuntimeKind::Graph,
            InferenceRuntime::Tensor(_) => RuntimeKind::Tensor,
            #[cfg(test)]
            InferenceRuntime::Scripted(_) => RuntimeKind::Tensor,
        }
    }

    /// Never fails: backend errors come back as error text.
    pub async fn generate(&self, request: GenerationRequest) -> Generation {
        if request.stream {
            Generation::Stream(self.stream_generate(&request).await)
        } else {
            Generation::Text(self.complete(&request).await)
        }
    }

    pub async fn complete(&self, request: &GenerationRequest) -> String {
        match self.try_complete(request).await {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!("Generation failed: {}", err);
                error_text(&err)
            }
        }
    }

    pub async fn stream_generate(&self, request: &GenerationRequest) -> TokenStream {
        match self.try_stream(request).await {
            Ok(rx) => TokenStream::forward(rx),
            Err(err) => {
                tracing::warn!("Streaming generation failed to start: {}", err);
                TokenStream::from_text(error_text(&err))
            }
        }
    }

    async fn try_complete(&self, request: &GenerationRequest) -> Result<String, RuntimeError> {
        let prompt = format_prompt(&request.prompt);
        let params = SamplingParams::from_request(request);
        let text = match self {
            InferenceRuntime::Native(backend) => {
                backend.complete(&prompt, &params, request.use_cache).await?
            }
            InferenceRuntime::Graph(backend) => backend.complete(&prompt, &params).await?,
            InferenceRuntime::Tensor(backend) => backend.complete(&prompt, &params).await?,
            #[cfg(test)]
            InferenceRuntime::Scripted(backend) => backend.complete(&prompt)?,
        };
        Ok(text.trim().to_string())
    }

    async fn try_stream(&self, request: &GenerationRequest) -> Result<FragmentReceiver, RuntimeError> {
        let prompt = format_prompt(&request.prompt);
        let params = SamplingParams::from_request(request);
        match self {
            InferenceRuntime::Native(backend) => {
                backend.stream(&prompt, &params, request.use_cache).await
            }
            InferenceRuntime::Graph(backend) => {
                let text = backend.complete(&prompt, &params).await?;
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(Ok(text));
                Ok(rx)
            }
            InferenceRuntime::Tensor(backend) => Ok(backend.stream(&prompt, &params)),
            #[cfg(test)]
            InferenceRuntime::Scripted(backend) => Ok(backend.stream(&prompt)),
        }
    }

    pub async fn warm_up(&self, prompt: &str) {
        tracing::info!("Warming up {} runtime", self.kind());
        let request = GenerationRequest::new(prompt)
            .with_max_tokens(WARMUP_MAX_TOKENS)
            .with_temperature(0.0);
        match self.try_complete(&request).await {
            Ok(_) => tracing::info!("Model warm-up complete"),
            Err(err) => tracing::warn!("Model warm-up failed: {}", err),
        }
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use crate::llm::RuntimeError;

    type Responder = Box<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

    /// Deterministic backend for tests. Responds through a closure over the
    /// formatted prompt and records every prompt it receives.
    pub struct ScriptedBackend {
        respond: Responder,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        pub fn new(respond: impl Fn(&str) -> Result<String, String> + Send + Sync + 'static) -> Self {
            Self {
                respond: Box::new(respond),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }

        pub fn complete(&self, prompt: &str) -> Result<String, RuntimeError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            (self.respond)(prompt).map_err(RuntimeError::Generation)
        }

        /// Streams the response split after every space.
        pub fn stream(&self, prompt: &str) -> mpsc::Receiver<Result<String, RuntimeError>> {
            let fragments: Vec<Result<String, RuntimeError>> = match self.complete(prompt) {
                Ok(text) => text.split_inclusive(' ').map(|s| Ok(s.to_string())).collect(),
                Err(err) => vec![Err(err)],
            };
            let (tx, rx) = mpsc::channel(fragments.len().max(1));
            for fragment in fragments {
                let _ = tx.try_send(fragment);
            }
            rx
        }
    }
}

#[cfg(test)]
impl InferenceRuntime {
    pub fn scripted(respond: impl Fn(&str) -> Result<String, String> + Send + Sync + 'static) -> Self {
        Self::Scripted(scripted::ScriptedBackend::new(respond))
    }

    pub fn recorded_prompts(&self) -> Vec<String> {
        match self {
            InferenceRuntime::Scripted(backend) => backend.prompts(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gguf_file_in_directory_selects_native() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b-model.gguf"), b"").unwrap();
        std::fs::write(dir.path().join("a-model.gguf"), b"").unwrap();
        std::fs::write(dir.path().join("config.json"), b"{}").unwrap();

        let selection = select_backend(dir.path(), None).unwrap();
        assert_eq!(selection.kind, RuntimeKind::Native);
        assert_eq!(selection.model_path, dir.path().join("a-model.gguf"));
    }

    #[test]
    fn plain_weights_select_tensor_and_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();

        let auto = select_backend(dir.path(), None).unwrap();
        assert_eq!(auto.kind, RuntimeKind::Tensor);

        let forced = select_backend(dir.path(), Some(RuntimeKind::Graph)).unwrap();
        assert_eq!(forced.kind, RuntimeKind::Graph);
        assert_eq!(forced.model_path, dir.path());
    }

    #[test]
    fn forced_gguf_without_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = select_backend(dir.path(), Some(RuntimeKind::Native)).unwrap_err();
        assert!(matches!(err, RuntimeError::BackendLoad { .. }));
    }

    #[test]
    fn missing_model_path_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = select_backend(&dir.path().join("absent"), None).unwrap_err();
        assert!(matches!(err, RuntimeError::ModelNotFound(_)));
    }

    #[test]
    fn prompt_uses_chat_turn_template() {
        assert_eq!(
            format_prompt("Hola"),
            "<start_of_turn>user\nHola<end_of_turn>\n<start_of_turn>model\n"
        );
    }

    #[tokio::test]
    async fn streamed_text_matches_complete_text() {
        let runtime = InferenceRuntime::scripted(|_| Ok("  La derivada mide el cambio.  \n".to_string()));

        let text = runtime
            .generate(GenerationRequest::new("¿Qué es una derivada?"))
            .await
            .into_text()
            .await;
        let streamed = runtime
            .generate(GenerationRequest::new("¿Qué es una derivada?").streaming(true))
            .await;
        assert!(streamed.is_stream());
        assert_eq!(streamed.into_text().await, text);
        assert_eq!(text, "La derivada mide el cambio.");
    }

    #[tokio::test]
    async fn failures_become_error_text() {
        let runtime = InferenceRuntime::scripted(|_| Err("out of memory".to_string()));

        let text = runtime.complete(&GenerationRequest::new("x")).await;
        assert_eq!(text, "Error generating response: out of memory");

        let streamed = runtime
            .stream_generate(&GenerationRequest::new("x").streaming(true))
            .await
            .collect_text()
            .await;
        assert_eq!(streamed, "Error generating response: out of memory");
    }

    #[tokio::test]
    async fn warm_up_failure_is_swallowed() {
        let runtime = InferenceRuntime::scripted(|_| Err("not ready".to_string()));
        runtime.warm_up("Hola").await;
        let prompts = runtime.recorded_prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Hola"));
    }
}
