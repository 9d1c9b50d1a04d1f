use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::core::config::{AppPaths, ConfigService, Settings};
use crate::core::errors::ApiError;
use crate::rag::RetrievalEngine;

pub mod error;

use error::InitializationError;

const LOADING_MESSAGE: &str = "AI model is still loading...";

/// Lifecycle of the background initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    LoadingModel,
    Ready,
    Error,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::LoadingModel => "loading_model",
            ServiceStatus::Ready => "ready",
            ServiceStatus::Error => "error",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub status: ServiceStatus,
    pub detail: Option<String>,
}

struct Lifecycle {
    status: ServiceStatus,
    error: Option<String>,
    engine: Option<Arc<RetrievalEngine>>,
}

/// Shared application state handed to every route.
///
/// The lifecycle is written only by the background initializer through the
/// transition methods; handlers read it through [`snapshot`](Self::snapshot)
/// and [`engine`](Self::engine).
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub settings: Arc<Settings>,
    lifecycle: Mutex<Lifecycle>,
}

impl AppState {
    /// Discovers paths and loads the validated configuration. Nothing heavy
    /// happens here; models load in [`spawn_initialization`](Self::spawn_initialization).
    pub fn initialize() -> Result<Arc<Self>, InitializationError> {
        let paths = Arc::new(AppPaths::new());
        let config = ConfigService::new(paths.clone());
        let settings = config.load()?;
        Ok(Arc::new(Self::new(paths, settings)))
    }

    pub fn new(paths: Arc<AppPaths>, settings: Settings) -> Self {
        Self {
            paths,
            settings: Arc::new(settings),
            lifecycle: Mutex::new(Lifecycle {
                status: ServiceStatus::Starting,
                error: None,
                engine: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let lifecycle = self.lock();
        StatusSnapshot {
            status: lifecycle.status,
            detail: lifecycle.error.clone(),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.lock().status
    }

    /// The ready engine, or the reason requests cannot be served yet.
    pub fn engine(&self) -> Result<Arc<RetrievalEngine>, ApiError> {
        let lifecycle = self.lock();
        match (lifecycle.status, &lifecycle.engine) {
            (ServiceStatus::Ready, Some(engine)) => Ok(engine.clone()),
            (ServiceStatus::Error, _) => Err(ApiError::StartupFailed(
                lifecycle
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            )),
            _ => Err(ApiError::NotReady(LOADING_MESSAGE.to_string())),
        }
    }

    pub fn begin_loading(&self) -> Result<(), InitializationError> {
        let mut lifecycle = self.lock();
        if lifecycle.status != ServiceStatus::Starting {
            return Err(InitializationError::IllegalTransition {
                from: lifecycle.status,
                to: ServiceStatus::LoadingModel,
            });
        }
        lifecycle.status = ServiceStatus::LoadingModel;
        drop(lifecycle);
        tracing::info!("Loading AI models");
        Ok(())
    }

    pub fn mark_ready(&self, engine: Arc<RetrievalEngine>) -> Result<(), InitializationError> {
        let mut lifecycle = self.lock();
        if lifecycle.status != ServiceStatus::LoadingModel {
            return Err(InitializationError::IllegalTransition {
                from: lifecycle.status,
                to: ServiceStatus::Ready,
            });
        }
        lifecycle.status = ServiceStatus::Ready;
        lifecycle.engine = Some(engine);
        drop(lifecycle);
        tracing::info!("AI models ready");
        Ok(())
    }

    pub fn mark_failed(&self, message: impl Into<String>) -> Result<(), InitializationError> {
        let message = message.into();
        let mut lifecycle = self.lock();
        if lifecycle.status != ServiceStatus::LoadingModel {
            return Err(InitializationError::IllegalTransition {
                from: lifecycle.status,
                to: ServiceStatus::Error,
            });
        }
        lifecycle.status = ServiceStatus::Error;
        lifecycle.error = Some(message.clone());
        drop(lifecycle);
        tracing::error!("AI startup failed: {}", message);
        Ok(())
    }

    /// Launches the single background initializer that loads the retrieval
    /// engine.
    pub fn spawn_initialization(self: &Arc<Self>) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let settings = state.settings.clone();
            let project_root = state.paths.project_root.clone();
            state
                .initialize_with(|| async move {
                    RetrievalEngine::initialize(&settings, &project_root).await
                })
                .await;
        })
    }

    /// Runs `init` between the loading and ready/error transitions.
    pub async fn initialize_with<F, Fut, E>(&self, init: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RetrievalEngine, E>>,
        E: fmt::Display,
    {
        if let Err(err) = self.begin_loading() {
            tracing::warn!("Initialization skipped: {}", err);
            return;
        }

        let outcome = match init().await {
            Ok(engine) => self.mark_ready(Arc::new(engine)),
            Err(err) => self.mark_failed(err.to_string()),
        };
        if let Err(err) = outcome {
            tracing::warn!("{}", err);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embedding::EmbeddingCache;
    use crate::index::IndexStore;
    use crate::llm::InferenceRuntime;
    use crate::testing::FakeEmbedder;

    pub(crate) fn state_in(dir: &std::path::Path) -> Arc<AppState> {
        let paths = Arc::new(AppPaths::with_dirs(
            dir.to_path_buf(),
            dir.join("data-dir"),
        ));
        let mut settings = Settings::default();
        settings.index.embeddings_root = dir.join("embeddings/collections");
        settings.index.manifest_path = dir.join("embeddings/index_manifest.json");
        settings.index.data_root = dir.join("data");
        Arc::new(AppState::new(paths, settings))
    }

    pub(crate) fn scripted_engine(settings: &Settings, reply: &'static str) -> RetrievalEngine {
        let embedder = Arc::new(FakeEmbedder::default());
        let store = Arc::new(
            IndexStore::open(&settings.index, settings.ingest, 16, embedder.clone())
                .unwrap_or_else(|e| panic!("store: {}", e)),
        );
        let embeddings = Arc::new(EmbeddingCache::new(embedder, 16));
        let runtime = Arc::new(InferenceRuntime::scripted(move |_| Ok(reply.to_string())));
        RetrievalEngine::new(settings, store, embeddings, runtime)
    }

    #[tokio::test]
    async fn successful_initialization_becomes_ready() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        assert_eq!(state.status(), ServiceStatus::Starting);
        assert!(matches!(state.engine(), Err(ApiError::NotReady(_))));

        let settings = state.settings.clone();
        state
            .initialize_with(|| async move { Ok::<_, String>(scripted_engine(&settings, "hola")) })
            .await;

        assert_eq!(state.snapshot(), StatusSnapshot { status: ServiceStatus::Ready, detail: None });
        assert!(state.engine().is_ok());
    }

    #[tokio::test]
    async fn failed_initialization_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        state
            .initialize_with(|| async { Err::<RetrievalEngine, _>("model file missing") })
            .await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.status, ServiceStatus::Error);
        assert_eq!(snapshot.detail.as_deref(), Some("model file missing"));
        assert!(matches!(state.engine(), Err(ApiError::StartupFailed(msg)) if msg == "model file missing"));

        // a second run cannot leave the error state
        state
            .initialize_with(|| async { Err::<RetrievalEngine, _>("again") })
            .await;
        assert_eq!(state.status(), ServiceStatus::Error);
        assert!(state.begin_loading().is_err());
    }

    #[test]
    fn ready_requires_loading_first() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let engine = Arc::new(scripted_engine(&state.settings, "x"));

        let err = state.mark_ready(engine).unwrap_err();
        assert!(matches!(
            err,
            InitializationError::IllegalTransition {
                from: ServiceStatus::Starting,
                to: ServiceStatus::Ready
            }
        ));
        assert!(state.mark_failed("nope").is_err());
        assert_eq!(state.status(), ServiceStatus::Starting);
    }

    #[test]
    fn status_names_match_health_payload() {
        assert_eq!(serde_json::to_value(ServiceStatus::LoadingModel).unwrap(), "loading_model");
        assert_eq!(ServiceStatus::Ready.to_string(), "ready");
    }
}
