use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;

use super::prompt::{build_prompt, HistoryMessage};
use super::subject::{classification_prompt, is_greeting, parse_subject};
use super::RetrievalError;
use crate::core::config::{RetrievalSettings, Settings};
use crate::embedding::{Embedder, EmbeddingCache, LlamaEmbedder};
use crate::index::{IndexError, IndexStore, LoadedCollection, RetrievedChunk};
use crate::llm::{Generation, GenerationRequest, InferenceRuntime};

const CLASSIFIER_MAX_TOKENS: usize = 16;
const WARMUP_EMBEDDING: &str = "Warmup embedding";

/// Lines of a chat response: the sources first, then answer fragments.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryEvent {
    Sources {
        sources: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggested_subject: Option<String>,
    },
    Token {
        token: String,
    },
}

pub type QueryStream = Pin<Box<dyn Stream<Item = QueryEvent> + Send>>;

#[derive(Debug)]
pub struct QueryOutcome {
    pub answer: Generation,
    pub sources: Vec<String>,
    pub suggested_subject: Option<String>,
}

impl QueryOutcome {
    pub fn into_events(self) -> QueryStream {
        let head = QueryEvent::Sources {
            sources: self.sources,
            suggested_subject: self.suggested_subject,
        };
        let tokens = match self.answer {
            Generation::Text(text) => stream::iter((!text.is_empty()).then_some(text))
                .map(|token| QueryEvent::Token { token })
                .boxed(),
            Generation::Stream(fragments) => fragments
                .into_stream()
                .map(|token| QueryEvent::Token { token })
                .boxed(),
        };
        Box::pin(stream::once(async move { head }).chain(tokens))
    }
}

pub struct RetrievalEngine {
    settings: RetrievalSettings,
    max_tokens: usize,
    temperature: f32,
    store: Arc<IndexStore>,
    embeddings: Arc<EmbeddingCache>,
    runtime: Arc<InferenceRuntime>,
    loaded: RwLock<HashMap<String, Arc<LoadedCollection>>>,
}

impl RetrievalEngine {
    /// Starts the embedding model, opens the index store and loads the
    /// language model.
    pub async fn initialize(settings: &Settings, project_root: &Path) -> Result<Self, RetrievalError> {
        tracing::info!("Initializing retrieval engine");
        let embedder: Arc<dyn Embedder> = Arc::new(
            LlamaEmbedder::start(&settings.embedding, settings.llm.server_path.as_deref(), project_root)
                .await?,
        );
        let store = Arc::new(IndexStore::open(
            &settings.index,
            settings.ingest,
            settings.embedding.batch_size,
            embedder.clone(),
        )?);
        let embeddings = Arc::new(EmbeddingCache::new(embedder, settings.embedding.cache_capacity));
        let runtime = Arc::new(InferenceRuntime::initialize(&settings.llm, project_root).await?);

        let engine = Self::new(settings, store, embeddings, runtime);
        engine.warm_up().await;
        Ok(engine)
    }

    pub fn new(
        settings: &Settings,
        store: Arc<IndexStore>,
        embeddings: Arc<EmbeddingCache>,
        runtime: Arc<InferenceRuntime>,
    ) -> Self {
        Self {
            settings: settings.retrieval.clone(),
            max_tokens: settings.llm.max_tokens,
            temperature: settings.llm.temperature,
            store,
            embeddings,
            runtime,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<InferenceRuntime> {
        &self.runtime
    }

    async fn warm_up(&self) {
        match self.embeddings.encode_one(WARMUP_EMBEDDING).await {
            Ok(_) => tracing::info!("Embedding cache warmed up"),
            Err(err) => tracing::warn!("Embedding warm-up failed: {}", err),
        }
    }

    /// The requested subject, or the configured default when none is given.
    pub fn select_subject(&self, subject: Option<&str>) -> String {
        subject
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.settings.default_subject)
            .to_string()
    }

    pub async fn loaded_subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self.loaded.read().await.keys().cloned().collect();
        subjects.sort();
        subjects
    }

    async fn collection(&self, subject: &str) -> Result<Arc<LoadedCollection>, IndexError> {
        if let Some(collection) = self.loaded.read().await.get(subject) {
            return Ok(collection.clone());
        }

        let entry = self.store.ensure_collection(subject, true).await?;
        let collection = Arc::new(self.store.load_collection(&entry)?);
        self.loaded
            .write()
            .await
            .insert(subject.to_string(), collection.clone());
        Ok(collection)
    }

    /// Nearest chunks of the subject's collection below the distance
    /// threshold. An unavailable collection falls back to the default subject;
    /// with neither available there is no context.
    pub async fn retrieve(&self, question: &str, subject: Option<&str>) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let selected = self.select_subject(subject);
        let collection = match self.collection(&selected).await {
            Ok(collection) => collection,
            Err(err) if selected != self.settings.default_subject => {
                tracing::warn!(
                    "Collection '{}' unavailable ({}); using '{}'",
                    selected,
                    err,
                    self.settings.default_subject
                );
                match self.collection(&self.settings.default_subject).await {
                    Ok(collection) => collection,
                    Err(err) => {
                        tracing::warn!("Default collection unavailable: {}", err);
                        return Ok(Vec::new());
                    }
                }
            }
            Err(err) => {
                tracing::warn!("Default collection unavailable: {}", err);
                return Ok(Vec::new());
            }
        };

        let query = self.embeddings.encode_one(question).await?;
        Ok(collection.search(&query, self.settings.top_k, self.settings.distance_threshold))
    }

    /// Asks the model which configured subject the question belongs to.
    pub async fn detect_subject(&self, question: &str) -> Option<String> {
        let prompt = classification_prompt(question, &self.settings.subjects);
        let request = GenerationRequest::new(prompt)
            .with_max_tokens(CLASSIFIER_MAX_TOKENS)
            .with_temperature(0.0);
        let response = self.runtime.complete(&request).await;
        parse_subject(&response, &self.settings.subjects)
    }

    pub async fn query(
        &self,
        question: &str,
        subject: Option<&str>,
        history: &[HistoryMessage],
        stream: bool,
    ) -> QueryOutcome {
        let active = self.select_subject(subject);
        let mut suggested_subject = None;

        let context = if is_greeting(question, &self.settings.greetings) {
            Vec::new()
        } else {
            if let Some(detected) = self.detect_subject(question).await {
                if detected != active {
                    suggested_subject = Some(detected);
                }
            }
            match self.retrieve(question, Some(&active)).await {
                Ok(context) => context,
                Err(err) => {
                    tracing::warn!("Retrieval failed: {}", err);
                    Vec::new()
                }
            }
        };

        let chunks: Vec<_> = context.into_iter().map(|hit| hit.chunk).collect();
        let prompt = build_prompt(question, &active, &chunks, history, &self.settings);
        let request = GenerationRequest::new(prompt)
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature)
            .streaming(stream);
        let answer = self.runtime.generate(request).await;

        QueryOutcome {
            answer,
            sources: chunks.into_iter().map(|chunk| chunk.source).collect(),
            suggested_subject,
        }
    }
}
