use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{Embedder, EmbeddingError};
use crate::core::config::EmbeddingSettings;
use crate::llm::llama_server::{LlamaServer, ServerLaunch};

const EMBEDDING_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Sentence embedder backed by a llama-server started in embedding mode.
pub struct LlamaEmbedder {
    server: LlamaServer,
    name: String,
    batch_size: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

impl LlamaEmbedder {
    pub async fn start(
        settings: &EmbeddingSettings,
        server_path: Option<&Path>,
        project_root: &Path,
    ) -> Result<Self, EmbeddingError> {
        let model_path = settings
            .model_path
            .clone()
            .ok_or(EmbeddingError::MissingModelPath)?;
        let name = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "embedding".to_string());

        let launch = ServerLaunch {
            model_path,
            port: settings.port,
            context_size: settings.context_size,
            batch_size: settings.context_size,
            threads: None,
            gpu_layers: -1,
            embedding: true,
            startup_timeout: EMBEDDING_STARTUP_TIMEOUT,
        };
        let server = LlamaServer::new(launch, server_path, project_root);
        server.ensure_running().await?;
        tracing::info!("Embedding model {} ready", name);

        Ok(Self {
            server,
            name,
            batch_size: settings.batch_size.max(1),
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let res = self
            .server
            .client()
            .post(format!("{}/v1/embeddings", self.server.base_url()))
            .json(&json!({ "input": batch }))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(EmbeddingError::Server(format!(
                "embedding request failed: {}",
                res.status()
            )));
        }
        let body: EmbeddingResponse = res.json().await?;
        order_embeddings(body, batch.len())
    }
}

fn order_embeddings(body: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut items = body.data;
    if items.len() != expected {
        return Err(EmbeddingError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected,
            items.len()
        )));
    }
    items.sort_by_key(|item| item.index);
    Ok(items.into_iter().map(|item| item.embedding).collect())
}

#[async_trait]
impl Embedder for LlamaEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.server.ensure_running().await?;
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeddings_are_reordered_by_index() {
        let body: EmbeddingResponse = serde_json::from_value(json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        }))
        .unwrap();
        let vectors = order_embeddings(body, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn short_responses_are_rejected() {
        let body: EmbeddingResponse =
            serde_json::from_value(json!({"data": [{"index": 0, "embedding": [1.0]}]})).unwrap();
        assert!(matches!(
            order_embeddings(body, 2),
            Err(EmbeddingError::InvalidResponse(_))
        ));
    }
}
