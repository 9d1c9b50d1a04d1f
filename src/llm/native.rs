use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::llama_server::{LineBuffer, LlamaServer, ServerLaunch};
use super::types::SamplingParams;
use super::RuntimeError;
use crate::core::config::LlmSettings;

pub const END_OF_TURN: &str = "<end_of_turn>";

const RECENT_PROMPTS: usize = 32;

/// Hashes of the most recently evaluated prompts, least recent first.
#[derive(Debug)]
struct RecentPrompts {
    capacity: usize,
    hashes: VecDeque<u64>,
}

impl RecentPrompts {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            hashes: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns whether `prompt` is among the recent ones and marks it most
    /// recent, evicting the oldest entry when full.
    fn remember(&mut self, prompt: &str) -> bool {
        let mut hasher = DefaultHasher::new();
        prompt.hash(&mut hasher);
        let hash = hasher.finish();

        let seen = match self.hashes.iter().position(|h| *h == hash) {
            Some(pos) => {
                self.hashes.remove(pos);
                true
            }
            None => {
                if self.hashes.len() == self.capacity {
                    self.hashes.pop_front();
                }
                false
            }
        };
        self.hashes.push_back(hash);
        seen
    }

    fn len(&self) -> usize {
        self.hashes.len()
    }
}

/// GGUF backend: a managed llama-server process with token streaming and a
/// short record of recent prompts, so a repeated prompt can ask the server to
/// reuse its cached prefix.
pub struct NativeBackend {
    server: LlamaServer,
    recent_prompts: Mutex<RecentPrompts>,
}

impl NativeBackend {
    pub async fn load(
        settings: &LlmSettings,
        model_file: &Path,
        project_root: &Path,
    ) -> Result<Self, RuntimeError> {
        tracing::info!("Detected GGUF model: {}", model_file.display());
        let launch = ServerLaunch {
            model_path: model_file.to_path_buf(),
            port: settings.port,
            context_size: settings.context_size,
            batch_size: settings.batch_size,
            threads: settings.threads.or_else(|| {
                std::thread::available_parallelism()
                    .ok()
                    .map(|n| n.get())
            }),
            gpu_layers: settings.gpu_layers,
            embedding: false,
            startup_timeout: Duration::from_secs(settings.startup_timeout_secs),
        };
        let server = LlamaServer::new(launch, settings.server_path.as_deref(), project_root);
        server.ensure_running().await?;
        tracing::info!("GGUF model loaded through llama-server");

        Ok(Self {
            server,
            recent_prompts: Mutex::new(RecentPrompts::new(RECENT_PROMPTS)),
        })
    }

    /// Returns whether `prompt` was seen before, recording it when caching is on.
    pub fn remember_prompt(&self, prompt: &str, use_cache: bool) -> bool {
        if !use_cache {
            return false;
        }
        self.recent_prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remember(prompt)
    }

    pub async fn complete(
        &self,
        prompt: &str,
        params: &SamplingParams,
        use_cache: bool,
    ) -> Result<String, RuntimeError> {
        self.server.ensure_running().await?;
        let cached = self.remember_prompt(prompt, use_cache);
        let body = completion_body(prompt, params, cached, false);

        let res = self
            .server
            .client()
            .post(format!("{}/completion", self.server.base_url()))
            .json(&body)
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(RuntimeError::Server(format!(
                "completion request failed: {}",
                res.status()
            )));
        }

        let data: Value = res.json().await?;
        Ok(data["content"].as_str().unwrap_or_default().to_string())
    }

    pub async fn stream(
        &self,
        prompt: &str,
        params: &SamplingParams,
        use_cache: bool,
    ) -> Result<mpsc::Receiver<Result<String, RuntimeError>>, RuntimeError> {
        self.server.ensure_running().await?;
        let cached = self.remember_prompt(prompt, use_cache);
        let body = completion_body(prompt, params, cached, true);

        let res = self
            .server
            .client()
            .post(format!("{}/completion", self.server.base_url()))
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(RuntimeError::Server(format!(
                "completion request failed: {}",
                res.status()
            )));
        }

        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            let mut bytes = res.bytes_stream();
            let mut lines = LineBuffer::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(RuntimeError::from(e))).await;
                        return;
                    }
                };
                for line in lines.push(&chunk) {
                    match parse_sse_line(&line) {
                        SseEvent::Content(content) => {
                            if tx.send(Ok(content)).await.is_err() {
                                return;
                            }
                        }
                        SseEvent::Stop => return,
                        SseEvent::Ignored => {}
                    }
                }
            }
            if let Some(line) = lines.finish() {
                if let SseEvent::Content(content) = parse_sse_line(&line) {
                    let _ = tx.send(Ok(content)).await;
                }
            }
        });

        Ok(rx)
    }
}

fn completion_body(prompt: &str, params: &SamplingParams, cache_prompt: bool, stream: bool) -> Value {
    json!({
        "prompt": prompt,
        "stream": stream,
        "n_predict": params.max_tokens,
        "temperature": params.temperature,
        "top_p": params.top_p,
        "repeat_penalty": params.repeat_penalty,
        "stop": [END_OF_TURN],
        "cache_prompt": cache_prompt,
    })
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Content(String),
    Stop,
    Ignored,
}

fn parse_sse_line(line: &str) -> SseEvent {
    let Some(payload) = line.strip_prefix("data:") else {
        return SseEvent::Ignored;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseEvent::Stop;
    }
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return SseEvent::Ignored;
    };
    let content = value["content"].as_str().unwrap_or_default();
    if !content.is_empty() {
        return SseEvent::Content(content.to_string());
    }
    if value["stop"].as_bool().unwrap_or(false) {
        SseEvent::Stop
    } else {
        SseEvent::Ignored
    }
}
