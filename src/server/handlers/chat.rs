use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::core::errors::ApiError;
use crate::rag::HistoryMessage;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Option<Vec<HistoryMessage>>,
    #[serde(default)]
    pub subject: Option<String>,
}

/// Answers as newline-delimited JSON: a sources line, then token lines.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let engine = state.engine()?;
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }

    let history = request.history.unwrap_or_default();
    let outcome = engine
        .query(&request.message, request.subject.as_deref(), &history, true)
        .await;

    let lines = outcome.into_events().map(|event| {
        serde_json::to_string(&event).map(|mut line| {
            line.push('\n');
            line
        })
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use axum::http::StatusCode;
    use serde_json::Value;

    use super::*;
    use crate::state::tests::{scripted_engine, state_in};

    fn request(message: &str) -> Json<ChatRequest> {
        Json(ChatRequest {
            message: message.to_string(),
            history: None,
            subject: None,
        })
    }

    #[tokio::test]
    async fn requests_before_ready_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        state.begin_loading().unwrap();

        let Err(err) = chat(State(state), request("hola")).await else {
            panic!("chat must fail while loading");
        };
        assert!(matches!(err, ApiError::NotReady(_)));
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ready_state_streams_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let engine = scripted_engine(&state.settings, "¡Hola! Soy Inti.");
        state.begin_loading().unwrap();
        state.mark_ready(Arc::new(engine)).unwrap();

        let response = chat(State(state), request("Hola")).await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/x-ndjson");

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let lines: Vec<Value> = String::from_utf8(bytes.to_vec())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines[0], serde_json::json!({"sources": []}));
        let text: String = lines[1..]
            .iter()
            .map(|line| line["token"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(text, "¡Hola! Soy Inti.");
    }

    #[test]
    fn history_may_be_null() {
        let parsed: ChatRequest =
            serde_json::from_str(r#"{"message": "hola", "history": null}"#).unwrap();
        assert!(parsed.history.is_none());
        assert!(parsed.subject.is_none());
    }
}
