use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn root(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "message": "Aula API is running",
        "status": state.status(),
    }))
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.snapshot())
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use serde_json::Value;

    use super::*;
    use crate::state::tests::state_in;

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_status_and_detail() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        state.begin_loading().unwrap();

        let body = body_json(health(State(state.clone())).await.into_response()).await;
        assert_eq!(body, json!({"status": "loading_model", "detail": null}));

        state.mark_failed("no model").unwrap();
        let body = body_json(health(State(state)).await.into_response()).await;
        assert_eq!(body, json!({"status": "error", "detail": "no model"}));
    }

    #[tokio::test]
    async fn banner_includes_status() {
        let dir = tempfile::tempdir().unwrap();
        let body = body_json(root(State(state_in(dir.path()))).await.into_response()).await;
        assert_eq!(body["status"], "starting");
    }
}
