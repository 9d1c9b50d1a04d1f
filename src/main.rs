use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;

use aula_backend::core::logging;
use aula_backend::server;
use aula_backend::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let state = AppState::initialize().context("Failed to initialize application state")?;
    logging::init(&state.paths);

    let server = &state.settings.server;
    let bind_addr = format!("{}:{}", server.host, server.port);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    let addr = listener.local_addr()?;

    println!("AULA_PORT={}", addr.port());
    tracing::info!("Listening on {}", addr);

    // Models load in the background; requests before ready get 503.
    state.spawn_initialization();

    let app: Router = server::router::router(state.clone());
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
