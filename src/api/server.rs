//! HTTP server setup: router construction and API route wiring.

use super::state::ApiState;
use super::{system, tasks};

use axum::Router;
use axum::routing::{delete, get};
use tower_http::cors::{Any, CorsLayer};

use std::net::SocketAddr;
use std::sync::Arc;

/// Start the HTTP server on the given address.
///
/// Returns the bound address (useful when `bind` carries port 0) and the
/// serving task's handle. The server drains in-flight requests when the
/// shutdown channel flips to true.
pub async fn start_http_server(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(system::health))
        .route("/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/tasks/{slug}", delete(tasks::delete_task))
        .route("/tasks/{slug}/results", get(tasks::list_task_results))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "HTTP server listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await
        {
            tracing::error!(%error, "HTTP server exited with error");
        }
    });

    Ok((local_addr, handle))
}
