//! `/health/*` HTTP endpoint.

use axum::{extract::State, routing::get, Json, Router};
use chainpipe_core::HealthSnapshot;
use chainpipe_runtime::SupervisorHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn router(handle: SupervisorHandle) -> Router {
    Router::new()
        .route("/health/live", get(live))
        .route("/health/sources", get(sources))
        .with_state(handle)
}

/// Serve until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    handle: SupervisorHandle,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "health endpoint listening");
    }
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn live() -> &'static str {
    "OK"
}

async fn sources(State(handle): State<SupervisorHandle>) -> Json<HealthSnapshot> {
    Json(handle.snapshot())
}
