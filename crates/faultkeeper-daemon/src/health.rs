//! Liveness endpoint.
//!
//! Serves `GET /healthz` so the container orchestrator can tell a live
//! daemon from a wedged one. Deliberately carries no state: it reports
//! process liveness, not reconciliation progress.

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::info;

/// Builds the health router.
#[must_use]
pub fn router() -> Router {
    Router::new().route("/healthz", get(healthz))
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serves the health router on an already-bound listener.
///
/// # Errors
///
/// Returns an error if serving fails.
pub async fn serve(listener: TcpListener) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "health endpoint listening");
    }
    axum::serve(listener, router()).await
}
