//! Status surface: health and the last delivered state over HTTP.

use crate::notifier::NotificationPayload;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LISTEN_PORT: u16 = 8099;

/// Routes: `GET /_health` and `GET /deploymentstate`.
pub fn router(payload: watch::Receiver<NotificationPayload>) -> Router {
    Router::new()
        .route("/_health", get(health))
        .route("/deploymentstate", get(deployment_state))
        .with_state(payload)
}

async fn health() -> Json<Value> {
    Json(json!({ "health": "ok" }))
}

async fn deployment_state(
    State(payload): State<watch::Receiver<NotificationPayload>>,
) -> Json<NotificationPayload> {
    let current = payload.borrow().clone();
    Json(current)
}

/// Bind `addr`. Kept separate from [`serve`] so bind failures surface at startup.
pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "status server listening");
    Ok(listener)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    tracing::info!("status server shutdown");
    Ok(())
}
