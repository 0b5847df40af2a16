//! Liveness and readiness endpoints
//!
//! Every replica serves these, leader or not, so a standby stays Ready while
//! it waits for the lease.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tracing::info;

/// Router exposing `/healthz` and `/readyz`
pub fn health_routes() -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
}

/// Bind `addr` and serve the health router until the process exits
///
/// Binding happens before this returns so a port clash fails startup.
pub async fn serve(addr: SocketAddr) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Health server listening");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_routes()).await {
            tracing::error!(error = %e, "Health server error");
        }
    }))
}
