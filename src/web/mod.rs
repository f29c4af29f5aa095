//! HTTP control plane and progress push socket

pub mod handlers;
pub mod websocket;

use crate::registry::ScanRegistry;
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the web application router
pub fn create_app(registry: Arc<ScanRegistry>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/scanner/status", get(handlers::scanner_status))
        .route("/api/v1/scanner/scan", post(handlers::start_scan))
        .route("/api/v1/scanner/sessions", get(handlers::list_sessions))
        .route("/api/v1/scanner/sessions/:id", get(handlers::get_session))
        .route(
            "/api/v1/scanner/sessions/:id/duplicates",
            get(handlers::get_duplicates),
        )
        .route("/api/v1/scanner/sessions/:id/cancel", post(handlers::cancel_session))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(registry)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve the API on `addr` until `shutdown` resolves
pub async fn start_server<F>(addr: &str, registry: Arc<ScanRegistry>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_app(registry);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(addr = %listener.local_addr()?, "Starting web server");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}
