//! HTTP request handlers for the scanner API

use crate::{
    error::ScanError,
    models::{ScanConfig, ScanId, ScanState},
    registry::ScanRegistry,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Map a registry error onto an HTTP status, logging server-side failures
fn status_for(err: &ScanError, action: &str) -> StatusCode {
    match err {
        ScanError::ScanNotFound(_) => StatusCode::NOT_FOUND,
        ScanError::InvalidConfig(_) | ScanError::UnsupportedAlgorithm(_) => StatusCode::BAD_REQUEST,
        ScanError::ShuttingDown | ScanError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => {
            tracing::error!(error = %err, "Failed to {}", action);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Liveness probe
pub async fn health() -> Json<Value> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Json(json!({
        "status": "healthy",
        "service": "duplicate-scanner",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": timestamp,
    }))
}

/// Handler for the service status
pub async fn scanner_status(State(registry): State<Arc<ScanRegistry>>) -> Json<Value> {
    Json(json!(registry.service_status().await))
}

/// Handler for starting a new scan
pub async fn start_scan(
    State(registry): State<Arc<ScanRegistry>>,
    RequestJson(config): RequestJson<ScanConfig>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let scan_id = registry
        .start(config)
        .await
        .map_err(|err| status_for(&err, "start scan"))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "scan_id": scan_id,
            "status": "started",
            "message": format!("Scan {} started", scan_id),
        })),
    ))
}

/// Handler for listing every retained scan
pub async fn list_sessions(State(registry): State<Arc<ScanRegistry>>) -> Json<Value> {
    let sessions = registry.list().await;
    Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

/// Handler for one scan's status, with its summary once completed
pub async fn get_session(
    State(registry): State<Arc<ScanRegistry>>,
    Path(scan_id): Path<ScanId>,
) -> Result<Json<Value>, StatusCode> {
    let scan = registry
        .get(scan_id)
        .await
        .map_err(|err| status_for(&err, "get scan"))?;

    let status = scan.status();
    let elapsed_seconds = status.elapsed_seconds();
    let progress_percentage = status.progress.progress_percentage();
    let summary = scan.report().map(|report| report.summary);

    Ok(Json(json!({
        "status": status,
        "progress_percentage": progress_percentage,
        "elapsed_seconds": elapsed_seconds,
        "summary": summary,
        "errors": scan.file_errors(),
    })))
}

/// Handler for the duplicate groups of a completed scan
pub async fn get_duplicates(
    State(registry): State<Arc<ScanRegistry>>,
    Path(scan_id): Path<ScanId>,
) -> Result<Json<Value>, StatusCode> {
    let scan = registry
        .get(scan_id)
        .await
        .map_err(|err| status_for(&err, "get duplicates"))?;

    match scan.duplicate_groups() {
        Some(groups) => Ok(Json(json!({
            "scan_id": scan_id,
            "count": groups.len(),
            "duplicate_groups": groups,
        }))),
        None => Err(StatusCode::CONFLICT),
    }
}

/// Handler for cancelling a scan
pub async fn cancel_session(
    State(registry): State<Arc<ScanRegistry>>,
    Path(scan_id): Path<ScanId>,
) -> Result<Json<Value>, StatusCode> {
    let cancelled = registry
        .cancel(scan_id)
        .await
        .map_err(|err| status_for(&err, "cancel scan"))?;

    let message = if cancelled {
        "Cancellation requested"
    } else {
        "Scan already finished"
    };
    Ok(Json(json!({
        "success": cancelled,
        "message": message,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use std::fs;
    use tempfile::TempDir;

    fn registry() -> Arc<ScanRegistry> {
        Arc::new(ScanRegistry::new(Config::default()).unwrap())
    }

    #[tokio::test]
    async fn test_scan_lifecycle_through_handlers() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a"), "dup").unwrap();
        fs::write(temp_dir.path().join("b"), "dup").unwrap();
        let registry = registry();

        let config: ScanConfig = serde_json::from_value(json!({
            "paths": [temp_dir.path()],
            "algorithms": ["blake3", "not-a-hash"],
            "name": "api scan"
        }))
        .unwrap();
        let (status, Json(body)) = start_scan(State(registry.clone()), RequestJson(config)).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        let scan_id = body["scan_id"].as_u64().unwrap();

        assert_eq!(registry.get(scan_id).await.unwrap().join().await, ScanState::Completed);

        let Json(session) = get_session(State(registry.clone()), Path(scan_id)).await.unwrap();
        assert_eq!(session["status"]["name"], "api scan");
        assert_eq!(session["status"]["state"], "completed");
        assert_eq!(session["summary"]["duplicate_groups"], 1);

        let Json(duplicates) = get_duplicates(State(registry.clone()), Path(scan_id)).await.unwrap();
        assert_eq!(duplicates["count"], 1);
        assert_eq!(duplicates["duplicate_groups"][0]["similarity_type"], "exact");

        let Json(cancel) = cancel_session(State(registry.clone()), Path(scan_id)).await.unwrap();
        assert_eq!(cancel["success"], false);

        let Json(list) = list_sessions(State(registry)).await;
        assert_eq!(list["count"], 1);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let registry = registry();

        let empty = ScanConfig::new(Vec::<std::path::PathBuf>::new());
        let err = start_scan(State(registry.clone()), RequestJson(empty)).await.unwrap_err();
        assert_eq!(err, StatusCode::BAD_REQUEST);

        let err = get_session(State(registry.clone()), Path(42)).await.unwrap_err();
        assert_eq!(err, StatusCode::NOT_FOUND);
        let err = cancel_session(State(registry.clone()), Path(42)).await.unwrap_err();
        assert_eq!(err, StatusCode::NOT_FOUND);

        registry.shutdown().await;
        let err = start_scan(State(registry), RequestJson(ScanConfig::new(["/tmp"]))).await.unwrap_err();
        assert_eq!(err, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let Json(health) = health().await;
        assert_eq!(health["status"], "healthy");

        let Json(status) = scanner_status(State(registry())).await;
        assert_eq!(status["status"], "running");
        assert_eq!(status["active_scans"], 0);
    }
}
