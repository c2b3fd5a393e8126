//! HTTP request handlers

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use edgeroll_api::{
    BackupListResponse, BackupResponse, CheckResultResponse, HealthResponse, VersionResponse,
};
use tracing::error;

use crate::api::update_status_response;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Runs the health checker; 503 when a critical check fails
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let report = state.health.run_checks().await;
    let code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = HealthResponse {
        status: if report.healthy { "healthy" } else { "unhealthy" }.to_string(),
        service: "edgeroll".to_string(),
        version: version_info().version,
        checks: report.checks.iter().map(CheckResultResponse::from).collect(),
    };
    (code, Json(body))
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// State of the update executor
pub async fn update_status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let executor = &state.executor;
    Json(update_status_response(
        executor.device_id(),
        executor.current_version(),
        executor.last_state().as_ref(),
    ))
}

/// Backups held on this device, newest first
pub async fn backups_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, StatusCode> {
    let backups = state
        .executor
        .rollback_manager()
        .list_backups()
        .await
        .map_err(|e| {
            error!("Failed to list backups: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let backups: Vec<BackupResponse> = backups.iter().map(BackupResponse::from).collect();
    let total = backups.len();
    Ok(Json(BackupListResponse { backups, total }))
}
