//! A device polling a remote control plane over HTTP

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower::ServiceExt;

use edgeroll::http::client::HttpClient;
use edgeroll::http::reports::{HttpReporter, REPORTS_PATH};
use edgeroll::http::updates::HttpUpdateSource;
use edgeroll::models::update::{AssignedWork, Assignment, ReportTarget, Update};
use edgeroll::server::serve::router;
use edgeroll::server::state::ServerState;
use edgeroll::update::executor::{ExecutorOptions, UpdateExecutor};
use edgeroll::update::health::HealthChecker;
use edgeroll::update::rollback::{RollbackManager, RollbackOptions};
use edgeroll::utils::CooldownOptions;
use edgeroll::workers::updater;
use edgeroll_api::{BackupListResponse, ReportStatusRequest, UpdateStatusResponse};

use super::fleet::{checksum, MemoryFetcher};

#[derive(Default)]
struct ControlPlane {
    assignment: Mutex<Option<Assignment>>,
    reports: Mutex<Vec<ReportStatusRequest>>,
}

impl ControlPlane {
    fn statuses(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.status.clone())
            .collect()
    }
}

async fn assignment(State(plane): State<Arc<ControlPlane>>) -> impl IntoResponse {
    match plane.assignment.lock().unwrap().take() {
        Some(assignment) => Json(assignment).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn campaign() -> impl IntoResponse {
    Json(serde_json::json!({
        "id": "c1", "name": "agent 2.0", "binary_id": "agent", "target_version": "2.0.0",
        "kind": "update", "strategy": "immediate", "status": "in_progress",
        "total_devices": 1, "updated_devices": 0, "failed_devices": 0,
        "deployment_id": "dep-1",
        "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"
    }))
}

async fn report(
    State(plane): State<Arc<ControlPlane>>,
    Json(request): Json<ReportStatusRequest>,
) -> StatusCode {
    plane.reports.lock().unwrap().push(request);
    StatusCode::ACCEPTED
}

async fn control_plane(plane: Arc<ControlPlane>) -> String {
    let app = Router::new()
        .route("/api/v1/devices/{device_id}/assignment", get(assignment))
        .route("/api/v1/campaigns/{id}", get(campaign))
        .route(REPORTS_PATH, post(report))
        .with_state(plane);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn update() -> Assignment {
    Assignment {
        target: ReportTarget {
            campaign_id: "c1".to_string(),
            deployment_id: Some("dep-1".to_string()),
        },
        work: AssignedWork::Apply {
            update: Update {
                id: "c1".to_string(),
                version: "2.0.0".to_string(),
                update_type: Default::default(),
                priority: Default::default(),
                url: "https://artifacts.local/agent-2.0.0".to_string(),
                checksum: checksum(),
                signature: None,
                rollback_enabled: true,
                pre_script: None,
                post_script: None,
                manifest: BTreeMap::from([("artifact_name".to_string(), "agent".to_string())]),
            },
        },
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(app: Router, uri: &str) -> T {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_device_applies_remote_assignment() {
    let plane = Arc::new(ControlPlane::default());
    *plane.assignment.lock().unwrap() = Some(update());
    let base_url = control_plane(plane.clone()).await;

    let tmp = tempfile::tempdir().unwrap();
    let client = HttpClient::new(&base_url, Duration::from_secs(5))
        .unwrap()
        .with_device_id("pi-7");
    let reporter = HttpReporter::new(client.clone()).with_retries(
        3,
        CooldownOptions {
            base_delay: Duration::from_millis(10),
            ..Default::default()
        },
    );
    let health = Arc::new(HealthChecker::new());
    let executor = Arc::new(UpdateExecutor::new(
        ExecutorOptions {
            device_id: "pi-7".to_string(),
            state_dir: tmp.path().join("update"),
            staging_dir: tmp.path().join("staging"),
            ..Default::default()
        },
        Arc::new(RollbackManager::new(RollbackOptions {
            active_dir: tmp.path().join("active"),
            backup_dir: tmp.path().join("backups"),
            max_backups: 3,
        })),
        health.clone(),
        Arc::new(MemoryFetcher),
        Arc::new(reporter),
    ));

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = {
        let executor = executor.clone();
        let source = Arc::new(HttpUpdateSource::new(client));
        tokio::spawn(async move {
            let options = updater::Options {
                device_id: "pi-7".to_string(),
                interval: Duration::from_millis(20),
                watch_interval: Duration::from_millis(20),
            };
            updater::run(
                &options,
                source,
                executor,
                tokio::time::sleep,
                Box::pin(async move {
                    let _ = stop_rx.await;
                }),
            )
            .await;
        })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !plane.statuses().iter().any(|s| s == "installed") {
        assert!(tokio::time::Instant::now() < deadline, "reports: {:?}", plane.statuses());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let _ = stop_tx.send(());
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();

    let statuses = plane.statuses();
    assert_eq!(statuses.first().map(String::as_str), Some("downloading"));
    assert_eq!(statuses.last().map(String::as_str), Some("installed"));
    assert!(plane
        .reports
        .lock()
        .unwrap()
        .iter()
        .all(|r| r.device_id == "pi-7" && r.deployment_id.as_deref() == Some("dep-1")));

    let app = router(Arc::new(ServerState::new(executor.clone(), health)));
    let status: UpdateStatusResponse = get_json(app.clone(), "/update/status").await;
    assert_eq!(status.device_id, "pi-7");
    assert_eq!(status.current_version.as_deref(), Some("2.0.0"));
    assert_eq!(status.status.as_deref(), Some("installed"));
    assert_eq!(status.progress, 100);

    let backups: BackupListResponse = get_json(app, "/backups").await;
    assert_eq!(backups.total, 1);
}
