//! Rollouts through the campaign service down to device executors

use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;

use edgeroll::errors::FleetError;
use edgeroll::models::deployment::{DeploymentStatus, DeviceStatus};
use edgeroll::models::strategy::{CanaryConfig, RollingConfig, Strategy};
use edgeroll::update::executor::UpdateExecutor;

use super::fleet::{request, Fleet, SlowFetcher, BODY};

async fn wait_for_devices<P>(executors: &[Arc<UpdateExecutor>], done: P)
where
    P: Fn(&UpdateExecutor) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !executors.iter().all(|e| done(e)) {
        assert!(tokio::time::Instant::now() < deadline, "devices never settled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_rolling_deployment_reaches_every_device() {
    let fleet = Fleet::start(&[("pi-1", true), ("pi-2", true), ("pi-3", true)]);
    let strategy = Strategy::Rolling(RollingConfig {
        batch_size: 1,
        max_unavailable: 1,
        max_surge: 0,
        max_failure_percentage: 25,
    });

    let deployment = assert_ok!(fleet.orchestrator.create_deployment(request(strategy)).await);
    assert_ok!(fleet.orchestrator.start_deployment(&deployment.id).await);

    let status = fleet
        .wait_for(&deployment.id, |s| s.status.is_terminal())
        .await;
    assert_eq!(status.status, DeploymentStatus::Completed);
    assert_eq!(status.progress.installed, 3);
    assert_eq!(status.progress.percentage, 100);

    // one campaign per batch
    let campaigns = assert_ok!(fleet.campaigns.list_campaigns().await);
    assert_eq!(campaigns.len(), 3);
    assert!(campaigns.iter().all(|c| c.deployment_id.as_deref() == Some(deployment.id.as_str())));

    for executor in &fleet.executors {
        assert_eq!(executor.current_version().as_deref(), Some("2.0.0"));
        let installed = executor
            .rollback_manager()
            .active_dir()
            .path()
            .join("agent");
        assert_eq!(tokio::fs::read(&installed).await.unwrap(), BODY);
    }
    assert_eq!(fleet.metrics.snapshot().deployments_completed, 1);

    fleet.stop().await;
}

#[tokio::test]
async fn test_unhealthy_devices_abort_the_rollout() {
    let fleet = Fleet::start(&[("pi-1", false), ("pi-2", false)]);
    let mut deployment_request = request(Strategy::Immediate);
    deployment_request.abort_threshold = Some(50);

    let deployment = assert_ok!(fleet.orchestrator.create_deployment(deployment_request).await);
    assert_ok!(fleet.orchestrator.start_deployment(&deployment.id).await);

    let status = fleet
        .wait_for(&deployment.id, |s| s.status.is_terminal())
        .await;
    assert_eq!(status.status, DeploymentStatus::RolledBack);
    assert!(status.failure_reason.is_some());
    assert_eq!(status.progress.installed, 0);

    // nothing stays installed on a device whose health checks fail
    for executor in &fleet.executors {
        assert!(executor.current_version().is_none());
        let state = executor.last_state().unwrap();
        assert_ne!(state.status, DeviceStatus::Installed);
    }

    fleet.stop().await;
}

#[tokio::test]
async fn test_canary_waits_for_promotion() {
    let fleet = Fleet::start(&[("pi-1", true), ("pi-2", true), ("pi-3", true), ("pi-4", true)]);
    let strategy = Strategy::Canary(CanaryConfig {
        canary_percentage: 25,
        validation_duration_ms: 0,
        auto_promote: false,
        success_threshold: 90,
    });

    let deployment = assert_ok!(fleet.orchestrator.create_deployment(request(strategy)).await);
    assert_ok!(fleet.orchestrator.start_deployment(&deployment.id).await);

    let status = fleet.wait_for(&deployment.id, |s| s.awaiting_promotion).await;
    assert_eq!(status.status, DeploymentStatus::Running);
    assert_eq!(status.progress.installed, 1);
    assert_eq!(status.progress.pending, 3);

    assert_ok!(fleet.orchestrator.promote_deployment(&deployment.id).await);
    let status = fleet
        .wait_for(&deployment.id, |s| s.status.is_terminal())
        .await;
    assert_eq!(status.status, DeploymentStatus::Completed);
    assert_eq!(status.progress.installed, 4);

    fleet.stop().await;
}

#[tokio::test]
async fn test_cancelled_deployment_stops_dispatching() {
    let fleet = Fleet::start(&[("pi-1", true), ("pi-2", true)]);
    let strategy = Strategy::Canary(CanaryConfig {
        canary_percentage: 50,
        validation_duration_ms: 0,
        auto_promote: false,
        success_threshold: 90,
    });

    let deployment = assert_ok!(fleet.orchestrator.create_deployment(request(strategy)).await);
    assert_ok!(fleet.orchestrator.start_deployment(&deployment.id).await);
    fleet.wait_for(&deployment.id, |s| s.awaiting_promotion).await;

    let cancelled = assert_ok!(fleet.orchestrator.cancel_deployment(&deployment.id).await);
    assert_eq!(cancelled.status, DeploymentStatus::Cancelled);

    let status = assert_ok!(fleet.orchestrator.get_deployment_status(&deployment.id).await);
    assert_eq!(status.progress.installed, 1);
    assert_eq!(status.progress.failed, 1);
    let untouched = fleet
        .executors
        .iter()
        .filter(|e| e.current_version().is_none())
        .count();
    assert_eq!(untouched, 1);

    fleet.stop().await;
}

#[tokio::test]
async fn test_paused_downloads_resume_after_resume() {
    let devices = [("pi-1", true), ("pi-2", true), ("pi-3", true), ("pi-4", true)];
    let fleet = Fleet::start_with(&devices, Arc::new(SlowFetcher(Duration::from_millis(1500))));

    let deployment = assert_ok!(fleet.orchestrator.create_deployment(request(Strategy::Immediate)).await);
    assert_ok!(fleet.orchestrator.start_deployment(&deployment.id).await);
    wait_for_devices(&fleet.executors, |e| {
        e.last_state().is_some_and(|s| s.status == DeviceStatus::Downloading)
    })
    .await;

    let paused = assert_ok!(fleet.orchestrator.pause_deployment(&deployment.id).await);
    assert_eq!(paused.status, DeploymentStatus::Paused);

    // every download is dropped and handed back, none fails
    wait_for_devices(&fleet.executors, |e| {
        e.last_state().is_some_and(|s| s.status == DeviceStatus::Pending)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = assert_ok!(fleet.orchestrator.get_deployment_status(&deployment.id).await);
    assert_eq!(status.status, DeploymentStatus::Paused);
    assert_eq!(status.progress.failed, 0);
    assert_eq!(status.progress.installed, 0);
    assert!(fleet.executors.iter().all(|e| e.current_version().is_none()));

    assert_ok!(fleet.orchestrator.resume_deployment(&deployment.id).await);
    let status = fleet
        .wait_for(&deployment.id, |s| s.status.is_terminal())
        .await;
    assert_eq!(status.status, DeploymentStatus::Completed);
    assert_eq!(status.progress.installed, 4);
    assert_eq!(status.progress.failed, 0);
    assert!(fleet
        .executors
        .iter()
        .all(|e| e.current_version().as_deref() == Some("2.0.0")));

    fleet.stop().await;
}

#[tokio::test]
async fn test_installed_file_is_named_after_the_artifact() {
    let fleet = Fleet::start(&[("pi-1", true)]);

    let mut nested = request(Strategy::Immediate);
    nested.name = "edge/agent".to_string();
    let deployment = assert_ok!(fleet.orchestrator.create_deployment(nested).await);
    assert_ok!(fleet.orchestrator.start_deployment(&deployment.id).await);
    let status = fleet
        .wait_for(&deployment.id, |s| s.status.is_terminal())
        .await;
    assert_eq!(status.status, DeploymentStatus::Completed);

    let active = fleet.executors[0].rollback_manager().active_dir().path().to_path_buf();
    assert_eq!(tokio::fs::read(active.join("agent")).await.unwrap(), BODY);
    assert!(!active.join("edge").exists());

    for name in ["edge/agent", "../agent", "..", "bin\\agent"] {
        let mut escaping = request(Strategy::Immediate);
        escaping.artifact.name = name.to_string();
        let err = fleet.orchestrator.create_deployment(escaping).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidInput(_)), "{}: {:?}", name, err);
    }

    fleet.stop().await;
}

#[tokio::test]
async fn test_failed_device_rollback_is_reported() {
    let fleet = Fleet::start(&[("pi-1", true), ("pi-2", true)]);

    let deployment = assert_ok!(fleet.orchestrator.create_deployment(request(Strategy::Immediate)).await);
    assert_ok!(fleet.orchestrator.start_deployment(&deployment.id).await);
    let status = fleet
        .wait_for(&deployment.id, |s| s.status.is_terminal())
        .await;
    assert_eq!(status.status, DeploymentStatus::Completed);

    // pi-2 loses the backup taken before the install
    tokio::fs::remove_dir_all(fleet.device_root("pi-2").join("backups"))
        .await
        .unwrap();

    let rolled = assert_ok!(
        fleet
            .orchestrator
            .rollback_deployment(&deployment.id, "bad release", false)
            .await
    );
    assert_eq!(rolled.status, DeploymentStatus::RolledBack);
    assert_eq!(rolled.rolled_back_count, 0);

    let status = fleet
        .wait_for(&deployment.id, |s| {
            s.progress.rolled_back + s.progress.failed == 2
        })
        .await;
    assert_eq!(status.rolled_back_count, 1);
    assert_eq!(status.progress.rolled_back, 1);
    assert_eq!(status.progress.failed, 1);
    let reason = status.failure_reason.unwrap();
    assert!(reason.starts_with("bad release"), "{}", reason);
    assert!(reason.contains("rollback failed on pi-2"), "{}", reason);

    assert!(fleet.executors[0].current_version().is_none());
    assert_eq!(fleet.executors[1].current_version().as_deref(), Some("2.0.0"));
    assert_eq!(
        fleet.executors[1].last_state().map(|s| s.status),
        Some(DeviceStatus::Failed)
    );

    fleet.stop().await;
}
