//! Deployments submitted as manifests

use tokio_test::{assert_err, assert_ok};

use edgeroll::errors::FleetError;
use edgeroll::models::deployment::DeploymentStatus;
use edgeroll::models::strategy::Strategy;

use super::fleet::{checksum, Fleet};

fn manifest(kind: &str, strategy: &str) -> String {
    format!(
        r#"
apiVersion: fleet/v1
kind: {kind}
metadata:
  name: sensor-agent
  namespace: lab
spec:
  selector:
    matchLabels:
      env: prod
  strategy:
{strategy}
  template:
    spec:
      artifacts:
        - name: agent
          version: 2.0.0
          url: https://artifacts.local/agent-2.0.0
          checksum: {checksum}
"#,
        checksum = checksum()
    )
}

const ROLLING: &str = r#"    type: RollingUpdate
    rollingUpdate:
      maxUnavailable: "50%"
      maxSurge: 0"#;

#[tokio::test]
async fn test_rolling_manifest_rolls_out() {
    let fleet = Fleet::start(&[("pi-1", true), ("pi-2", true), ("pi-3", true), ("pi-4", true)]);

    let deployment = assert_ok!(
        fleet
            .orchestrator
            .create_deployment_from_manifest(manifest("Deployment", ROLLING).as_bytes(), "cli")
            .await
    );
    assert_eq!(deployment.namespace, "lab");
    assert_eq!(deployment.artifact.version, "2.0.0");
    match &deployment.strategy {
        Strategy::Rolling(cfg) => assert_eq!(cfg.effective_batch_size(), 2),
        other => panic!("unexpected strategy {:?}", other),
    }

    assert_ok!(fleet.orchestrator.start_deployment(&deployment.id).await);
    let status = fleet
        .wait_for(&deployment.id, |s| s.status.is_terminal())
        .await;
    assert_eq!(status.status, DeploymentStatus::Completed);
    assert_eq!(status.progress.installed, 4);

    fleet.stop().await;
}

#[tokio::test]
async fn test_invalid_manifest_is_rejected() {
    let fleet = Fleet::start(&[("pi-1", true)]);

    let err = assert_err!(
        fleet
            .orchestrator
            .create_deployment_from_manifest(manifest("Service", ROLLING).as_bytes(), "cli")
            .await
    );
    assert!(matches!(err, FleetError::InvalidInput(_)));

    let err = assert_err!(
        fleet
            .orchestrator
            .create_deployment_from_manifest(b"apiVersion: [", "cli")
            .await
    );
    assert!(!err.is_retryable());

    fleet.stop().await;
}
