mod common;

use chrono::{Duration, Utc};

use cb_core::error::OrchestratorError;
use cb_core::models::{
    DeploymentKind, DeploymentStatus, Environment, HealthStatus, SlotColor, SlotState, StepStatus,
};

use common::{harness, harness_with, SERVER_HOST};

const PROD: Environment = Environment::Production;

#[tokio::test]
async fn first_deploy_lands_in_blue_without_activating() {
    let h = harness();

    let result = h.deploy("demo", PROD, "v1").await.unwrap();
    assert!(result.success);
    assert_eq!(result.slot, SlotColor::Blue);
    assert_eq!(result.port, 4000);
    assert_eq!(result.preview_url.as_deref(), Some(format!("http://{SERVER_HOST}:4000").as_str()));
    let names: Vec<&str> = result.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "select_slot",
            "teardown",
            "allocate_port",
            "start_container",
            "health_check",
            "finalize"
        ]
    );
    assert!(result.steps.iter().all(|s| s.status == StepStatus::Success));

    let registry = h.status("demo", PROD).await;
    assert_eq!(registry.active_slot, None);
    assert_eq!(registry.blue.state, SlotState::Deployed);
    assert_eq!(registry.blue.port, Some(4000));
    assert_eq!(registry.blue.version.as_deref(), Some("v1"));
    assert_eq!(registry.blue.image.as_deref(), Some("img:v1"));
    assert_eq!(registry.blue.health_status, HealthStatus::Healthy);
    assert_eq!(registry.blue.deployed_by.as_deref(), Some("ci"));
    assert_eq!(registry.green.state, SlotState::Empty);

    // No traffic switch on deploy.
    assert_eq!(h.fleet.with(|s| s.reloads), 0);
    assert!(h.fleet.with(|s| s.containers.contains_key("cb-demo-production-blue")));
}

#[tokio::test]
async fn container_unit_carries_locked_down_profile() {
    let h = harness();
    h.deploy("demo", PROD, "v1").await.unwrap();

    let unit = h.fleet.with(|s| {
        s.files
            .get("/etc/containers/systemd/cb-demo-production-blue.container")
            .cloned()
    });
    let unit = unit.expect("unit written");
    for line in [
        "ReadOnly=true",
        "NoNewPrivileges=true",
        "DropCapability=ALL",
        "Tmpfs=/tmp:rw,noexec,nosuid,size=64m",
        "PublishPort=4000:3000",
        "Image=img:v1",
    ] {
        assert!(unit.lines().any(|l| l == line), "missing {line} in\n{unit}");
    }
}

#[tokio::test]
async fn scenario_a_promote_first_deploy() {
    let h = harness();
    h.deploy("demo", PROD, "v1").await.unwrap();

    let result = h.promote("demo", PROD).await.unwrap();
    assert_eq!(result.active_slot, SlotColor::Blue);
    assert_eq!(result.previous_slot, None);
    assert_eq!(result.port, 4000);
    assert_eq!(result.grace_expires_at, None);

    let registry = h.status("demo", PROD).await;
    assert_eq!(registry.active_slot, Some(SlotColor::Blue));
    assert_eq!(registry.blue.state, SlotState::Active);
    assert_eq!(registry.grace_expires_at, None);
    assert_eq!(h.fleet.with(|s| s.routed_port("demo-production")), Some(4000));
    assert_eq!(h.fleet.with(|s| s.reloads), 1);
}

#[tokio::test]
async fn scenario_b_second_release_pushes_first_into_grace() {
    let h = harness();
    h.deploy("demo", PROD, "v1").await.unwrap();
    h.promote("demo", PROD).await.unwrap();

    let deployed = h.deploy("demo", PROD, "v2").await.unwrap();
    assert_eq!(deployed.slot, SlotColor::Green);
    assert_eq!(deployed.port, 4001);
    let registry = h.status("demo", PROD).await;
    assert_eq!(registry.blue.state, SlotState::Active);
    assert_eq!(registry.green.state, SlotState::Deployed);
    assert_eq!(h.fleet.with(|s| s.routed_port("demo-production")), Some(4000));

    let before = Utc::now();
    let promoted = h.promote("demo", PROD).await.unwrap();
    let after = Utc::now();
    assert_eq!(promoted.active_slot, SlotColor::Green);
    assert_eq!(promoted.previous_slot, Some(SlotColor::Blue));

    let registry = h.status("demo", PROD).await;
    assert_eq!(registry.active_slot, Some(SlotColor::Green));
    assert_eq!(registry.green.state, SlotState::Active);
    assert_eq!(registry.blue.state, SlotState::Grace);
    let expires = registry.grace_expires_at.expect("grace window set");
    assert!(expires >= before + Duration::hours(48));
    assert!(expires <= after + Duration::hours(48));
    assert_eq!(h.fleet.with(|s| s.routed_port("demo-production")), Some(4001));
    // The old release keeps running through its grace window.
    assert!(h.fleet.with(|s| s.containers.contains_key("cb-demo-production-blue")));
}

#[tokio::test]
async fn scenario_c_rollback_within_grace() {
    let h = harness();
    h.deploy("demo", PROD, "v1").await.unwrap();
    h.promote("demo", PROD).await.unwrap();
    h.deploy("demo", PROD, "v2").await.unwrap();
    h.promote("demo", PROD).await.unwrap();

    let result = h.rollback("demo", PROD).await.unwrap();
    assert_eq!(result.active_slot, SlotColor::Blue);
    assert_eq!(result.previous_slot, Some(SlotColor::Green));
    assert_eq!(result.reason.as_deref(), Some("bad release"));

    let registry = h.status("demo", PROD).await;
    assert_eq!(registry.active_slot, Some(SlotColor::Blue));
    assert_eq!(registry.blue.state, SlotState::Active);
    assert_eq!(registry.blue.version.as_deref(), Some("v1"));
    assert_eq!(registry.green.state, SlotState::Grace);
    assert!(registry.grace_expires_at.is_some());
    assert_eq!(h.fleet.with(|s| s.routed_port("demo-production")), Some(4000));
}

#[tokio::test]
async fn rollback_can_itself_be_rolled_back() {
    let h = harness();
    h.deploy("demo", PROD, "v1").await.unwrap();
    h.promote("demo", PROD).await.unwrap();
    h.deploy("demo", PROD, "v2").await.unwrap();
    h.promote("demo", PROD).await.unwrap();
    h.rollback("demo", PROD).await.unwrap();

    let again = h.rollback("demo", PROD).await.unwrap();
    assert_eq!(again.active_slot, SlotColor::Green);
    let registry = h.status("demo", PROD).await;
    assert_eq!(registry.green.state, SlotState::Active);
    assert_eq!(registry.blue.state, SlotState::Grace);
}

#[tokio::test]
async fn deploy_promote_rollback_round_trip_restores_active_release() {
    let h = harness();
    h.deploy("demo", PROD, "v1").await.unwrap();
    h.promote("demo", PROD).await.unwrap();
    let before = h.status("demo", PROD).await;

    h.deploy("demo", PROD, "v2").await.unwrap();
    h.promote("demo", PROD).await.unwrap();
    h.rollback("demo", PROD).await.unwrap();

    let after = h.status("demo", PROD).await;
    assert_eq!(after.active_slot, before.active_slot);
    let active = after.active_slot.unwrap();
    assert_eq!(after.slot(active).version, before.slot(active).version);
    assert_eq!(after.slot(active).port, before.slot(active).port);
    assert_eq!(after.slot(active.other()).state, SlotState::Grace);
    assert_eq!(after.slot(active.other()).version.as_deref(), Some("v2"));
}

#[tokio::test]
async fn scenario_d_unhealthy_deploy_restores_slot_exactly() {
    let h = harness();
    h.deploy("demo", PROD, "v1").await.unwrap();
    h.promote("demo", PROD).await.unwrap();
    let before = h.status("demo", PROD).await;

    h.fleet.with(|s| s.unhealthy_versions.insert("v2".into()));
    let err = h.deploy("demo", PROD, "v2").await.unwrap_err();
    match &err {
        OrchestratorError::HealthCheckFailed {
            slot,
            port,
            version,
            attempts,
            status,
        } => {
            assert_eq!(*slot, SlotColor::Green);
            assert_eq!(*port, 4001);
            assert_eq!(version, "v2");
            assert_eq!(*attempts, 3);
            assert_eq!(*status, HealthStatus::Degraded);
        }
        other => panic!("expected HealthCheckFailed, got {other:?}"),
    }
    assert_eq!(err.code(), "HEALTH_CHECK_FAILED");

    let after = h.status("demo", PROD).await;
    assert_eq!(after.green.state, before.green.state);
    assert_eq!(after.green.port, before.green.port);
    assert_eq!(after.green.version, before.green.version);
    assert!(after.green.error.as_deref().unwrap_or_default().contains("health check failed"));
    assert_eq!(after.active_slot, Some(SlotColor::Blue));
    assert_eq!(after.blue, before.blue);

    // The failed container is gone and live traffic never moved.
    assert!(!h.fleet.with(|s| s.containers.contains_key("cb-demo-production-green")));
    assert_eq!(h.fleet.with(|s| s.routed_port("demo-production")), Some(4000));
}

#[tokio::test]
async fn failed_first_deploy_leaves_fresh_slot() {
    let h = harness();
    h.fleet.with(|s| s.unhealthy_versions.insert("v1".into()));

    assert!(matches!(
        h.deploy("demo", PROD, "v1").await,
        Err(OrchestratorError::HealthCheckFailed { .. })
    ));
    let registry = h.status("demo", PROD).await;
    assert_eq!(registry.blue.state, SlotState::Empty);
    assert_eq!(registry.blue.port, None);
    assert_eq!(registry.active_slot, None);
}

#[tokio::test]
async fn container_start_failure_is_not_retried() {
    let h = harness();
    h.fleet.with(|s| s.fail_start = true);

    let err = h.deploy("demo", PROD, "v1").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::RemoteCommand { .. }));
    assert_eq!(h.fleet.commands_matching("systemctl restart"), 1);
    assert_eq!(h.status("demo", PROD).await.blue.state, SlotState::Empty);
}

#[tokio::test]
async fn promote_twice_fails_with_no_deployed_slot() {
    let h = harness();
    h.deploy("demo", PROD, "v1").await.unwrap();
    h.promote("demo", PROD).await.unwrap();
    let reloads = h.fleet.with(|s| s.reloads);

    let err = h.promote("demo", PROD).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NoDeployedSlot { .. }));
    // Configuration is not re-applied.
    assert_eq!(h.fleet.with(|s| s.reloads), reloads);
}

#[tokio::test]
async fn promote_on_fresh_project_fails() {
    let h = harness();
    assert!(matches!(
        h.promote("demo", Environment::Staging).await,
        Err(OrchestratorError::NoDeployedSlot { .. })
    ));
}

#[tokio::test]
async fn rollback_without_grace_slot_fails() {
    let h = harness();
    h.deploy("demo", PROD, "v1").await.unwrap();
    h.promote("demo", PROD).await.unwrap();

    assert!(matches!(
        h.rollback("demo", PROD).await,
        Err(OrchestratorError::NoGraceSlot { .. })
    ));
}

#[tokio::test]
async fn rollback_after_grace_expiry_fails() {
    let h = harness_with(|config| config.grace_period_hours = 0);
    h.deploy("demo", PROD, "v1").await.unwrap();
    h.promote("demo", PROD).await.unwrap();
    h.deploy("demo", PROD, "v2").await.unwrap();
    h.promote("demo", PROD).await.unwrap();
    assert_eq!(h.status("demo", PROD).await.blue.state, SlotState::Grace);

    let err = h.rollback("demo", PROD).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NoGraceSlot { .. }));
    let registry = h.status("demo", PROD).await;
    assert_eq!(registry.active_slot, Some(SlotColor::Green));
}

#[tokio::test]
async fn redeploy_over_grace_slot_discards_rollback_target() {
    let h = harness();
    h.deploy("demo", PROD, "v1").await.unwrap();
    h.promote("demo", PROD).await.unwrap();
    h.deploy("demo", PROD, "v2").await.unwrap();
    h.promote("demo", PROD).await.unwrap();

    let result = h.deploy("demo", PROD, "v3").await.unwrap();
    assert_eq!(result.slot, SlotColor::Blue);
    assert_eq!(result.port, 4000);

    let registry = h.status("demo", PROD).await;
    assert_eq!(registry.blue.state, SlotState::Deployed);
    assert_eq!(registry.blue.version.as_deref(), Some("v3"));
    assert_eq!(registry.grace_expires_at, None);
    assert!(matches!(
        h.rollback("demo", PROD).await,
        Err(OrchestratorError::NoGraceSlot { .. })
    ));
}

#[tokio::test]
async fn failed_deploy_over_grace_slot_closes_the_window() {
    let h = harness();
    h.deploy("demo", PROD, "v1").await.unwrap();
    h.promote("demo", PROD).await.unwrap();
    h.deploy("demo", PROD, "v2").await.unwrap();
    h.promote("demo", PROD).await.unwrap();

    h.fleet.with(|s| s.unhealthy_versions.insert("v3".into()));
    let err = h.deploy("demo", PROD, "v3").await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::HealthCheckFailed { slot: SlotColor::Blue, port: 4000, .. }
    ));

    // v1's container was replaced, so there is nothing left to roll back to.
    let registry = h.status("demo", PROD).await;
    assert_eq!(registry.blue.state, SlotState::Empty);
    assert_eq!(registry.blue.port, Some(4000));
    assert_eq!(registry.blue.version, None);
    assert!(registry.blue.error.is_some());
    assert_eq!(registry.grace_expires_at, None);
    assert_eq!(registry.active_slot, Some(SlotColor::Green));
    assert!(!h.fleet.with(|s| s.containers.contains_key("cb-demo-production-blue")));

    assert!(matches!(
        h.rollback("demo", PROD).await,
        Err(OrchestratorError::NoGraceSlot { .. })
    ));
    assert_eq!(h.fleet.with(|s| s.routed_port("demo-production")), Some(4001));
}

#[tokio::test]
async fn failed_redeploy_of_staged_slot_leaves_nothing_to_promote() {
    let h = harness();
    h.deploy("demo", PROD, "v1").await.unwrap();
    h.promote("demo", PROD).await.unwrap();
    h.deploy("demo", PROD, "v2").await.unwrap();

    h.fleet.with(|s| s.unhealthy_versions.insert("v3".into()));
    assert!(h.deploy("demo", PROD, "v3").await.is_err());

    let registry = h.status("demo", PROD).await;
    assert_eq!(registry.green.state, SlotState::Empty);
    assert_eq!(registry.green.port, Some(4001));
    assert!(matches!(
        h.promote("demo", PROD).await,
        Err(OrchestratorError::NoDeployedSlot { .. })
    ));
    assert_eq!(h.fleet.with(|s| s.routed_port("demo-production")), Some(4000));
}

#[tokio::test]
async fn deploy_rejects_references_that_could_rewrite_units() {
    use cb_core::services::deploy::DeployRequest;
    use cb_core::services::dispatch::Operation;

    let h = harness();
    let requests = [
        (Some("v1\nAddCapability=ALL"), None),
        (Some("v1"), Some("img:v1\nPodmanArgs=--privileged")),
        (Some("v1"), Some("img:v1 --privileged")),
    ];
    for (version, image) in requests {
        let op = Operation::Deploy(DeployRequest {
            project_name: "demo".into(),
            environment: PROD,
            version: version.map(String::from),
            image: image.map(String::from),
        });
        let err = h.platform.execute(&h.auth, op).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REFERENCE");
    }

    assert!(h.fleet.with(|s| s.commands.is_empty() && s.files.is_empty()));
    assert_eq!(h.status("demo", PROD).await.blue.state, SlotState::Empty);
}

#[tokio::test]
async fn every_call_appends_one_history_record() {
    let h = harness();
    h.deploy("demo", PROD, "v1").await.unwrap();
    h.promote("demo", PROD).await.unwrap();
    let _ = h.promote("demo", PROD).await;
    let _ = h.rollback("demo", PROD).await;

    let history = h.history().await;
    let summary: Vec<(DeploymentKind, DeploymentStatus)> =
        history.iter().map(|r| (r.kind, r.status)).collect();
    assert_eq!(
        summary,
        [
            (DeploymentKind::Deploy, DeploymentStatus::Succeeded),
            (DeploymentKind::Promote, DeploymentStatus::Succeeded),
            (DeploymentKind::Promote, DeploymentStatus::Failed),
            (DeploymentKind::Rollback, DeploymentStatus::Failed),
        ]
    );
    assert_eq!(history[0].slot, Some(SlotColor::Blue));
    assert_eq!(history[0].version.as_deref(), Some("v1"));
    assert_eq!(history[3].reason.as_deref(), Some("bad release"));
    assert!(history[2].error.as_deref().unwrap_or_default().contains("no deployed slot"));
}

#[tokio::test]
async fn deploy_defaults_version_and_image() {
    use cb_core::services::deploy::DeployRequest;
    use cb_core::services::dispatch::{Operation, OperationOutcome};

    let h = harness();
    let op = Operation::Deploy(DeployRequest {
        project_name: "demo".into(),
        environment: Environment::Staging,
        version: None,
        image: None,
    });
    let OperationOutcome::Deploy(result) = h.platform.execute(&h.auth, op).await.unwrap() else {
        panic!("expected deploy outcome");
    };
    assert_eq!(result.version, "latest");
    assert_eq!(result.image, "demo:latest");
    assert_eq!(result.port, 3000);
}
