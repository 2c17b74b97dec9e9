//! # Restart Integration Tests

use lychee::domain::{HealthCheckSpec, LifecycleState, ProbeKind};
use lychee::OrchestratorError;

use crate::common::{pid_alive, position, TestProject};

use LifecycleState::*;

#[tokio::test]
async fn test_restart_replaces_only_that_service() {
    let mut env = TestProject::new()
        .service("db", &[])
        .service("api", &["db"])
        .service("web", &["api"])
        .start();
    env.orchestrator.start_all().await.unwrap();

    let before_db = env.status("db").await.pid.unwrap();
    let before_api = env.status("api").await.pid.unwrap();
    let before_web = env.status("web").await.pid.unwrap();
    env.transitions();

    env.orchestrator.restart("api").await.unwrap();

    let api = env.status("api").await;
    assert_eq!(api.state, Running);
    assert_eq!(api.restart_count, 1);
    assert_ne!(api.pid, Some(before_api));
    assert!(!pid_alive(before_api));

    assert_eq!(env.status("db").await.pid, Some(before_db));
    let web = env.status("web").await;
    assert_eq!(web.pid, Some(before_web));
    assert_eq!(web.state, Running);
    assert_eq!(web.restart_count, 0);

    let transitions = env.transitions();
    assert!(position(&transitions, "api", Restarting) < position(&transitions, "api", Starting));
    assert!(transitions.iter().all(|(service, _)| service == "api"), "{transitions:?}");

    env.shutdown().await;
}

#[tokio::test]
async fn test_restart_requires_running_dependencies() {
    let env = TestProject::new()
        .service("db", &[])
        .service("api", &["db"])
        .start();
    env.orchestrator.start_all().await.unwrap();
    env.orchestrator.stop("db").await.unwrap();

    let err = env.orchestrator.restart("api").await.unwrap_err();
    match err {
        OrchestratorError::DependencyNotReady { service, dependency } => {
            assert_eq!(service, "api");
            assert_eq!(dependency, "db");
        }
        other => panic!("unexpected error {other:?}"),
    }
    // rejected restarts leave the service alone
    let api = env.status("api").await;
    assert_eq!(api.state, Running);
    assert_eq!(api.restart_count, 0);

    env.shutdown().await;
}

#[tokio::test]
async fn test_restart_unknown_service() {
    let env = TestProject::new().service("db", &[]).start();

    let err = env.orchestrator.restart("ghost").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownService(ref name) if name == "ghost"));

    env.shutdown().await;
}

#[tokio::test]
async fn test_restart_recovers_failed_service() {
    let ready_file = HealthCheckSpec::new(ProbeKind::Command, "test -f ready").with_timing(20, 300, 3);
    let project = TestProject::new().checked_service("api", &[], ready_file);
    let marker = project.root().join("api").join("ready");
    let env = project.start();

    let report = env.orchestrator.start_all().await.unwrap();
    assert_eq!(report.failed(), vec!["api"]);

    std::fs::write(&marker, "").unwrap();
    env.orchestrator.restart("api").await.unwrap();

    let api = env.status("api").await;
    assert_eq!(api.state, Running);
    assert_eq!(api.restart_count, 1);
    assert!(api.failure.is_none());

    env.shutdown().await;
}

#[tokio::test]
async fn test_restart_reports_failure_of_new_instance() {
    let ready_file = HealthCheckSpec::new(ProbeKind::Command, "test -f ready").with_timing(20, 300, 3);
    let project = TestProject::new().checked_service("api", &[], ready_file);
    let marker = project.root().join("api").join("ready");
    std::fs::write(&marker, "").unwrap();
    let env = project.start();

    assert!(env.orchestrator.start_all().await.unwrap().all_running());

    std::fs::remove_file(&marker).unwrap();
    let err = env.orchestrator.restart("api").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::HealthCheckFailed { ref service, .. } if service == "api"));
    assert_eq!(env.state("api").await, Failed);

    env.shutdown().await;
}
