//! # Failure Containment Integration Tests
//!
//! A failing service takes down only itself and whatever depends on it.

use lychee::domain::{HealthCheckSpec, HealthStatus, LifecycleState, ProbeKind, ServiceSpec};
use lychee::{FailureReason, ServiceOutcome};
use serde_json::json;

use crate::common::{command_check, failing_check, TestProject};

use LifecycleState::*;

fn failure(outcome: Option<&ServiceOutcome>) -> FailureReason {
    match outcome {
        Some(ServiceOutcome::Failed { reason }) => reason.clone(),
        other => panic!("expected a failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_health_failure_propagates_to_dependents() {
    let env = TestProject::new()
        .checked_service("db", &[], failing_check())
        .service("api", &["db"])
        .service("web", &["api"])
        .start();

    let report = env.orchestrator.start_all().await.unwrap();
    assert_eq!(report.failed(), vec!["db", "api", "web"]);

    assert!(matches!(
        failure(report.get("db")),
        FailureReason::HealthCheckFailed { .. }
    ));
    // dependents name the root cause, not their direct dependency
    for service in ["api", "web"] {
        assert_eq!(
            failure(report.get(service)),
            FailureReason::DependencyFailed {
                upstream: "db".into()
            }
        );
    }

    let db = env.status("db").await;
    assert_eq!(db.state, Failed);
    assert!(db.pid.is_none());
    assert!(matches!(db.health, Some(HealthStatus::Unhealthy { .. })));

    // dependents never got a process
    assert!(env.status("api").await.pid.is_none());

    env.shutdown().await;
}

#[tokio::test]
async fn test_failing_sibling_does_not_affect_others() {
    let env = TestProject::new()
        .service("a", &[])
        .checked_service("b", &[], failing_check())
        .checked_service("c", &["a"], command_check("true"))
        .start();

    let report = env.orchestrator.start_all().await.unwrap();
    assert_eq!(report.get("a"), Some(&ServiceOutcome::Running));
    assert_eq!(report.get("c"), Some(&ServiceOutcome::Running));
    assert_eq!(report.failed(), vec!["b"]);

    env.shutdown().await;
}

#[tokio::test]
async fn test_unresolved_kind_fails_service() {
    let project = TestProject::new();
    let legacy = ServiceSpec::new("legacy", project.root().join("legacy"), "cobol");
    let env = project
        .spec(legacy)
        .service("client", &["legacy"])
        .service("other", &[])
        .start();

    let report = env.orchestrator.start_all().await.unwrap();
    assert_eq!(
        failure(report.get("legacy")),
        FailureReason::UnresolvedKind {
            kind: "cobol".into()
        }
    );
    assert_eq!(
        failure(report.get("client")),
        FailureReason::DependencyFailed {
            upstream: "legacy".into()
        }
    );
    assert_eq!(report.get("other"), Some(&ServiceOutcome::Running));

    env.shutdown().await;
}

#[tokio::test]
async fn test_spawn_failure_is_start_failed() {
    let env = TestProject::new()
        .command_service("broken", &[], json!(["/nonexistent/lychee-test-binary"]), None)
        .start();

    let report = env.orchestrator.start_all().await.unwrap();
    match failure(report.get("broken")) {
        FailureReason::StartFailed { cause } => assert!(cause.contains("lychee-test-binary"), "{cause}"),
        other => panic!("unexpected failure {other:?}"),
    }

    env.shutdown().await;
}

#[tokio::test]
async fn test_crashed_process_marks_service_failed() {
    let env = TestProject::new()
        .command_service("crasher", &[], json!(["sh", "-c", "sleep 0.5; exit 3"]), None)
        .service("steady", &[])
        .start();

    let report = env.orchestrator.start_all().await.unwrap();
    assert!(report.all_running());

    let status = env.wait_for_state("crasher", Failed).await;
    assert_eq!(status.failure, Some(FailureReason::ProcessExited { code: Some(3) }));
    assert!(!status.running);
    assert_eq!(env.state("steady").await, Running);

    env.shutdown().await;
}

#[tokio::test]
async fn test_blocked_dependent_fails_without_starting() {
    let ready_file = HealthCheckSpec::new(ProbeKind::Command, "test -f ready").with_timing(20, 300, 3);
    let project = TestProject::new()
        .checked_service("db", &[], ready_file)
        .service("api", &["db"]);
    let marker = project.root().join("db").join("ready");
    std::fs::write(&marker, "").unwrap();
    let mut env = project.start();

    assert!(env.orchestrator.start_all().await.unwrap().all_running());
    env.orchestrator.stop_all().await.unwrap();
    assert_eq!(env.state("api").await, Stopped);

    std::fs::remove_file(&marker).unwrap();
    env.transitions();
    let report = env.orchestrator.start_all().await.unwrap();
    assert_eq!(
        failure(report.get("api")),
        FailureReason::DependencyFailed {
            upstream: "db".into()
        }
    );

    // stopped straight to failed, no phantom start
    let api: Vec<LifecycleState> = env
        .transitions()
        .into_iter()
        .filter(|(service, _)| service == "api")
        .map(|(_, state)| state)
        .collect();
    assert_eq!(api, vec![Failed]);
    assert!(env.status("api").await.pid.is_none());

    // already failed dependents stay failed without another transition
    let report = env.orchestrator.start_all().await.unwrap();
    assert_eq!(report.failed(), vec!["db", "api"]);
    assert!(env.transitions().iter().all(|(service, _)| service != "api"));

    env.shutdown().await;
}
