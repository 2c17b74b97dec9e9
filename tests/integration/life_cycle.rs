//! # Life Cycle Integration Tests
//!
//! Dependency-ordered startup, explicit stops, and shutdown while services are
//! still coming up.

use lychee::domain::{HealthCheckSpec, LifecycleState, ProbeKind};
use lychee::{OrchestratorError, ServiceOutcome};
use std::time::Duration;

use crate::common::{command_check, pid_alive, position, TestProject};

use LifecycleState::*;

#[tokio::test]
async fn test_chain_starts_in_dependency_order() {
    // declared in reverse to make sure order comes from the graph
    let mut env = TestProject::new()
        .checked_service("web", &["api"], command_check("true"))
        .checked_service("api", &["db"], command_check("true"))
        .checked_service("db", &[], command_check("true"))
        .start();

    let report = env.orchestrator.start_all().await.unwrap();
    assert!(report.all_running(), "{report:?}");
    let names: Vec<&str> = report.outcomes.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["db", "api", "web"]);

    let transitions = env.transitions();
    assert!(position(&transitions, "db", Running) < position(&transitions, "api", Starting));
    assert!(position(&transitions, "api", Running) < position(&transitions, "web", Starting));

    for service in ["db", "api", "web"] {
        let status = env.status(service).await;
        assert!(status.running);
        assert!(status.pid.is_some());
        assert_eq!(status.restart_count, 0);
    }

    env.shutdown().await;
}

#[tokio::test]
async fn test_independent_services_start_together() {
    let mut env = TestProject::new()
        .checked_service("left", &[], command_check("sleep 0.2"))
        .checked_service("right", &[], command_check("sleep 0.2"))
        .start();

    let report = env.orchestrator.start_all().await.unwrap();
    assert!(report.all_running());

    // neither waited for the other to become healthy
    let transitions = env.transitions();
    let first_running = position(&transitions, "left", Running).min(position(&transitions, "right", Running));
    assert!(position(&transitions, "left", Starting) < first_running);
    assert!(position(&transitions, "right", Starting) < first_running);

    env.shutdown().await;
}

#[tokio::test]
async fn test_start_subset_includes_dependencies_only() {
    let env = TestProject::new()
        .service("db", &[])
        .service("api", &["db"])
        .service("web", &["api"])
        .start();

    let report = env.orchestrator.start(["api"]).await.unwrap();
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.get("db"), Some(&ServiceOutcome::Running));
    assert_eq!(report.get("api"), Some(&ServiceOutcome::Running));
    assert_eq!(env.state("web").await, Pending);

    let err = env.orchestrator.start(["ghost"]).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownService(ref name) if name == "ghost"));

    env.shutdown().await;
}

#[tokio::test]
async fn test_stop_leaves_dependents_running() {
    let env = TestProject::new()
        .service("db", &[])
        .service("api", &["db"])
        .start();
    env.orchestrator.start_all().await.unwrap();
    let db_pid = env.status("db").await.pid.unwrap();

    env.orchestrator.stop("db").await.unwrap();

    let db = env.status("db").await;
    assert_eq!(db.state, Stopped);
    assert!(db.pid.is_none());
    assert!(!pid_alive(db_pid));
    assert_eq!(env.state("api").await, Running);

    // stopping again is an error, not a no-op
    let err = env.orchestrator.stop("db").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotRunning(_)));

    env.shutdown().await;
}

#[tokio::test]
async fn test_stop_all_then_start_again() {
    let env = TestProject::new()
        .service("db", &[])
        .service("api", &["db"])
        .start();
    env.orchestrator.start_all().await.unwrap();

    env.orchestrator.stop_all().await.unwrap();
    assert_eq!(env.state("db").await, Stopped);
    assert_eq!(env.state("api").await, Stopped);

    let report = env.orchestrator.start_all().await.unwrap();
    assert!(report.all_running());

    env.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_partially_started_services() {
    let never_ready = HealthCheckSpec::new(ProbeKind::Command, "exit 1").with_timing(50, 30_000, 1_000);
    let env = TestProject::new()
        .checked_service("slow", &[], never_ready)
        .service("after", &["slow"])
        .start();

    let orchestrator = env.orchestrator.clone();
    let start = tokio::spawn(async move { orchestrator.start_all().await });

    let status = env.wait_for_state("slow", HealthChecking).await;
    let pid = status.pid.unwrap();
    assert!(pid_alive(pid));

    tokio::time::timeout(Duration::from_secs(10), env.orchestrator.shutdown())
        .await
        .unwrap()
        .unwrap();

    let report = start.await.unwrap().unwrap();
    assert_eq!(
        report.get("slow"),
        Some(&ServiceOutcome::NotStarted { state: Stopped })
    );
    assert_eq!(
        report.get("after"),
        Some(&ServiceOutcome::NotStarted { state: Pending })
    );
    assert!(!pid_alive(pid));

    // the actor is gone once shutdown has completed
    assert!(env.orchestrator.status().await.is_err());
}
