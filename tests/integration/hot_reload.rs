//! # Hot Reload Integration Tests
//!
//! Watcher commands fed into a live orchestrator: service restarts, schema
//! regeneration, and debounce of real filesystem writes.

use lychee::domain::{HealthCheckSpec, LifecycleState, ProbeKind, ServiceSpec};
use lychee::{ChangeCommand, ChangeWatcher, EventKind};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{RecordingPipeline, TestEnvironment, TestProject};
use crate::integration::poll_until;

use LifecycleState::*;

fn schema_project() -> TestProject {
    let project = TestProject::new();
    let api = ServiceSpec::new("api", project.root().join("api"), "command")
        .with_config(json!({ "start": ["sleep", "30"] }))
        .with_schemas(["user"], None);
    project.spec(api).service("web", &[])
}

async fn wait_for_restarts(env: &TestEnvironment, service: &str, count: u32) {
    let orchestrator = &env.orchestrator;
    poll_until(Duration::from_secs(10), Duration::from_millis(20), || async move {
        orchestrator
            .service_status(service)
            .await
            .ok()
            .filter(|s| s.restart_count == count && s.state == Running)
    })
    .await
    .unwrap_or_else(|| panic!("'{service}' was not restarted {count} time(s)"));
}

/// Next schema event's error, skipping everything else
async fn next_schema_result(env: &mut TestEnvironment) -> Option<String> {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), env.events.recv())
            .await
            .expect("no schema event")
            .unwrap();
        if let EventKind::SchemaRegenerated { error, .. } = event.kind {
            return error;
        }
    }
}

#[tokio::test]
async fn test_change_restarts_running_service() {
    let env = TestProject::new()
        .service("db", &[])
        .service("api", &["db"])
        .start();
    env.orchestrator.start_all().await.unwrap();
    let db_pid = env.status("db").await.pid;

    env.orchestrator
        .submit(ChangeCommand::Restart("api".into()))
        .unwrap();
    wait_for_restarts(&env, "api", 1).await;

    let db = env.status("db").await;
    assert_eq!(db.pid, db_pid);
    assert_eq!(db.restart_count, 0);

    env.shutdown().await;
}

#[tokio::test]
async fn test_change_ignored_for_idle_service() {
    let env = TestProject::new().service("api", &[]).start();

    env.orchestrator
        .submit(ChangeCommand::Restart("api".into()))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let api = env.status("api").await;
    assert_eq!(api.state, Pending);
    assert_eq!(api.restart_count, 0);

    env.shutdown().await;
}

#[tokio::test]
async fn test_change_during_health_check_reloads_once_running() {
    let ready_file = HealthCheckSpec::new(ProbeKind::Command, "test -f ready").with_timing(20, 10_000, 1_000);
    let project = TestProject::new().checked_service("api", &[], ready_file);
    let marker = project.root().join("api").join("ready");
    let env = project.start();

    let orchestrator = env.orchestrator.clone();
    let start = tokio::spawn(async move { orchestrator.start_all().await });
    env.wait_for_state("api", HealthChecking).await;

    env.orchestrator
        .submit(ChangeCommand::Restart("api".into()))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(env.status("api").await.restart_count, 0);

    std::fs::write(&marker, "").unwrap();
    assert!(start.await.unwrap().unwrap().all_running());
    wait_for_restarts(&env, "api", 1).await;

    // the queued change is applied exactly once
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(env.status("api").await.restart_count, 1);

    env.shutdown().await;
}

#[tokio::test]
async fn test_regenerate_restarts_schema_users() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let mut env = schema_project().start_with(Arc::clone(&pipeline));
    env.orchestrator.start_all().await.unwrap();

    env.orchestrator
        .submit(ChangeCommand::Regenerate("user".into()))
        .unwrap();

    assert_eq!(next_schema_result(&mut env).await, None);
    wait_for_restarts(&env, "api", 1).await;

    assert_eq!(pipeline.calls(), 1);
    assert_eq!(*pipeline.resources.lock().unwrap(), vec!["user".to_string()]);
    assert_eq!(env.status("web").await.restart_count, 0);

    env.shutdown().await;
}

#[tokio::test]
async fn test_failed_regeneration_restarts_nothing() {
    let pipeline = Arc::new(RecordingPipeline::failing("quicktype exploded"));
    let mut env = schema_project().start_with(Arc::clone(&pipeline));
    env.orchestrator.start_all().await.unwrap();

    env.orchestrator
        .submit(ChangeCommand::Regenerate("user".into()))
        .unwrap();

    let error = next_schema_result(&mut env).await.unwrap();
    assert!(error.contains("quicktype exploded"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let api = env.status("api").await;
    assert_eq!(api.state, Running);
    assert_eq!(api.restart_count, 0);

    env.shutdown().await;
}

#[tokio::test]
async fn test_file_burst_triggers_single_reload() {
    let env = TestProject::new().service("api", &[]).start();
    env.orchestrator.start_all().await.unwrap();

    let watcher = ChangeWatcher::spawn(
        &env.project,
        Duration::from_millis(150),
        env.orchestrator.change_sender(),
    )
    .unwrap();
    // give the backend a moment to register the watch
    tokio::time::sleep(Duration::from_millis(200)).await;

    let source = env.project.get("api").unwrap().path.join("main.py");
    for i in 0..5 {
        std::fs::write(&source, format!("print({i})\n")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    wait_for_restarts(&env, "api", 1).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(env.status("api").await.restart_count, 1);

    watcher.stop().await;
    env.shutdown().await;
}
