//! Shared fixtures: throwaway projects of shell-command services.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

use lychee::capability::CapabilityRegistry;
use lychee::domain::{HealthCheckSpec, LifecycleState, ProbeKind, Project, ServiceSpec};
use lychee::{EventKind, Orchestrator, OrchestratorEvent, SchemaPipeline, ServiceStatus, Settings};

/// Settings with short timings so failures surface quickly
pub fn fast_settings() -> Settings {
    Settings {
        grace_period_ms: 1_000,
        debounce_ms: 50,
        health_interval_ms: 20,
        health_timeout_ms: 2_000,
        health_max_attempts: 5,
        ..Default::default()
    }
}

/// Health check that runs a shell command in the service directory
pub fn command_check(command: &str) -> HealthCheckSpec {
    HealthCheckSpec::new(ProbeKind::Command, command).with_timing(20, 2_000, 5)
}

/// Health check that never passes within its budget
pub fn failing_check() -> HealthCheckSpec {
    HealthCheckSpec::new(ProbeKind::Command, "exit 1").with_timing(20, 500, 3)
}

/// Builder for a project rooted in a temporary directory
pub struct TestProject {
    dir: TempDir,
    root: PathBuf,
    services: Vec<ServiceSpec>,
}

impl TestProject {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        Self {
            dir,
            root,
            services: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Service that runs `sleep 30` and depends on `deps`
    pub fn service(self, name: &str, deps: &[&str]) -> Self {
        self.command_service(name, deps, json!(["sleep", "30"]), None)
    }

    pub fn checked_service(self, name: &str, deps: &[&str], check: HealthCheckSpec) -> Self {
        self.command_service(name, deps, json!(["sleep", "30"]), Some(check))
    }

    pub fn command_service(
        mut self,
        name: &str,
        deps: &[&str],
        start: serde_json::Value,
        check: Option<HealthCheckSpec>,
    ) -> Self {
        let path = self.root.join(name);
        std::fs::create_dir_all(&path).unwrap();
        let mut spec = ServiceSpec::new(name, path, "command")
            .depends_on(deps.iter().copied())
            .with_config(json!({ "start": start }));
        if let Some(check) = check {
            spec = spec.with_health_check(check);
        }
        self.services.push(spec);
        self
    }

    /// Add a fully custom spec; its directory is created if missing
    pub fn spec(mut self, spec: ServiceSpec) -> Self {
        std::fs::create_dir_all(&spec.path).unwrap();
        self.services.push(spec);
        self
    }

    pub fn build(&self) -> Arc<Project> {
        let project = self
            .services
            .iter()
            .cloned()
            .try_fold(Project::new(&self.root), |project, spec| project.with_service(spec))
            .unwrap();
        Arc::new(project)
    }

    pub fn start(self) -> TestEnvironment {
        self.start_with(Arc::new(RecordingPipeline::default()))
    }

    pub fn start_with(self, pipeline: Arc<RecordingPipeline>) -> TestEnvironment {
        let project = self.build();
        let orchestrator = Orchestrator::spawn(
            Arc::clone(&project),
            Arc::new(CapabilityRegistry::builtin()),
            pipeline.clone(),
            fast_settings(),
        )
        .unwrap();
        let events = orchestrator.events().receiver();

        TestEnvironment {
            orchestrator,
            project,
            pipeline,
            events,
            _dir: self.dir,
        }
    }
}

/// A running orchestrator plus the fixtures it depends on
pub struct TestEnvironment {
    pub orchestrator: Orchestrator,
    pub project: Arc<Project>,
    pub pipeline: Arc<RecordingPipeline>,
    pub events: broadcast::Receiver<OrchestratorEvent>,
    _dir: TempDir,
}

impl TestEnvironment {
    pub async fn status(&self, service: &str) -> ServiceStatus {
        self.orchestrator.service_status(service).await.unwrap()
    }

    pub async fn state(&self, service: &str) -> LifecycleState {
        self.status(service).await.state
    }

    /// Poll until the service reaches `state`
    pub async fn wait_for_state(&self, service: &str, state: LifecycleState) -> ServiceStatus {
        let orchestrator = &self.orchestrator;
        crate::integration::poll_until(Duration::from_secs(10), Duration::from_millis(20), || async move {
            orchestrator
                .service_status(service)
                .await
                .ok()
                .filter(|status| status.state == state)
        })
        .await
        .unwrap_or_else(|| panic!("service '{service}' never reached {state}"))
    }

    /// Drain buffered events, returning the state transitions in order
    pub fn transitions(&mut self) -> Vec<(String, LifecycleState)> {
        let mut transitions = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let EventKind::StateChanged { service, to, .. } = event.kind {
                transitions.push((service, to));
            }
        }
        transitions
    }

    pub async fn shutdown(self) {
        self.orchestrator.shutdown().await.unwrap();
    }
}

/// Position of the first `(service, state)` transition
pub fn position(transitions: &[(String, LifecycleState)], service: &str, state: LifecycleState) -> usize {
    transitions
        .iter()
        .position(|(s, to)| s == service && *to == state)
        .unwrap_or_else(|| panic!("no transition of '{service}' to {state} in {transitions:?}"))
}

/// Schema pipeline that records regenerated resources
#[derive(Default)]
pub struct RecordingPipeline {
    pub calls: AtomicUsize,
    pub resources: Mutex<Vec<String>>,
    pub fail_with: Mutex<Option<String>>,
}

impl RecordingPipeline {
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Mutex::new(Some(message.to_string())),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchemaPipeline for RecordingPipeline {
    async fn regenerate(&self, resource: &str) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.resources.lock().unwrap().push(resource.to_string());
        match self.fail_with.lock().unwrap().clone() {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }
}

/// Whether a pid still refers to a live process
pub fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
