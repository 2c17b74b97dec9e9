use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{FailureReason, LifecycleState};
use crate::supervisor::ProcessHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Http,
    Tcp,
    Command,
}

/// Readiness probe declared by a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub probe: ProbeKind,
    pub target: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    30
}

impl HealthCheckSpec {
    pub fn new(probe: ProbeKind, target: impl Into<String>) -> Self {
        Self {
            probe,
            target: target.into(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
        }
    }

    pub fn with_timing(mut self, interval_ms: u64, timeout_ms: u64, max_attempts: u32) -> Self {
        self.interval_ms = interval_ms;
        self.timeout_ms = timeout_ms;
        self.max_attempts = max_attempts;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Declared, immutable description of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub path: PathBuf,
    pub kind: String,
    /// Opaque payload handed to the capability
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub depends_on_schemas: Vec<String>,
    #[serde(default)]
    pub schemas_mount_dir: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: kind.into(),
            config: serde_json::Value::Null,
            depends_on: Vec::new(),
            depends_on_schemas: Vec::new(),
            schemas_mount_dir: None,
            environment: BTreeMap::new(),
            health_check: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_health_check(mut self, spec: HealthCheckSpec) -> Self {
        self.health_check = Some(spec);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_schemas<I, S>(mut self, resources: I, mount_dir: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on_schemas = resources.into_iter().map(Into::into).collect();
        self.schemas_mount_dir = mount_dir.map(str::to_string);
        self
    }

    /// Look up a string entry in the config payload
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

/// Orchestrator-owned runtime record of a service
#[derive(Debug, Clone)]
pub struct Service {
    pub spec: Arc<ServiceSpec>,
    pub state: LifecycleState,
    pub process: Option<ProcessHandle>,
    pub last_health: Option<HealthStatus>,
    pub restart_count: u32,
    pub failure: Option<FailureReason>,
}

impl Service {
    pub fn new(spec: Arc<ServiceSpec>) -> Self {
        Self {
            spec,
            state: LifecycleState::Pending,
            process: None,
            last_health: None,
            restart_count: 0,
            failure: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }
}
