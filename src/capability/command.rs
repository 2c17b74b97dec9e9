use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{Environment, LaunchSpec, Runtime};
use crate::domain::ServiceSpec;

/// Commands a service (or a binding) declares for each lifecycle hook.
///
/// Each command is either an argv array or a shell string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandSet {
    #[serde(default)]
    pub start: Option<serde_json::Value>,
    #[serde(default)]
    pub install: Option<serde_json::Value>,
    #[serde(default)]
    pub build: Option<serde_json::Value>,
    #[serde(default)]
    pub test: Option<serde_json::Value>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub env: Environment,
}

impl CommandSet {
    pub fn start(mut self, command: serde_json::Value) -> Self {
        self.start = Some(command);
        self
    }

    fn from_service(service: &ServiceSpec) -> Self {
        if service.config.is_null() {
            return Self::default();
        }
        serde_json::from_value(service.config.clone()).unwrap_or_else(|e| {
            debug!(
                "Service '{}' config is not a command set ({}); ignoring it",
                service.name, e
            );
            Self::default()
        })
    }

    /// Entries declared by the service win over the binding's defaults
    fn overlay(&self, service: &ServiceSpec) -> Self {
        let own = Self::from_service(service);
        let mut env = self.env.clone();
        env.extend(own.env);
        Self {
            start: own.start.or_else(|| self.start.clone()),
            install: own.install.or_else(|| self.install.clone()),
            build: own.build.or_else(|| self.build.clone()),
            test: own.test.or_else(|| self.test.clone()),
            framework: own.framework.or_else(|| self.framework.clone()),
            env,
        }
    }
}

/// Runtime driven entirely by declared commands.
///
/// Registered as the built-in `command` kind, and reused for named bindings
/// that supply default commands for their own kind.
#[derive(Debug, Clone)]
pub struct CommandRuntime {
    kind: String,
    defaults: CommandSet,
}

impl CommandRuntime {
    pub const KIND: &'static str = "command";

    pub fn new() -> Self {
        Self::bound(Self::KIND, CommandSet::default())
    }

    pub fn bound(kind: impl Into<String>, defaults: CommandSet) -> Self {
        Self {
            kind: kind.into(),
            defaults,
        }
    }

    async fn run_hook(&self, service: &ServiceSpec, hook: &str, command: Option<serde_json::Value>) -> Result<()> {
        match command {
            Some(command) => {
                info!("Running {} for service '{}'", hook, service.name);
                let launch = LaunchSpec::from_value(&command, &service.path)?
                    .envs(&self.environment(service));
                launch.run().await
            }
            None => {
                debug!("No {} command for service '{}'", hook, service.name);
                Ok(())
            }
        }
    }
}

impl Default for CommandRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for CommandRuntime {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn detect(&self, service: &ServiceSpec) -> Result<Option<String>> {
        Ok(self.defaults.overlay(service).framework)
    }

    async fn install(&self, service: &ServiceSpec) -> Result<()> {
        let commands = self.defaults.overlay(service);
        self.run_hook(service, "install", commands.install).await
    }

    async fn start(&self, service: &ServiceSpec, env: &Environment) -> Result<LaunchSpec> {
        let commands = self.defaults.overlay(service);
        let start = commands
            .start
            .ok_or_else(|| anyhow!("service '{}' declares no start command", service.name))?;
        Ok(LaunchSpec::from_value(&start, &service.path)?.envs(env))
    }

    async fn build(&self, service: &ServiceSpec) -> Result<()> {
        let commands = self.defaults.overlay(service);
        self.run_hook(service, "build", commands.build).await
    }

    async fn test(&self, service: &ServiceSpec) -> Result<()> {
        let commands = self.defaults.overlay(service);
        if commands.test.is_none() {
            info!("No tests configured for service '{}'", service.name);
        }
        self.run_hook(service, "test", commands.test).await
    }

    fn environment(&self, service: &ServiceSpec) -> Environment {
        self.defaults.overlay(service).env
    }
}
