mod activity;
mod state;

use log::debug;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;

use crate::capability::CapabilityRegistry;
use crate::config::Settings;
use crate::domain::{FailureReason, HealthStatus, LifecycleState, Project};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, OrchestratorEvent};
use crate::schema::SchemaPipeline;

use state::OrchestratorState;

/// Work requested by the change watcher
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeCommand {
    Restart(String),
    Regenerate(String),
}

/// Snapshot of one service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub kind: String,
    pub state: LifecycleState,
    pub pid: Option<u32>,
    pub running: bool,
    pub health: Option<HealthStatus>,
    pub restart_count: u32,
    pub failure: Option<FailureReason>,
}

/// How a service ended up after a start request settled
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ServiceOutcome {
    Running,
    Failed { reason: FailureReason },
    /// Start was withdrawn (stop or shutdown) before the service came up
    NotStarted { state: LifecycleState },
}

/// Per-service outcomes of a start request, in start order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StartReport {
    pub outcomes: Vec<(String, ServiceOutcome)>,
}

impl StartReport {
    pub fn get(&self, service: &str) -> Option<&ServiceOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == service)
            .map(|(_, outcome)| outcome)
    }

    pub fn all_running(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, outcome)| *outcome == ServiceOutcome::Running)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, ServiceOutcome::Failed { .. }))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

pub(crate) enum OrchestratorCommand {
    Start {
        services: Option<Vec<String>>,
        respond_to: oneshot::Sender<Result<StartReport>>,
    },
    Stop {
        service: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    StopAll {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Restart {
        service: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Status {
        respond_to: oneshot::Sender<Vec<ServiceStatus>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to the orchestrator actor.
///
/// The actor task is the only writer of service state; every method here
/// sends a command and awaits its reply.
#[derive(Clone)]
pub struct Orchestrator {
    sender: mpsc::Sender<OrchestratorCommand>,
    changes: mpsc::UnboundedSender<ChangeCommand>,
    events: EventBus,
}

impl Orchestrator {
    /// Validate the project and spawn the actor. Must be called within a tokio runtime.
    pub fn spawn(
        project: Arc<Project>,
        registry: Arc<CapabilityRegistry>,
        pipeline: Arc<dyn SchemaPipeline>,
        settings: Settings,
    ) -> Result<Self> {
        let graph = project.validate()?;
        let events = EventBus::new(settings.event_capacity);

        let (sender, receiver) = mpsc::channel(1000);
        let (changes, change_receiver) = mpsc::unbounded_channel();

        let (state, reports) =
            OrchestratorState::new(project, graph, registry, pipeline, settings, events.clone());
        tokio::spawn(state.run(receiver, reports, change_receiver));

        Ok(Self {
            sender,
            changes,
            events,
        })
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> OrchestratorCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)?;
        rx.await.map_err(|_| OrchestratorError::ResponseLost)
    }

    /// Start every service; resolves once each one is running or has failed
    pub async fn start_all(&self) -> Result<StartReport> {
        self.request(|respond_to| OrchestratorCommand::Start {
            services: None,
            respond_to,
        })
        .await?
    }

    /// Start the named services and everything they depend on
    pub async fn start<I, S>(&self, services: I) -> Result<StartReport>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let services = services.into_iter().map(Into::into).collect();
        self.request(|respond_to| OrchestratorCommand::Start {
            services: Some(services),
            respond_to,
        })
        .await?
    }

    /// Stop one service; its dependents are left as they are
    pub async fn stop(&self, service: &str) -> Result<()> {
        self.request(|respond_to| OrchestratorCommand::Stop {
            service: service.to_string(),
            respond_to,
        })
        .await?
    }

    pub async fn stop_all(&self) -> Result<()> {
        self.request(|respond_to| OrchestratorCommand::StopAll { respond_to })
            .await?
    }

    /// Stop and start one service again; resolves once it is running or has failed
    pub async fn restart(&self, service: &str) -> Result<()> {
        self.request(|respond_to| OrchestratorCommand::Restart {
            service: service.to_string(),
            respond_to,
        })
        .await?
    }

    pub async fn status(&self) -> Result<Vec<ServiceStatus>> {
        self.request(|respond_to| OrchestratorCommand::Status { respond_to })
            .await
    }

    pub async fn service_status(&self, service: &str) -> Result<ServiceStatus> {
        self.status()
            .await?
            .into_iter()
            .find(|s| s.name == service)
            .ok_or_else(|| OrchestratorError::UnknownService(service.to_string()))
    }

    /// Cancel in-flight starts and stop every process; the actor exits afterwards
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|respond_to| OrchestratorCommand::Shutdown { respond_to })
            .await
    }

    /// Queue a watcher command; it is applied asynchronously
    pub fn submit(&self, change: ChangeCommand) -> Result<()> {
        debug!("Queueing {:?}", change);
        self.changes
            .send(change)
            .map_err(|_| OrchestratorError::ChannelClosed)
    }

    pub fn change_sender(&self) -> mpsc::UnboundedSender<ChangeCommand> {
        self.changes.clone()
    }

    pub fn subscribe(&self) -> BroadcastStream<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

/// Error a caller sees for a service that ended in `Failed`
pub(crate) fn failure_error(service: &str, reason: &FailureReason) -> OrchestratorError {
    match reason {
        FailureReason::StartFailed { cause } => OrchestratorError::StartFailed {
            service: service.to_string(),
            cause: cause.clone(),
        },
        FailureReason::HealthCheckFailed { reason } => OrchestratorError::HealthCheckFailed {
            service: service.to_string(),
            reason: reason.clone(),
        },
        FailureReason::DependencyFailed { upstream } => OrchestratorError::DependencyNotReady {
            service: service.to_string(),
            dependency: upstream.clone(),
        },
        FailureReason::UnresolvedKind { kind } => OrchestratorError::UnresolvedKind(kind.clone()),
        FailureReason::ProcessExited { .. } => OrchestratorError::StartFailed {
            service: service.to_string(),
            cause: reason.to_string(),
        },
    }
}
