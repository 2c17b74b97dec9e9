use thiserror::Error;

use crate::domain::LifecycleState;

/// Problems with the declared project that abort orchestration before any process starts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Service '{service}' depends on unknown service '{missing}'")]
    UnknownDependency { service: String, missing: String },

    #[error("Service '{0}' is declared more than once")]
    DuplicateService(String),
}

/// Errors returned by orchestrator, supervisor and registry operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Service '{service}' failed to start: {cause}")]
    StartFailed { service: String, cause: String },

    #[error("Service '{service}' failed its health check: {reason}")]
    HealthCheckFailed { service: String, reason: String },

    #[error("Service '{service}' cannot restart: dependency '{dependency}' is not running")]
    DependencyNotReady { service: String, dependency: String },

    #[error("Service '{0}' already has a live process")]
    AlreadyRunning(String),

    #[error("Service '{0}' is not running")]
    NotRunning(String),

    #[error("No capability registered for kind '{0}'")]
    UnresolvedKind(String),

    #[error("Service '{service}' cannot move from {from} to {to}")]
    InvalidTransition {
        service: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Orchestrator channel closed")]
    ChannelClosed,

    #[error("Orchestrator response lost")]
    ResponseLost,
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
