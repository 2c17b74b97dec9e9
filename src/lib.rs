pub mod capability;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod health;
pub mod manifest;
pub mod orchestrator;
pub mod schema;
pub mod supervisor;
pub mod watcher;

pub use capability::{CapabilityRegistry, Runtime, SchemaCompiler};
pub use config::Settings;
pub use domain::{DependencyGraph, FailureReason, LifecycleState, Project, ServiceSpec};
pub use error::{ConfigurationError, OrchestratorError};
pub use events::{EventBus, EventKind, OrchestratorEvent};
pub use manifest::{load_manifest, Manifest};
pub use orchestrator::{ChangeCommand, Orchestrator, ServiceOutcome, ServiceStatus, StartReport};
pub use schema::{DefaultSchemaPipeline, SchemaPipeline};
pub use watcher::ChangeWatcher;

/// Quiet period a changed target must observe before it is reloaded
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
