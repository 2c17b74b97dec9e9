pub mod graph;
pub mod project;
pub mod service;
pub mod state;

pub use graph::DependencyGraph;
pub use project::{Project, SchemaSettings};
pub use service::{HealthCheckSpec, HealthStatus, ProbeKind, Service, ServiceSpec};
pub use state::{FailureReason, LifecycleState};
