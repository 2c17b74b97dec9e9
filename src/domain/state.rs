use serde::Serialize;
use std::fmt;

/// Per-service lifecycle state, driven only by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Starting,
    HealthChecking,
    Running,
    Stopping,
    Stopped,
    Restarting,
    Failed,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Failed)
                | (Starting, HealthChecking)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (HealthChecking, Running)
                | (HealthChecking, Failed)
                | (HealthChecking, Stopping)
                | (Running, Stopping)
                | (Running, Restarting)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Restarting, Starting)
                | (Restarting, Stopping)
                | (Restarting, Failed)
                | (Stopped, Starting)
                | (Stopped, Failed)
                | (Failed, Starting)
        )
    }

    /// Starting, health checking, stopping or restarting: an activity owns the service
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            LifecycleState::Starting
                | LifecycleState::HealthChecking
                | LifecycleState::Stopping
                | LifecycleState::Restarting
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Starting => "starting",
            LifecycleState::HealthChecking => "health_checking",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Restarting => "restarting",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a service ended up in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    StartFailed { cause: String },
    HealthCheckFailed { reason: String },
    DependencyFailed { upstream: String },
    UnresolvedKind { kind: String },
    ProcessExited { code: Option<i32> },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StartFailed { cause } => write!(f, "start failed: {cause}"),
            FailureReason::HealthCheckFailed { reason } => {
                write!(f, "health check failed: {reason}")
            }
            FailureReason::DependencyFailed { upstream } => {
                write!(f, "dependency '{upstream}' failed")
            }
            FailureReason::UnresolvedKind { kind } => {
                write!(f, "no capability for kind '{kind}'")
            }
            FailureReason::ProcessExited { code: Some(code) } => {
                write!(f, "process exited with code {code}")
            }
            FailureReason::ProcessExited { code: None } => {
                write!(f, "process terminated by signal")
            }
        }
    }
}
