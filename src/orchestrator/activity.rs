use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

use crate::capability::{Environment, Runtime};
use crate::domain::{FailureReason, HealthStatus, ServiceSpec};
use crate::error::OrchestratorError;
use crate::health::HealthChecker;
use crate::supervisor::{ProcessExit, ProcessHandle, ProcessSupervisor};

/// Progress reported back to the orchestrator by spawned activities
#[derive(Debug)]
pub(crate) enum Report {
    Launched {
        service: String,
        attempt: Uuid,
        handle: ProcessHandle,
    },
    Healthy {
        service: String,
        attempt: Uuid,
    },
    StartFailed {
        service: String,
        attempt: Uuid,
        reason: FailureReason,
    },
    Exited {
        service: String,
        handle_id: Uuid,
        exit: ProcessExit,
    },
    Stopped {
        service: String,
    },
    Regenerated {
        resource: String,
        result: Result<(), String>,
    },
}

/// In-flight start of one service
pub(crate) struct Activity {
    pub attempt: Uuid,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Activity {
    /// Cancel and wait until the task has let go of everything it started
    pub async fn cancel(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!("Start activity ended abnormally: {}", e);
            }
        }
    }
}

/// Everything a start needs, detached from orchestrator state
pub(crate) struct StartActivity {
    pub spec: Arc<ServiceSpec>,
    pub attempt: Uuid,
    pub runtime: Arc<dyn Runtime>,
    pub env: Environment,
    pub install: bool,
    pub grace: Duration,
    pub supervisor: ProcessSupervisor,
    pub health: HealthChecker,
    pub reports: mpsc::UnboundedSender<Report>,
}

impl StartActivity {
    pub fn spawn(self) -> Activity {
        let attempt = self.attempt;
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let service = self.spec.name.clone();
            let reports = self.reports.clone();

            tokio::select! {
                _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
                    debug!("Start of service '{}' cancelled", service);
                }
                outcome = self.run() => {
                    let report = match outcome {
                        Ok(()) => Report::Healthy { service, attempt },
                        Err(reason) => Report::StartFailed { service, attempt, reason },
                    };
                    let _ = reports.send(report);
                }
            }
        });

        Activity {
            attempt,
            cancel: cancel_tx,
            task,
        }
    }

    async fn run(&self) -> Result<(), FailureReason> {
        let name = &self.spec.name;

        if self.install {
            self.runtime
                .install(&self.spec)
                .await
                .map_err(|e| FailureReason::StartFailed {
                    cause: format!("install failed: {e:#}"),
                })?;
        }

        let launch = self
            .runtime
            .start(&self.spec, &self.env)
            .await
            .map_err(|e| FailureReason::StartFailed {
                cause: format!("{e:#}"),
            })?;

        let handle = self
            .supervisor
            .start(name, &launch)
            .await
            .map_err(|e| FailureReason::StartFailed {
                cause: match e {
                    OrchestratorError::StartFailed { cause, .. } => cause,
                    other => other.to_string(),
                },
            })?;

        let _ = self.reports.send(Report::Launched {
            service: name.clone(),
            attempt: self.attempt,
            handle: handle.clone(),
        });

        let status = tokio::select! {
            status = self.health.wait_until_healthy(name, self.spec.health_check.as_ref(), &self.spec.path) => status,
            exit = handle.wait() => HealthStatus::Unhealthy {
                reason: format!("process exited during health check (code {:?})", exit.code),
            },
        };

        match status {
            HealthStatus::Healthy => Ok(()),
            HealthStatus::Unhealthy { reason } => {
                self.supervisor.stop(&handle, self.grace).await;
                Err(FailureReason::HealthCheckFailed { reason })
            }
        }
    }
}

/// Report the exit of a launched process
pub(crate) fn watch_exit(handle: ProcessHandle, reports: mpsc::UnboundedSender<Report>) {
    tokio::spawn(async move {
        let exit = handle.wait().await;
        let _ = reports.send(Report::Exited {
            service: handle.service.clone(),
            handle_id: handle.id,
            exit,
        });
    });
}

/// Stop one service: cancel its start, run the capability's stop hook, terminate the process
pub(crate) fn spawn_stop(
    spec: Arc<ServiceSpec>,
    start: Option<Activity>,
    runtime: Option<Arc<dyn Runtime>>,
    supervisor: ProcessSupervisor,
    grace: Duration,
    reports: mpsc::UnboundedSender<Report>,
) {
    tokio::spawn(async move {
        if let Some(activity) = start {
            activity.cancel().await;
        }

        if let Some(runtime) = runtime {
            if let Err(e) = runtime.stop(&spec).await {
                warn!("Stop hook for service '{}' failed: {:#}", spec.name, e);
            }
        }

        match supervisor.stop_service(&spec.name, grace).await {
            Ok(exit) => debug!("Service '{}' stopped (code {:?})", spec.name, exit.code),
            Err(_) => debug!("Service '{}' had no live process", spec.name),
        }

        let _ = reports.send(Report::Stopped {
            service: spec.name.clone(),
        });
    });
}
