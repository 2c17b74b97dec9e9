mod handle;
pub mod output;

use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tokio::time::Duration;
use uuid::Uuid;

use crate::capability::LaunchSpec;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, LogStream};

pub use handle::{ProcessExit, ProcessHandle};

/// Spawns service processes, captures their output and terminates them.
///
/// At most one live process is tracked per service name.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    live: Arc<DashMap<String, ProcessHandle>>,
    events: EventBus,
}

impl ProcessSupervisor {
    pub fn new(events: EventBus) -> Self {
        Self {
            live: Arc::new(DashMap::new()),
            events,
        }
    }

    pub async fn start(&self, service: &str, launch: &LaunchSpec) -> Result<ProcessHandle> {
        if self.is_running(service) {
            return Err(OrchestratorError::AlreadyRunning(service.to_string()));
        }

        let mut cmd = launch.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own process group so termination reaches shell-spawned children too
        #[cfg(unix)]
        cmd.process_group(0);

        debug!("Spawning '{}': {}", service, launch.display());

        let mut child = cmd.spawn().map_err(|e| OrchestratorError::StartFailed {
            service: service.to_string(),
            cause: format!("{}: {e}", launch.display()),
        })?;
        let pid = child.id();
        info!("Process for service '{}' started: PID {:?}", service, pid);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(output::capture_lines(
                service.to_string(),
                stdout,
                LogStream::Stdout,
                self.events.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(output::capture_lines(
                service.to_string(),
                stderr,
                LogStream::Stderr,
                self.events.clone(),
            ));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        let handle = ProcessHandle::new(service.to_string(), pid, exit_rx, Arc::clone(&kill));
        self.live.insert(service.to_string(), handle.clone());

        tokio::spawn(Self::monitor(
            service.to_string(),
            handle.id,
            child,
            kill,
            exit_tx,
            Arc::clone(&self.live),
        ));

        Ok(handle)
    }

    /// Own the child until it exits, then publish the exit to every handle clone
    async fn monitor(
        service: String,
        id: Uuid,
        mut child: Child,
        kill: Arc<Notify>,
        exit_tx: watch::Sender<Option<ProcessExit>>,
        live: Arc<DashMap<String, ProcessHandle>>,
    ) {
        let pid = child.id();
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill.notified() => {
                warn!("Force-killing service '{}' (PID {:?})", service, pid);
                if let Some(pid) = pid {
                    signal_group(pid, "KILL").await;
                }
                if let Err(e) = child.start_kill() {
                    debug!("Kill of '{}' failed, process likely gone: {}", service, e);
                }
                child.wait().await
            }
        };

        let exit = match status {
            Ok(status) => ProcessExit { code: status.code() },
            Err(e) => {
                error!("Failed to wait for process of '{}': {}", service, e);
                ProcessExit { code: None }
            }
        };
        info!("Process for service '{}' exited: code={:?}", service, exit.code);

        live.remove_if(&service, |_, handle| handle.id == id);
        let _ = exit_tx.send(Some(exit));
    }

    /// Terminate gracefully, escalating to a forced kill after `grace`.
    /// Stopping an already-exited process just reports its exit.
    pub async fn stop(&self, handle: &ProcessHandle, grace: Duration) -> ProcessExit {
        if let Some(exit) = handle.exit_status() {
            return exit;
        }

        info!("Stopping service '{}' (PID {:?})", handle.service, handle.pid);
        let signalled = match handle.pid {
            Some(pid) => signal_group(pid, "TERM").await,
            None => false,
        };

        if signalled {
            match tokio::time::timeout(grace, handle.wait()).await {
                Ok(exit) => return exit,
                Err(_) => warn!(
                    "Service '{}' did not exit within {:?} of SIGTERM",
                    handle.service, grace
                ),
            }
        } else if handle.is_running() {
            warn!(
                "Could not deliver SIGTERM to service '{}'; killing without a grace period",
                handle.service
            );
        }

        handle.force_kill();
        handle.wait().await
    }

    pub async fn stop_service(&self, service: &str, grace: Duration) -> Result<ProcessExit> {
        let handle = self
            .handle(service)
            .ok_or_else(|| OrchestratorError::NotRunning(service.to_string()))?;
        Ok(self.stop(&handle, grace).await)
    }

    pub async fn stop_all(&self, grace: Duration) {
        let handles: Vec<ProcessHandle> = self.live.iter().map(|e| e.value().clone()).collect();
        if handles.is_empty() {
            return;
        }
        info!("Stopping {} supervised processes", handles.len());
        join_all(handles.iter().map(|h| self.stop(h, grace))).await;
    }

    pub fn handle(&self, service: &str) -> Option<ProcessHandle> {
        self.live
            .get(service)
            .map(|e| e.value().clone())
            .filter(ProcessHandle::is_running)
    }

    pub fn is_running(&self, service: &str) -> bool {
        self.handle(service).is_some()
    }

    pub fn running_count(&self) -> usize {
        self.live.iter().filter(|e| e.value().is_running()).count()
    }
}

/// Deliver a signal to a process group via `kill`
#[cfg(unix)]
async fn signal_group(pid: u32, signal: &str) -> bool {
    let status = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) => status.success(),
        Err(e) => {
            warn!("Failed to run `kill` for SIG{} to {}: {}", signal, pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
async fn signal_group(_pid: u32, _signal: &str) -> bool {
    false
}
