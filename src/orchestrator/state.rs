use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::activity::{self, Activity, Report, StartActivity};
use super::{failure_error, ChangeCommand, OrchestratorCommand, ServiceOutcome, ServiceStatus, StartReport};
use crate::capability::CapabilityRegistry;
use crate::config::Settings;
use crate::domain::{
    DependencyGraph, FailureReason, HealthStatus, LifecycleState, Project, Service,
};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, EventKind};
use crate::health::HealthChecker;
use crate::schema::SchemaPipeline;
use crate::supervisor::ProcessSupervisor;

use LifecycleState::*;

/// Callers parked until the services they asked about settle
enum Waiter {
    Start {
        targets: Vec<String>,
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
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Single writer over every service's lifecycle state
pub(super) struct OrchestratorState {
    project: Arc<Project>,
    graph: DependencyGraph,
    order: Vec<String>,
    services: HashMap<String, Service>,
    registry: Arc<CapabilityRegistry>,
    pipeline: Arc<dyn SchemaPipeline>,
    supervisor: ProcessSupervisor,
    health: HealthChecker,
    events: EventBus,
    settings: Settings,
    reports: mpsc::UnboundedSender<Report>,
    activities: HashMap<String, Activity>,
    /// Services asked to start that are waiting on their dependencies
    requested: HashSet<String>,
    restart_after_stop: HashSet<String>,
    /// Changes seen mid-transition, replayed once the service is running
    pending_reload: HashSet<String>,
    waiters: Vec<Waiter>,
    shutting_down: bool,
    finished: bool,
}

impl OrchestratorState {
    pub fn new(
        project: Arc<Project>,
        graph: DependencyGraph,
        registry: Arc<CapabilityRegistry>,
        pipeline: Arc<dyn SchemaPipeline>,
        settings: Settings,
        events: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<Report>) {
        let (reports, report_receiver) = mpsc::unbounded_channel();
        let services = project
            .services()
            .map(|spec| (spec.name.clone(), Service::new(Arc::clone(spec))))
            .collect();

        let state = Self {
            order: graph.start_order(),
            project,
            graph,
            services,
            registry,
            pipeline,
            supervisor: ProcessSupervisor::new(events.clone()),
            health: HealthChecker::new(),
            events,
            settings,
            reports,
            activities: HashMap::new(),
            requested: HashSet::new(),
            restart_after_stop: HashSet::new(),
            pending_reload: HashSet::new(),
            waiters: Vec::new(),
            shutting_down: false,
            finished: false,
        };
        (state, report_receiver)
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<OrchestratorCommand>,
        mut reports: mpsc::UnboundedReceiver<Report>,
        mut changes: mpsc::UnboundedReceiver<ChangeCommand>,
    ) {
        info!("Orchestrator started with {} services", self.services.len());

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            info!("Orchestrator command channel closed");
                            break;
                        }
                    }
                }
                Some(report) = reports.recv() => self.handle_report(report),
                Some(change) = changes.recv() => self.handle_change(change),
            }

            self.settle_waiters();
            if self.finished {
                break;
            }
        }

        self.supervisor.stop_all(self.settings.grace_period()).await;
        info!("Orchestrator stopped");
    }

    fn handle_command(&mut self, command: OrchestratorCommand) {
        match command {
            OrchestratorCommand::Start {
                services,
                respond_to,
            } => {
                if self.shutting_down {
                    let _ = respond_to.send(Err(OrchestratorError::ChannelClosed));
                    return;
                }
                match self.start_targets(services) {
                    Ok(targets) => {
                        info!("Starting {} services: {:?}", targets.len(), targets);
                        for target in &targets {
                            self.request_start(target);
                        }
                        self.schedule();
                        self.waiters.push(Waiter::Start {
                            targets,
                            respond_to,
                        });
                    }
                    Err(e) => {
                        let _ = respond_to.send(Err(e));
                    }
                }
            }
            OrchestratorCommand::Stop {
                service,
                respond_to,
            } => match self.stop_service(&service) {
                Ok(()) => self.waiters.push(Waiter::Stop {
                    service,
                    respond_to,
                }),
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                }
            },
            OrchestratorCommand::StopAll { respond_to } => {
                self.stop_everything();
                self.waiters.push(Waiter::StopAll { respond_to });
            }
            OrchestratorCommand::Restart {
                service,
                respond_to,
            } => match self.restart(&service) {
                Ok(()) => self.waiters.push(Waiter::Restart {
                    service,
                    respond_to,
                }),
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                }
            },
            OrchestratorCommand::Status { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            OrchestratorCommand::Shutdown { respond_to } => {
                info!("Orchestrator shutting down");
                self.shutting_down = true;
                self.stop_everything();
                self.waiters.push(Waiter::Shutdown { respond_to });
            }
        }
    }

    fn handle_report(&mut self, report: Report) {
        match report {
            Report::Launched {
                service,
                attempt,
                handle,
            } => {
                if !self.is_current(&service, attempt) || self.state_of(&service) != Starting {
                    debug!("Ignoring stale launch of '{}'", service);
                    return;
                }
                activity::watch_exit(handle.clone(), self.reports.clone());
                if let Some(record) = self.services.get_mut(&service) {
                    record.process = Some(handle);
                }
                self.transition(&service, HealthChecking, None);
            }
            Report::Healthy { service, attempt } => {
                if !self.is_current(&service, attempt) {
                    return;
                }
                self.activities.remove(&service);
                if let Some(record) = self.services.get_mut(&service) {
                    record.last_health = Some(HealthStatus::Healthy);
                }
                if self.transition(&service, Running, None) {
                    // the exit report may have overtaken the health report
                    let exited = self
                        .services
                        .get(&service)
                        .and_then(|s| s.process.as_ref())
                        .and_then(|h| h.exit_status());
                    if let Some(exit) = exited {
                        self.fail(&service, FailureReason::ProcessExited { code: exit.code });
                    } else if self.pending_reload.remove(&service) {
                        info!("Applying change to '{}' queued while it was starting", service);
                        if let Err(e) = self.restart(&service) {
                            warn!("Skipping reload of '{}': {}", service, e);
                        }
                    }
                }
                self.schedule();
            }
            Report::StartFailed {
                service,
                attempt,
                reason,
            } => {
                if !self.is_current(&service, attempt) {
                    return;
                }
                self.activities.remove(&service);
                if let FailureReason::HealthCheckFailed { reason } = &reason {
                    if let Some(record) = self.services.get_mut(&service) {
                        record.last_health = Some(HealthStatus::Unhealthy {
                            reason: reason.clone(),
                        });
                    }
                }
                self.fail(&service, reason);
                self.schedule();
            }
            Report::Exited {
                service,
                handle_id,
                exit,
            } => {
                let Some(record) = self.services.get(&service) else {
                    return;
                };
                let current = record.process.as_ref().map(|h| h.id) == Some(handle_id);
                if current && record.state == Running {
                    warn!("Service '{}' exited unexpectedly (code {:?})", service, exit.code);
                    self.fail(&service, FailureReason::ProcessExited { code: exit.code });
                    self.schedule();
                }
            }
            Report::Stopped { service } => {
                let state = self.state_of(&service);
                if self.restart_after_stop.remove(&service) && state == Restarting {
                    if let Some(record) = self.services.get_mut(&service) {
                        record.process = None;
                    }
                    self.launch(&service);
                } else if state == Stopping {
                    self.transition(&service, Stopped, None);
                }
                self.schedule();
            }
            Report::Regenerated { resource, result } => {
                self.events.publish(EventKind::SchemaRegenerated {
                    resource: resource.clone(),
                    error: result.as_ref().err().cloned(),
                });
                match result {
                    Ok(()) => {
                        for service in self.project.services_using_schema(&resource) {
                            match self.state_of(&service) {
                                Running => {}
                                Starting | HealthChecking | Restarting => {
                                    self.pending_reload.insert(service);
                                    continue;
                                }
                                _ => continue,
                            }
                            if let Err(e) = self.restart(&service) {
                                warn!("Could not restart '{}' after regenerating '{}': {}", service, resource, e);
                            }
                        }
                    }
                    Err(e) => error!("Regenerating schema '{}' failed: {}", resource, e),
                }
            }
        }
    }

    fn handle_change(&mut self, change: ChangeCommand) {
        if self.shutting_down {
            return;
        }
        match change {
            ChangeCommand::Restart(service) => match self.services.get(&service).map(|s| s.state) {
                Some(Running) | Some(Failed) => {
                    info!("Change detected in '{}', restarting", service);
                    if let Err(e) = self.restart(&service) {
                        warn!("Skipping reload of '{}': {}", service, e);
                    }
                }
                Some(state @ (Starting | HealthChecking | Restarting)) => {
                    debug!("Change in '{}' while {}, reloading once it is running", service, state);
                    self.pending_reload.insert(service);
                }
                Some(state) => debug!("Ignoring change in '{}' while {}", service, state),
                None => debug!("Ignoring change for unknown service '{}'", service),
            },
            ChangeCommand::Regenerate(resource) => {
                info!("Schema '{}' changed, regenerating", resource);
                let pipeline = Arc::clone(&self.pipeline);
                let reports = self.reports.clone();
                tokio::spawn(async move {
                    let result = pipeline
                        .regenerate(&resource)
                        .await
                        .map_err(|e| format!("{e:#}"));
                    let _ = reports.send(Report::Regenerated { resource, result });
                });
            }
        }
    }

    /// Named services plus their dependency closure, in start order
    fn start_targets(&self, services: Option<Vec<String>>) -> Result<Vec<String>> {
        let Some(names) = services else {
            return Ok(self.order.clone());
        };

        let mut wanted = HashSet::new();
        for name in names {
            if !self.services.contains_key(&name) {
                return Err(OrchestratorError::UnknownService(name));
            }
            wanted.extend(self.graph.dependency_closure(&name));
            wanted.insert(name);
        }
        Ok(self
            .order
            .iter()
            .filter(|name| wanted.contains(*name))
            .cloned()
            .collect())
    }

    fn request_start(&mut self, name: &str) {
        if matches!(self.state_of(name), Pending | Stopped | Failed | Stopping) {
            self.requested.insert(name.to_string());
        }
    }

    /// Launch every requested service whose dependencies are all running;
    /// fail those that can no longer start because a dependency is down
    fn schedule(&mut self) {
        for name in self.order.clone() {
            if !self.requested.contains(&name) || self.state_of(&name) == Stopping {
                continue;
            }
            if let Some(upstream) = self.blocked_by(&name) {
                self.requested.remove(&name);
                self.fail(&name, FailureReason::DependencyFailed { upstream });
            } else if self
                .graph
                .dependencies(&name)
                .iter()
                .all(|dep| self.state_of(dep) == Running)
            {
                self.launch(&name);
            }
        }
    }

    /// Root cause that prevents `name` from ever becoming eligible
    fn blocked_by(&self, name: &str) -> Option<String> {
        for dep in self.graph.dependencies(name) {
            let Some(record) = self.services.get(&dep) else {
                continue;
            };
            match record.state {
                Failed if !self.requested.contains(&dep) => {
                    return Some(match &record.failure {
                        Some(FailureReason::DependencyFailed { upstream }) => upstream.clone(),
                        _ => dep,
                    });
                }
                Pending | Stopped if !self.requested.contains(&dep) => return Some(dep),
                _ => {}
            }
        }
        None
    }

    fn launch(&mut self, name: &str) {
        self.requested.remove(name);
        let Some(spec) = self.services.get(name).map(|s| Arc::clone(&s.spec)) else {
            return;
        };

        let runtime = match self.registry.resolve(&spec.kind) {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Cannot start '{}': {}", name, e);
                self.fail(name, FailureReason::UnresolvedKind {
                    kind: spec.kind.clone(),
                });
                return;
            }
        };
        if !self.transition(name, Starting, None) {
            return;
        }

        let mut env = runtime.environment(&spec);
        env.extend(self.project.environment.clone());
        env.extend(spec.environment.clone());

        let activity = StartActivity {
            attempt: Uuid::new_v4(),
            spec,
            runtime,
            env,
            install: self.settings.install_before_start,
            grace: self.settings.grace_period(),
            supervisor: self.supervisor.clone(),
            health: self.health.clone(),
            reports: self.reports.clone(),
        }
        .spawn();
        self.activities.insert(name.to_string(), activity);
    }

    fn stop_service(&mut self, name: &str) -> Result<()> {
        let state = self
            .services
            .get(name)
            .map(|s| s.state)
            .ok_or_else(|| OrchestratorError::UnknownService(name.to_string()))?;
        let withdrawn = self.requested.remove(name);

        match state {
            Running | Starting | HealthChecking => {
                self.transition(name, Stopping, None);
                self.spawn_stop(name);
                Ok(())
            }
            Restarting => {
                self.restart_after_stop.remove(name);
                self.transition(name, Stopping, None);
                Ok(())
            }
            Stopping => {
                self.restart_after_stop.remove(name);
                Ok(())
            }
            Pending | Stopped | Failed if withdrawn => Ok(()),
            Pending | Stopped | Failed => Err(OrchestratorError::NotRunning(name.to_string())),
        }
    }

    fn stop_everything(&mut self) {
        self.requested.clear();
        for name in self.order.clone() {
            if !matches!(self.state_of(&name), Pending | Stopped | Failed) {
                let _ = self.stop_service(&name);
            }
        }
    }

    fn spawn_stop(&mut self, name: &str) {
        let Some(spec) = self.services.get(name).map(|s| Arc::clone(&s.spec)) else {
            return;
        };
        let start = self.activities.remove(name);
        let runtime = self.registry.resolve(&spec.kind).ok();
        activity::spawn_stop(
            spec,
            start,
            runtime,
            self.supervisor.clone(),
            self.settings.grace_period(),
            self.reports.clone(),
        );
    }

    fn restart(&mut self, name: &str) -> Result<()> {
        if self.shutting_down {
            return Err(OrchestratorError::ChannelClosed);
        }
        let state = self
            .services
            .get(name)
            .map(|s| s.state)
            .ok_or_else(|| OrchestratorError::UnknownService(name.to_string()))?;

        if state.is_transitional() {
            return Err(OrchestratorError::InvalidTransition {
                service: name.to_string(),
                from: state,
                to: Restarting,
            });
        }
        if let Some(dep) = self
            .graph
            .dependencies(name)
            .into_iter()
            .find(|dep| self.state_of(dep) != Running)
        {
            return Err(OrchestratorError::DependencyNotReady {
                service: name.to_string(),
                dependency: dep,
            });
        }

        self.requested.remove(name);
        if let Some(record) = self.services.get_mut(name) {
            record.restart_count += 1;
        }

        if state == Running {
            self.transition(name, Restarting, None);
            self.restart_after_stop.insert(name.to_string());
            self.spawn_stop(name);
        } else {
            self.launch(name);
        }
        Ok(())
    }

    fn fail(&mut self, name: &str, reason: FailureReason) {
        if let Some(record) = self.services.get_mut(name).filter(|r| r.state == Failed) {
            debug!("Service '{}' still failed: {}", name, reason);
            record.failure = Some(reason);
            return;
        }
        self.transition(name, Failed, Some(reason));
    }

    fn transition(&mut self, name: &str, to: LifecycleState, failure: Option<FailureReason>) -> bool {
        let Some(record) = self.services.get_mut(name) else {
            return false;
        };
        let from = record.state;
        if !from.can_transition_to(to) {
            error!("Rejected transition of '{}' from {} to {}", name, from, to);
            return false;
        }

        record.state = to;
        match to {
            Failed => record.failure = failure.clone(),
            Starting => {
                record.failure = None;
                record.last_health = None;
            }
            _ => {}
        }
        if matches!(to, Stopped | Failed) {
            record.process = None;
        }
        if matches!(to, Stopping | Stopped | Failed) {
            self.pending_reload.remove(name);
        }

        match &failure {
            Some(reason) => warn!("Service '{}': {} -> {} ({})", name, from, to, reason),
            None => info!("Service '{}': {} -> {}", name, from, to),
        }
        self.events.publish(EventKind::StateChanged {
            service: name.to_string(),
            from,
            to,
            failure,
        });
        true
    }

    fn state_of(&self, name: &str) -> LifecycleState {
        self.services.get(name).map_or(Pending, |s| s.state)
    }

    fn is_current(&self, name: &str, attempt: Uuid) -> bool {
        self.activities.get(name).map(|a| a.attempt) == Some(attempt)
    }

    fn is_settled(&self, name: &str) -> bool {
        !self.requested.contains(name) && matches!(self.state_of(name), Running | Failed | Stopped | Pending)
    }

    fn is_quiescent(&self) -> bool {
        self.activities.is_empty()
            && self
                .services
                .values()
                .all(|s| matches!(s.state, Pending | Stopped | Failed))
    }

    fn outcome(&self, name: &str) -> ServiceOutcome {
        match self.services.get(name) {
            Some(record) if record.state == Running => ServiceOutcome::Running,
            Some(record) if record.state == Failed => ServiceOutcome::Failed {
                reason: record.failure.clone().unwrap_or(FailureReason::StartFailed {
                    cause: "unknown".to_string(),
                }),
            },
            Some(record) => ServiceOutcome::NotStarted {
                state: record.state,
            },
            None => ServiceOutcome::NotStarted { state: Pending },
        }
    }

    fn settle_waiters(&mut self) {
        for waiter in std::mem::take(&mut self.waiters) {
            if let Some(waiter) = self.try_settle(waiter) {
                self.waiters.push(waiter);
            }
        }
    }

    /// Reply if the waiter's condition holds, otherwise hand it back
    fn try_settle(&mut self, waiter: Waiter) -> Option<Waiter> {
        match waiter {
            Waiter::Start {
                targets,
                respond_to,
            } => {
                if !targets.iter().all(|t| self.is_settled(t)) {
                    return Some(Waiter::Start {
                        targets,
                        respond_to,
                    });
                }
                let outcomes = targets
                    .into_iter()
                    .map(|t| {
                        let outcome = self.outcome(&t);
                        (t, outcome)
                    })
                    .collect();
                let _ = respond_to.send(Ok(StartReport { outcomes }));
                None
            }
            Waiter::Stop {
                service,
                respond_to,
            } => {
                if !matches!(self.state_of(&service), Stopped | Failed | Pending) {
                    return Some(Waiter::Stop {
                        service,
                        respond_to,
                    });
                }
                let _ = respond_to.send(Ok(()));
                None
            }
            Waiter::StopAll { respond_to } => {
                if !self.is_quiescent() {
                    return Some(Waiter::StopAll { respond_to });
                }
                let _ = respond_to.send(Ok(()));
                None
            }
            Waiter::Restart {
                service,
                respond_to,
            } => {
                let result = match self.services.get(&service) {
                    Some(record) if record.state == Running => Ok(()),
                    Some(record) if record.state == Failed => Err(record
                        .failure
                        .as_ref()
                        .map(|reason| failure_error(&service, reason))
                        .unwrap_or_else(|| OrchestratorError::NotRunning(service.clone()))),
                    Some(record) if matches!(record.state, Stopped | Pending) => {
                        Err(OrchestratorError::NotRunning(service.clone()))
                    }
                    Some(_) => {
                        return Some(Waiter::Restart {
                            service,
                            respond_to,
                        })
                    }
                    None => Err(OrchestratorError::UnknownService(service.clone())),
                };
                let _ = respond_to.send(result);
                None
            }
            Waiter::Shutdown { respond_to } => {
                if !self.is_quiescent() {
                    return Some(Waiter::Shutdown { respond_to });
                }
                self.finished = true;
                let _ = respond_to.send(());
                None
            }
        }
    }

    fn snapshot(&self) -> Vec<ServiceStatus> {
        self.order
            .iter()
            .filter_map(|name| self.services.get(name))
            .map(|record| ServiceStatus {
                name: record.name().to_string(),
                kind: record.spec.kind.clone(),
                state: record.state,
                pid: record.process.as_ref().and_then(|h| h.pid),
                running: record.process.as_ref().is_some_and(|h| h.is_running()),
                health: record.last_health.clone(),
                restart_count: record.restart_count,
                failure: record.failure.clone(),
            })
            .collect()
    }
}
