//! Filesystem change detection for hot reload.
//!
//! Raw notify events are mapped to [`ChangeCommand`]s, debounced per target
//! and forwarded to the orchestrator. The watcher never touches service
//! state itself.

mod debounce;
mod mapper;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

use crate::domain::Project;
use crate::orchestrator::ChangeCommand;

pub use debounce::Debouncer;
pub use mapper::PathMapper;

/// Keeps the notify watcher and its debounce task alive
pub struct ChangeWatcher {
    watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ChangeWatcher {
    /// Watch every service root and the schema directory. Must be called within a tokio runtime.
    pub fn spawn(
        project: &Project,
        window: Duration,
        commands: mpsc::UnboundedSender<ChangeCommand>,
    ) -> Result<Self> {
        let mapper = PathMapper::new(project);
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => warn!("File watch error: {}", e),
            })
            .context("Failed to create file watcher")?;

        for dir in mapper.watch_roots() {
            if !dir.is_dir() {
                debug!("Not watching missing directory {}", dir.display());
                continue;
            }
            watcher
                .watch(&dir, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch {}", dir.display()))?;
            debug!("Watching {}", dir.display());
        }
        info!("Watching for changes (debounce {}ms)", window.as_millis());

        let task = tokio::spawn(debounce_loop(mapper, raw_rx, commands, window));
        Ok(Self { watcher, task })
    }

    /// Stop watching; buffered commands are flushed first
    pub async fn stop(self) {
        let Self { watcher, task } = self;
        drop(watcher);
        let _ = task.await;
    }
}

/// Map raw events, hold each target until its window has been quiet, then forward it
pub async fn debounce_loop(
    mapper: PathMapper,
    mut events: mpsc::UnboundedReceiver<notify::Event>,
    commands: mpsc::UnboundedSender<ChangeCommand>,
    window: Duration,
) {
    let mut debouncer = Debouncer::new(window);

    loop {
        let deadline = debouncer.next_deadline();

        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    for command in debouncer.drain_all() {
                        let _ = commands.send(command);
                    }
                    break;
                };
                let now = Instant::now();
                for command in mapper.map_event(&event) {
                    debouncer.push(command, now);
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                for command in debouncer.drain_due(Instant::now()) {
                    debug!("Change settled: {:?}", command);
                    if commands.send(command).is_err() {
                        debug!("Change receiver dropped, stopping watcher");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ServiceSpec;
    use notify::event::{DataChange, ModifyKind};
    use notify::EventKind;
    use std::path::PathBuf;

    fn modify(path: &str) -> notify::Event {
        notify::Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(PathBuf::from(path))
    }

    fn mapper() -> PathMapper {
        let project = Project::new("/work")
            .with_service(ServiceSpec::new("api", "/work/api", "command"))
            .unwrap()
            .with_service(ServiceSpec::new("web", "/work/web", "command"))
            .unwrap();
        PathMapper::new(&project)
    }

    #[tokio::test]
    async fn test_rapid_writes_emit_single_restart() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(debounce_loop(mapper(), raw_rx, tx, Duration::from_millis(100)));

        for _ in 0..10 {
            raw_tx.send(modify("/work/api/main.py")).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(first, Some(ChangeCommand::Restart("api".into())));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(rx.try_recv().is_err());

        drop(raw_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_targets_each_emitted() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(debounce_loop(mapper(), raw_rx, tx, Duration::from_millis(50)));

        raw_tx.send(modify("/work/api/a.py")).unwrap();
        raw_tx.send(modify("/work/web/b.ts")).unwrap();
        raw_tx.send(modify("/work/api/node_modules/x.js")).unwrap();

        let mut received = Vec::new();
        for _ in 0..2 {
            let command = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
            received.extend(command);
        }
        received.sort_by_key(|c| format!("{c:?}"));
        assert_eq!(
            received,
            vec![
                ChangeCommand::Restart("api".into()),
                ChangeCommand::Restart("web".into())
            ]
        );

        drop(raw_tx);
        task.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_flushes_pending() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(debounce_loop(mapper(), raw_rx, tx, Duration::from_secs(60)));

        raw_tx.send(modify("/work/web/index.ts")).unwrap();
        drop(raw_tx);
        task.await.unwrap();

        assert_eq!(rx.recv().await, Some(ChangeCommand::Restart("web".into())));
    }

    #[tokio::test]
    async fn test_watcher_reports_real_writes() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::create_dir_all(root.join("svc")).unwrap();

        let project = Project::new(&root)
            .with_service(ServiceSpec::new("svc", root.join("svc"), "command"))
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = ChangeWatcher::spawn(&project, Duration::from_millis(100), tx).unwrap();

        // give the backend a moment to register the watch
        tokio::time::sleep(Duration::from_millis(200)).await;
        for i in 0..3 {
            std::fs::write(root.join("svc").join("main.py"), format!("print({i})")).unwrap();
        }

        let command = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(command, Some(ChangeCommand::Restart("svc".into())));
        watcher.stop().await;
    }
}
