use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    /// `None` when terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Shared view of one spawned process.
///
/// Clones observe the same process; the child itself is owned by its monitor task.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub id: Uuid,
    pub service: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: Arc<Notify>,
}

impl ProcessHandle {
    pub(crate) fn new(
        service: String,
        pid: Option<u32>,
        exit: watch::Receiver<Option<ProcessExit>>,
        kill: Arc<Notify>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            service,
            pid,
            started_at: Utc::now(),
            exit,
            kill,
        }
    }

    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Resolves once the process has exited
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(ProcessExit { code: None }),
            // monitor gone without reporting; treat as killed
            Err(_) => ProcessExit { code: None },
        };
        exit
    }

    pub(crate) fn force_kill(&self) {
        self.kill.notify_one();
    }
}
