use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::domain::{FailureReason, LifecycleState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StateChanged {
        service: String,
        from: LifecycleState,
        to: LifecycleState,
        failure: Option<FailureReason>,
    },
    LogLine {
        service: String,
        stream: LogStream,
        line: String,
    },
    SchemaRegenerated {
        resource: String,
        error: Option<String>,
    },
}

/// Event record published to live observers
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Fan-out of state transitions and process output.
///
/// Publishing never blocks; slow subscribers lag and miss events rather
/// than holding up the orchestrator.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, kind: EventKind) {
        // no subscribers is not an error
        let _ = self.tx.send(OrchestratorEvent {
            at: Utc::now(),
            kind,
        });
    }

    pub fn receiver(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    pub fn subscribe(&self) -> BroadcastStream<OrchestratorEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}
