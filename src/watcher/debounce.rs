use std::collections::HashMap;
use tokio::time::{Duration, Instant};

use crate::orchestrator::ChangeCommand;

/// Trailing-edge debounce keyed by command: each new occurrence pushes the
/// target's deadline back by one window.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<ChangeCommand, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn push(&mut self, command: ChangeCommand, now: Instant) {
        self.pending.insert(command, now + self.window);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return every command whose window has elapsed, oldest first
    pub fn drain_due(&mut self, now: Instant) -> Vec<ChangeCommand> {
        let mut due: Vec<(ChangeCommand, Instant)> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(command, deadline)| (command.clone(), *deadline))
            .collect();
        due.sort_by_key(|(_, deadline)| *deadline);

        for (command, _) in &due {
            self.pending.remove(command);
        }
        due.into_iter().map(|(command, _)| command).collect()
    }

    /// Everything still buffered, regardless of deadline
    pub fn drain_all(&mut self) -> Vec<ChangeCommand> {
        let mut all: Vec<(ChangeCommand, Instant)> = self.pending.drain().collect();
        all.sort_by_key(|(_, deadline)| *deadline);
        all.into_iter().map(|(command, _)| command).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
