//! End-to-end tests that drive real child processes through the orchestrator.
//!
//! ## Test Organization
//!
//! - **life_cycle**: dependency-ordered start, stop and shutdown
//! - **failure_containment**: failures stay with the failing service and its dependents
//! - **restart**: explicit restarts and their preconditions
//! - **hot_reload**: watcher commands, schema regeneration and debounce
//!
//! Services are plain `sleep` processes with shell health checks, so the suite
//! needs a unix-like environment but nothing else.

pub mod failure_containment;
pub mod hot_reload;
pub mod life_cycle;
pub mod restart;

use tokio::time::Instant;

pub async fn poll_until<T, F, Fut>(
    timeout: std::time::Duration,
    interval: std::time::Duration,
    mut check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }

        if Instant::now() >= deadline {
            return None;
        }

        tokio::time::sleep(interval).await;
    }
}
