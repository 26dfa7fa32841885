//! One-shot scheduled tasks owned by a state machine.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A pending delayed action.
///
/// Only the wait is cancellable: once the delay elapses the action is
/// spawned as its own task, so cancelling (or dropping) the handle after
/// that point does not interrupt work already started.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `action` on a fresh task after `delay`.
    pub fn after<F>(delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(action);
        });
        Self { handle }
    }

}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
