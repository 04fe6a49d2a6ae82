//! Task tracking for listener sessions
//!
//! Tracks the JoinHandle of every session task so the listener can count
//! live sessions and wait for (or abort) them on close.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Tracks background session tasks by session id
#[derive(Default)]
pub struct SessionTracker {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a session task, replacing (and aborting) any task with the
    /// same id. Finished tasks are pruned.
    pub fn register(&self, session_id: String, handle: JoinHandle<()>) {
        let mut tasks = self.lock();
        tasks.retain(|_, task| !task.is_finished());
        if let Some(old_handle) = tasks.remove(&session_id) {
            old_handle.abort();
        }
        tasks.insert(session_id, handle);
    }

    /// Forget a session that ended on its own
    pub fn remove(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    /// Sessions whose task is still running
    pub fn active(&self) -> usize {
        self.lock().values().filter(|task| !task.is_finished()).count()
    }

    /// Wait up to `grace` for every session to wind down, then abort the rest
    pub async fn drain(&self, grace: Duration) {
        let handles: Vec<JoinHandle<()>> = self.lock().drain().map(|(_, task)| task).collect();
        if handles.is_empty() {
            return;
        }

        let aborts: Vec<_> = handles.iter().map(|task| task.abort_handle()).collect();
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(sessions = aborts.len(), "Sessions did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_remove() {
        let tracker = SessionTracker::new();

        let handle = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(10)).await });
        tracker.register("session-1".to_string(), handle);
        assert_eq!(tracker.active(), 1);

        tracker.remove("session-1");
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_replacing_task() {
        let tracker = SessionTracker::new();

        let handle1 = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(10)).await });
        tracker.register("session-1".to_string(), handle1);

        let handle2 = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(10)).await });
        tracker.register("session-1".to_string(), handle2);

        assert_eq!(tracker.active(), 1);
    }

    #[tokio::test]
    async fn test_drain_aborts_stragglers() {
        let tracker = SessionTracker::new();
        tracker.register(
            "quick".to_string(),
            tokio::spawn(async {}),
        );
        tracker.register(
            "stuck".to_string(),
            tokio::spawn(async { tokio::time::sleep(Duration::from_secs(60)).await }),
        );

        tokio::time::timeout(Duration::from_secs(5), tracker.drain(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(tracker.active(), 0);
    }
}
