//! Exactly one live subscription task per logical key.
//!
//! Switching polls or re-initializing the client for the same poll must
//! never leave an orphaned subscription delivering stale callbacks, so
//! attaching under a key always tears down whatever held that key before.

use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKey {
    SessionState,
    StudentStatus,
    Connectivity,
}

impl ListenerKey {
    fn label(self) -> &'static str {
        match self {
            ListenerKey::SessionState => "session_state",
            ListenerKey::StudentStatus => "student_status",
            ListenerKey::Connectivity => "connectivity",
        }
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    tasks: parking_lot::Mutex<HashMap<ListenerKey, JoinHandle<()>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `task` under `key`, aborting any previous holder first.
    pub fn attach(&self, key: ListenerKey, task: JoinHandle<()>) {
        let previous = self.tasks.lock().insert(key, task);
        if let Some(previous) = previous {
            debug!(
                target = "podium::listeners",
                key = key.label(),
                "replacing existing subscription"
            );
            previous.abort();
        }
    }

    /// Detaching an absent key is a no-op, not an error.
    pub fn detach(&self, key: ListenerKey) {
        if let Some(task) = self.tasks.lock().remove(&key) {
            task.abort();
        }
    }

    /// Used on poll switch: no dangling listener may fire against a stale
    /// poll id.
    pub fn detach_all(&self) {
        let tasks: Vec<(ListenerKey, JoinHandle<()>)> =
            self.tasks.lock().drain().collect();
        for (key, task) in tasks {
            debug!(target = "podium::listeners", key = key.label(), "detaching");
            task.abort();
        }
    }

    pub fn is_attached(&self, key: ListenerKey) -> bool {
        self.tasks
            .lock()
            .get(&key)
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ListenerRegistry {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn pending_task(dropped: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let _guard = SetOnDrop(dropped);
            std::future::pending::<()>().await;
        })
    }

    #[test_timeout::tokio_timeout_test]
    async fn attach_replaces_previous_subscription() {
        let registry = ListenerRegistry::new();
        let first_dropped = Arc::new(AtomicBool::new(false));
        registry.attach(
            ListenerKey::SessionState,
            pending_task(first_dropped.clone()),
        );
        // Let the first task begin executing (and construct its drop guard)
        // before it is replaced; on a current-thread runtime a task aborted
        // before its first poll is dropped without ever entering its body.
        tokio::task::yield_now().await;
        let second_dropped = Arc::new(AtomicBool::new(false));
        registry.attach(
            ListenerKey::SessionState,
            pending_task(second_dropped.clone()),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(first_dropped.load(Ordering::SeqCst));
        assert!(!second_dropped.load(Ordering::SeqCst));
        assert!(registry.is_attached(ListenerKey::SessionState));
    }

    #[test_timeout::tokio_timeout_test]
    async fn detach_is_idempotent() {
        let registry = ListenerRegistry::new();
        let dropped = Arc::new(AtomicBool::new(false));
        registry.attach(ListenerKey::StudentStatus, pending_task(dropped.clone()));
        // Ensure the task is polled at least once so its drop guard exists
        // before we abort it (see attach_replaces_previous_subscription).
        tokio::task::yield_now().await;

        registry.detach(ListenerKey::StudentStatus);
        registry.detach(ListenerKey::StudentStatus);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!registry.is_attached(ListenerKey::StudentStatus));
    }

    #[test_timeout::tokio_timeout_test]
    async fn detach_all_cancels_every_key() {
        let registry = ListenerRegistry::new();
        let flags: Vec<Arc<AtomicBool>> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();
        registry.attach(ListenerKey::SessionState, pending_task(flags[0].clone()));
        registry.attach(ListenerKey::StudentStatus, pending_task(flags[1].clone()));
        registry.attach(ListenerKey::Connectivity, pending_task(flags[2].clone()));
        // Let every spawned task start (constructing its drop guard) before
        // we abort them all; see attach_replaces_previous_subscription.
        tokio::task::yield_now().await;

        registry.detach_all();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for flag in &flags {
            assert!(flag.load(Ordering::SeqCst));
        }
    }
}
