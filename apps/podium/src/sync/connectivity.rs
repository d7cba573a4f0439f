//! Connectivity probing and the polling fallback.
//!
//! When the push subscription is unavailable (or not yet confirmed), a
//! timer-driven poll re-reads the live session document. The cadence adapts:
//! fast while disconnected or unconfirmed for quick recovery, slow once the
//! connection has proven stable, with jitter on every delay so a classroom
//! of clients reconnecting together does not stampede the backend.

use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use store_bus::SessionStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const BACKOFF_MULTIPLIER: u32 = 2;
/// Consecutive successful reads before the connection counts as stable.
const STABLE_AFTER: u32 = 2;

/// Exponential backoff with a cap and jitter.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// The delay to sleep before the next attempt; doubles on every call up
    /// to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered(self.current);
        self.current = (self.current * BACKOFF_MULTIPLIER).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Uniform jitter in [0.75, 1.25) of the nominal delay.
fn jittered(nominal: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..1.25f64);
    nominal.mul_f64(factor)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeEvent {
    /// A read succeeded; carries the live session value (the polling
    /// fallback doubles as a state refresh).
    Online { session: Option<Value> },
    Offline,
}

/// Timer-driven re-read of the live session path.
pub struct SessionPoller {
    store: Arc<dyn SessionStore>,
    path: String,
    fast: Duration,
    slow: Duration,
    backoff: Backoff,
}

impl SessionPoller {
    pub fn new(store: Arc<dyn SessionStore>, path: String, fast: Duration, slow: Duration) -> Self {
        let backoff = Backoff::new(fast, slow.max(fast) * 4);
        Self {
            store,
            path,
            fast,
            slow,
            backoff,
        }
    }

    /// Cadence for the next poll after `consecutive_successes` good reads.
    fn cadence(&self, consecutive_successes: u32) -> Duration {
        if consecutive_successes >= STABLE_AFTER {
            self.slow
        } else {
            self.fast
        }
    }

    pub fn spawn(mut self, events: mpsc::Sender<ProbeEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut consecutive_successes: u32 = 0;
            loop {
                let delay = match self.store.read_once(&self.path).await {
                    Ok(session) => {
                        consecutive_successes = consecutive_successes.saturating_add(1);
                        self.backoff.reset();
                        if events.send(ProbeEvent::Online { session }).await.is_err() {
                            return;
                        }
                        jittered(self.cadence(consecutive_successes))
                    }
                    Err(err) => {
                        debug!(target = "podium::connectivity", error = %err, "session poll failed");
                        consecutive_successes = 0;
                        if events.send(ProbeEvent::Offline).await.is_err() {
                            return;
                        }
                        self.backoff.next_delay()
                    }
                };
                tokio::time::sleep(delay).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use store_bus::{LocalSessionStore, StoreError, StoreEvent, StoreResult};
    use tokio::sync::broadcast;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_secs(2));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_secs(8));
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_secs(8));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_near_nominal() {
        let nominal = Duration::from_millis(1_000);
        for _ in 0..50 {
            let delay = jittered(nominal);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay < Duration::from_millis(1_250));
        }
    }

    #[test]
    fn cadence_is_fast_until_stable() {
        let store = Arc::new(LocalSessionStore::new());
        let poller = SessionPoller::new(
            store,
            "sessions/p1".into(),
            Duration::from_secs(3),
            Duration::from_secs(20),
        );
        assert_eq!(poller.cadence(0), Duration::from_secs(3));
        assert_eq!(poller.cadence(1), Duration::from_secs(3));
        assert_eq!(poller.cadence(2), Duration::from_secs(20));
        assert_eq!(poller.cadence(10), Duration::from_secs(20));
    }

    #[test_timeout::tokio_timeout_test]
    async fn poller_reports_online_with_session_value() {
        let store = Arc::new(LocalSessionStore::new());
        store
            .replace("sessions/p1", json!({ "status": "OPEN" }))
            .await
            .unwrap();

        let poller = SessionPoller::new(
            store.clone(),
            "sessions/p1".into(),
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        let (tx, mut rx) = mpsc::channel(8);
        let task = poller.spawn(tx);

        let event = rx.recv().await.expect("probe event");
        match event {
            ProbeEvent::Online { session } => {
                let session = session.expect("session present");
                assert_eq!(session["status"], "OPEN");
            }
            ProbeEvent::Offline => panic!("expected online"),
        }
        task.abort();
    }

    /// Store whose reads fail until the flag flips, for exercising the
    /// offline-to-online transition.
    struct FlakyStore {
        inner: LocalSessionStore,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn read_once(&self, path: &str) -> StoreResult<Option<Value>> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(StoreError::Transport("link down".into()));
            }
            self.inner.read_once(path).await
        }

        fn subscribe(&self, path: &str) -> broadcast::Receiver<StoreEvent> {
            self.inner.subscribe(path)
        }

        async fn merge_update(&self, path: &str, patch: Value) -> StoreResult<()> {
            self.inner.merge_update(path, patch).await
        }

        async fn replace(&self, path: &str, value: Value) -> StoreResult<()> {
            self.inner.replace(path, value).await
        }

        async fn remove(&self, path: &str) -> StoreResult<()> {
            self.inner.remove(path).await
        }

        async fn on_disconnect_merge(&self, path: &str, patch: Value) -> StoreResult<()> {
            self.inner.on_disconnect_merge(path, patch).await
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn poller_recovers_after_outage() {
        let store = Arc::new(FlakyStore {
            inner: LocalSessionStore::new(),
            healthy: AtomicBool::new(false),
        });
        let poller = SessionPoller::new(
            store.clone(),
            "sessions/p1".into(),
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        let (tx, mut rx) = mpsc::channel(32);
        let task = poller.spawn(tx);

        assert_eq!(rx.recv().await, Some(ProbeEvent::Offline));
        store.healthy.store(true, Ordering::SeqCst);

        loop {
            match rx.recv().await.expect("probe event") {
                ProbeEvent::Online { .. } => break,
                ProbeEvent::Offline => continue,
            }
        }
        task.abort();
    }
}
