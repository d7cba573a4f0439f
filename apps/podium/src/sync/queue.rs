//! Durable FIFO of not-yet-confirmed answer submissions.
//!
//! Once a student has committed to an answer the UI never shows the
//! question again, so the submission must survive anything short of losing
//! the device: the queue is persisted on every mutation and drained head
//! first, one in-flight item at a time, retrying indefinitely.

use crate::storage::{self, KeyValueStorage, keys};
use async_trait::async_trait;
use podium_proto::AnswerSubmission;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use store_bus::{StoreError, StoreResult};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Delivery of one submission: the private answer record plus the public
/// status hint. Implementations must be idempotent per answer key — retrying
/// a write whose ack was lost must overwrite, never duplicate.
#[async_trait]
pub trait AnswerSink: Send + Sync {
    async fn deliver(&self, submission: &AnswerSubmission) -> StoreResult<()>;
}

pub struct AnswerQueue {
    storage: Arc<dyn KeyValueStorage>,
    storage_key: String,
    items: parking_lot::Mutex<VecDeque<AnswerSubmission>>,
}

impl AnswerQueue {
    /// Loads the persisted queue for `poll_id`, picking up submissions left
    /// over from before a reload.
    pub fn load(storage: Arc<dyn KeyValueStorage>, poll_id: &str) -> Self {
        let storage_key = keys::answer_queue(poll_id);
        let items: VecDeque<AnswerSubmission> =
            storage::read_json::<Vec<AnswerSubmission>>(storage.as_ref(), &storage_key)
                .unwrap_or_else(|err| {
                    warn!(target = "podium::queue", error = %err, "failed to read answer queue");
                    None
                })
                .unwrap_or_default()
                .into();
        Self {
            storage,
            storage_key,
            items: parking_lot::Mutex::new(items),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Enqueues a submission. A pending submission for the same
    /// `(poll, question, student)` is replaced in place — last write wins,
    /// the server never sees two answers for one key from this device.
    pub fn push(&self, submission: AnswerSubmission) {
        let mut items = self.items.lock();
        let key = submission.answer_key();
        if let Some(existing) = items.iter_mut().find(|item| item.answer_key() == key) {
            *existing = submission;
        } else {
            items.push_back(submission);
        }
        self.persist(&items);
    }

    /// Attempts to deliver the head of the queue. Returns `Ok(true)` when an
    /// item was delivered, `Ok(false)` when the queue is empty. On failure
    /// the item stays at the head with a bumped attempt count.
    pub async fn drain_once(&self, sink: &dyn AnswerSink) -> Result<bool, StoreError> {
        let head = self.items.lock().front().cloned();
        let Some(head) = head else {
            return Ok(false);
        };
        match sink.deliver(&head).await {
            Ok(()) => {
                let mut items = self.items.lock();
                // The head may have been replaced by a newer write for the
                // same key while the delivery was in flight; only drop it if
                // it is still the item we sent.
                if items.front() == Some(&head) {
                    items.pop_front();
                }
                self.persist(&items);
                debug!(
                    target = "podium::queue",
                    question = head.question_index,
                    remaining = items.len(),
                    "queued submission delivered"
                );
                Ok(true)
            }
            Err(err) => {
                let mut items = self.items.lock();
                if let Some(front) = items.front_mut() {
                    front.attempts = front.attempts.saturating_add(1);
                }
                self.persist(&items);
                Err(err)
            }
        }
    }

    fn persist(&self, items: &VecDeque<AnswerSubmission>) {
        let as_vec: Vec<&AnswerSubmission> = items.iter().collect();
        if let Err(err) = storage::write_json(self.storage.as_ref(), &self.storage_key, &as_vec) {
            // Losing durability is surfaced but never blocks the in-memory
            // queue; the direct delivery path is still live.
            warn!(target = "podium::queue", error = %err, "failed to persist answer queue");
        }
    }

    /// Spawns the background drain loop. Each tick drains sequentially until
    /// the queue is empty or a delivery fails; a failure waits for the next
    /// tick rather than hammering the backend.
    pub fn start_loop(
        self: &Arc<Self>,
        sink: Arc<dyn AnswerSink>,
        interval: Duration,
    ) -> SyncLoopHandle {
        let queue = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                loop {
                    match queue.drain_once(sink.as_ref()).await {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(err) => {
                            debug!(target = "podium::queue", error = %err, "drain failed, will retry");
                            break;
                        }
                    }
                }
            }
        });
        SyncLoopHandle { task }
    }
}

pub struct SyncLoopHandle {
    task: JoinHandle<()>,
}

impl SyncLoopHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SyncLoopHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
