//! The device-local lock ("poison pill") and its persistence.
//!
//! The pill survives page reloads and can only be cleared by a
//! server-approved unlock carrying a matching lock version, which is what
//! makes a proctoring lock resistant to a refresh-to-bypass attempt. All
//! reads and writes of the underlying storage key go through
//! [`LockManager`]; nothing else in the crate touches it.

use crate::storage::{self, KeyValueStorage, StorageResult, keys};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

pub const LOCK_SCHEMA_VERSION: u32 = 1;

/// Violation reasons as reported to the backend.
pub mod reasons {
    pub const EXIT_FULLSCREEN: &str = "exit-fullscreen";
    pub const TAB_HIDDEN: &str = "tab-hidden";
    pub const WINDOW_BLUR: &str = "window-blur";
}

/// Serialized form of the poison pill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalLockState {
    pub schema_version: u32,
    pub active: bool,
    pub reason: String,
    /// Lock version in force when the pill was set. An unlock signal must
    /// carry a version at least this high to clear the pill.
    pub lock_version: u64,
    pub timestamp_ms: i64,
}

impl LocalLockState {
    pub fn inactive() -> Self {
        Self {
            schema_version: LOCK_SCHEMA_VERSION,
            active: false,
            reason: String::new(),
            lock_version: 0,
            timestamp_ms: 0,
        }
    }

    pub fn engaged(reason: impl Into<String>, lock_version: u64, now_ms: i64) -> Self {
        Self {
            schema_version: LOCK_SCHEMA_VERSION,
            active: true,
            reason: reason.into(),
            lock_version,
            timestamp_ms: now_ms,
        }
    }

    /// Whether an unlock signal at `unlock_version` releases this pill.
    pub fn released_by(&self, unlock_version: u64) -> bool {
        !self.active || unlock_version >= self.lock_version
    }
}

/// A violation report that has not reached the backend yet. Kept durable so
/// a report lost to a network drop is retried after reload; the local lock
/// is in force the whole time regardless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingViolation {
    pub poll_id: String,
    pub student_email: String,
    pub reason: String,
    #[serde(default)]
    pub attempts: u32,
}

/// Owns the persisted pill and the pending-violation retry list.
#[derive(Clone)]
pub struct LockManager {
    storage: Arc<dyn KeyValueStorage>,
}

impl LockManager {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }

    /// Loads the pill at startup, before any other render decision. A
    /// missing or unreadable record is treated as inactive; corruption must
    /// not lock out a student the server never locked.
    pub fn load(&self) -> LocalLockState {
        match storage::read_json::<LocalLockState>(self.storage.as_ref(), keys::LOCK_STATE) {
            Ok(Some(state)) if state.schema_version == LOCK_SCHEMA_VERSION => state,
            Ok(Some(state)) => {
                warn!(
                    target = "podium::proctor",
                    schema = state.schema_version,
                    "discarding lock state with unknown schema"
                );
                LocalLockState::inactive()
            }
            Ok(None) => LocalLockState::inactive(),
            Err(err) => {
                warn!(target = "podium::proctor", error = %err, "failed to read lock state");
                LocalLockState::inactive()
            }
        }
    }

    pub fn persist(&self, state: &LocalLockState) -> StorageResult<()> {
        storage::write_json(self.storage.as_ref(), keys::LOCK_STATE, state)
    }

    pub fn clear(&self) -> StorageResult<()> {
        self.persist(&LocalLockState::inactive())
    }

    pub fn is_locked(&self) -> bool {
        self.load().active
    }

    pub fn pending_violations(&self) -> Vec<PendingViolation> {
        storage::read_json(self.storage.as_ref(), keys::PENDING_VIOLATIONS)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn push_pending(&self, violation: PendingViolation) -> StorageResult<()> {
        let mut pending = self.pending_violations();
        pending.push(violation);
        storage::write_json(self.storage.as_ref(), keys::PENDING_VIOLATIONS, &pending)
    }

    /// Removes and returns the head of the retry list. The caller re-pushes
    /// (with a bumped attempt count) if delivery fails again.
    pub fn pop_pending(&self) -> StorageResult<Option<PendingViolation>> {
        let mut pending = self.pending_violations();
        if pending.is_empty() {
            return Ok(None);
        }
        let head = pending.remove(0);
        storage::write_json(self.storage.as_ref(), keys::PENDING_VIOLATIONS, &pending)?;
        Ok(Some(head))
    }

    pub fn requeue_pending(&self, mut violation: PendingViolation) -> StorageResult<()> {
        violation.attempts = violation.attempts.saturating_add(1);
        let mut pending = self.pending_violations();
        pending.insert(0, violation);
        storage::write_json(self.storage.as_ref(), keys::PENDING_VIOLATIONS, &pending)
    }
}
