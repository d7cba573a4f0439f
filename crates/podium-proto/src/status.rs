use serde::{Deserialize, Serialize};

/// Per-student state as seen by the teacher dashboard and the proctoring
/// backend. The record is shared-write: the client flips it optimistically
/// (`Active`, `Submitted`) while the server flips it on violations and
/// unlocks (`Locked`, `AwaitingFullscreen`, `Disconnected`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StudentStatus {
    Active,
    Finished,
    Locked,
    Disconnected,
    AwaitingFullscreen,
    Blocked,
    // Legacy writers emit mixed-case "Submitted"; accept both spellings.
    #[serde(alias = "Submitted")]
    Submitted,
}

/// One student's record under `polls/{poll}/students/{key}`.
///
/// Writers MUST only ever merge partial patches into this record (see
/// [`StatusPatch`]); a full replace from either writer silently erases the
/// other side's last write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStatusRecord {
    pub status: StudentStatus,
    /// Monotonic counter bumped by the server on every lock/unlock
    /// transition. A `Locked` push carrying a version that is not newer than
    /// the one already applied is a stale duplicate and must be ignored.
    #[serde(default)]
    pub lock_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_violation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<i64>,
}

impl StudentStatusRecord {
    /// Whether a `Locked` push at `incoming` should be applied on top of a
    /// lock already applied at `applied`. Equal versions are duplicates.
    pub fn lock_is_newer(applied: u64, incoming: u64) -> bool {
        incoming > applied
    }
}

/// Field-wise partial update of a [`StudentStatusRecord`].
///
/// This is the only write shape the client exposes for the record: turning
/// the patch into a value yields an object containing exactly the fields
/// that were set, so a merge-style store write can never clobber sibling
/// fields written by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StudentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_violation_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<i64>,
}

impl StatusPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: StudentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn violation_reason(mut self, reason: impl Into<String>) -> Self {
        self.last_violation_reason = Some(reason.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn joined_at(mut self, at: i64) -> Self {
        self.joined_at = Some(at);
        self
    }

    pub fn last_active_at(mut self, at: i64) -> Self {
        self.last_active_at = Some(at);
        self
    }

    /// The merge payload: an object holding only the fields that were set.
    pub fn into_value(self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}
