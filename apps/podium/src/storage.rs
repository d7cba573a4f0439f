//! Per-profile durable storage.
//!
//! Everything the client must survive a reload with goes through the
//! [`KeyValueStorage`] port: the poison-pill lock, the answer queue,
//! elimination marks, the submission guard, and the cached session
//! snapshot. Keeping raw key access in this module (instead of scattered
//! call sites) is what makes the persisted surface auditable.

use podium_proto::{LiveSessionState, QuestionTag};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("storage serialization error for {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no storage directory available")]
    NoDirectory,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Minimal durable KV port. Implementations must be cheap enough to call on
/// every state transition; values are small JSON documents.
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
}

pub fn read_json<T: DeserializeOwned>(
    storage: &dyn KeyValueStorage,
    key: &str,
) -> StorageResult<Option<T>> {
    match storage.get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StorageError::Codec {
                key: key.to_owned(),
                source,
            }),
        None => Ok(None),
    }
}

pub fn write_json<T: Serialize>(
    storage: &dyn KeyValueStorage,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    let raw = serde_json::to_string(value).map_err(|source| StorageError::Codec {
        key: key.to_owned(),
        source,
    })?;
    storage.set(key, &raw)
}

/// In-memory storage for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: parking_lot::Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.entries.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One file per key under a profile directory.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            key: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    /// Default per-user profile directory.
    pub fn open_default() -> StorageResult<Self> {
        let dirs = directories::ProjectDirs::from("app", "Podium", "podium")
            .ok_or(StorageError::NoDirectory)?;
        Self::open(dirs.data_local_dir())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        self.root.join(format!("{safe}.json"))
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        std::fs::write(self.path_for(key), value).map_err(|source| StorageError::Io {
            key: key.to_owned(),
            source,
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }
}

pub mod keys {
    use podium_proto::QuestionTag;

    pub const LOCK_STATE: &str = "lock_state.v1";
    pub const PENDING_VIOLATIONS: &str = "pending_violations.v1";
    pub const IDENTITY: &str = "identity.v1";

    pub fn answer_queue(poll_id: &str) -> String {
        format!("answer_queue.{poll_id}")
    }

    pub fn submission_guard(poll_id: &str) -> String {
        format!("submission_guard.{poll_id}")
    }

    pub fn eliminations(tag: &QuestionTag) -> String {
        format!(
            "eliminations.{}.{}.{}",
            tag.poll_id, tag.question_index, tag.reset_timestamp
        )
    }

    pub fn session_cache(poll_id: &str) -> String {
        format!("session_cache.{poll_id}")
    }
}

/// Identity persisted across reloads so a refresh lands back in the same
/// poll without re-entering the join flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub poll_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

/// Last-known session snapshot, kept for instant re-render before the first
/// fresh read completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSession {
    pub stored_at_ms: i64,
    pub session: LiveSessionState,
}

/// Loads the cached snapshot for `poll_id`, discarding it when it is older
/// than `ttl_ms` or its status is terminal (a dead session must never flash
/// back onto the screen).
pub fn load_cached_session(
    storage: &dyn KeyValueStorage,
    poll_id: &str,
    ttl_ms: i64,
    now_ms: i64,
) -> Option<LiveSessionState> {
    let key = keys::session_cache(poll_id);
    let cached: CachedSession = read_json(storage, &key).ok().flatten()?;
    if now_ms.saturating_sub(cached.stored_at_ms) > ttl_ms || cached.session.status.is_terminal() {
        let _ = storage.remove(&key);
        return None;
    }
    Some(cached.session)
}

pub fn store_cached_session(
    storage: &dyn KeyValueStorage,
    session: &LiveSessionState,
    now_ms: i64,
) -> StorageResult<()> {
    write_json(
        storage,
        &keys::session_cache(&session.poll_id),
        &CachedSession {
            stored_at_ms: now_ms,
            session: session.clone(),
        },
    )
}

pub fn load_eliminations(storage: &dyn KeyValueStorage, tag: &QuestionTag) -> Vec<usize> {
    read_json(storage, &keys::eliminations(tag))
        .ok()
        .flatten()
        .unwrap_or_default()
}
