use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters kept from the digest. Sixteen characters give
/// 64 bits of key space, which is plenty for a classroom-sized cohort while
/// keeping database paths short.
pub const STUDENT_KEY_LEN: usize = 16;

/// Deterministic per-student identifier used as a database path segment.
///
/// Derived from `(poll_id, email)` so that every tab and reload of the same
/// student converges on one record, on any device. The email is trimmed and
/// lowercased before hashing; the hex output contains no characters that are
/// illegal in a path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudentKey(String);

impl StudentKey {
    pub fn derive(poll_id: &str, email: &str) -> Self {
        let normalized = email.trim().to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(poll_id.as_bytes());
        hasher.update(b":");
        hasher.update(normalized.as_bytes());
        let digest = hasher.finalize();
        StudentKey(hex::encode(digest)[..STUDENT_KEY_LEN].to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
