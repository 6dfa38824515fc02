//! Key-value storage seams for sessions and dedup entries
//!
//! The registry and dedup index only talk to these traits. The in-memory
//! implementations here are the process-local default; `crate::db` provides
//! SQLite-backed ones.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::types::{DedupEntry, SessionStatus, UploadError, UploadSession, Versioned};

// ============================================================================
// Traits
// ============================================================================

/// Versioned session storage with compare-and-swap updates
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session with its current version
    async fn get(&self, upload_id: &str) -> Result<Option<Versioned<UploadSession>>, UploadError>;

    /// Insert a session unless one already exists under the same ID.
    ///
    /// Returns whatever is stored after the call, so callers can detect a
    /// pre-existing session by comparing fields.
    async fn insert_if_absent(
        &self,
        session: UploadSession,
    ) -> Result<Versioned<UploadSession>, UploadError>;

    /// Replace a session only if its stored version equals `expected_version`.
    ///
    /// Returns `None` when the version moved on or the session is gone.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        session: UploadSession,
    ) -> Result<Option<Versioned<UploadSession>>, UploadError>;

    /// Remove a session, returning it if it existed
    async fn remove(&self, upload_id: &str) -> Result<Option<UploadSession>, UploadError>;

    /// Remove a session only if its stored version equals `expected_version`
    async fn compare_and_remove(
        &self,
        upload_id: &str,
        expected_version: u64,
    ) -> Result<Option<UploadSession>, UploadError>;

    /// Oldest receiving session claiming `content_hash`
    async fn find_by_content_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<UploadSession>, UploadError>;

    /// All stored sessions, oldest first
    async fn list(&self) -> Result<Vec<UploadSession>, UploadError>;
}

/// Content hash -> artifact mapping
#[async_trait::async_trait]
pub trait DedupStore: Send + Sync {
    async fn get(&self, content_hash: &str) -> Result<Option<DedupEntry>, UploadError>;

    /// Store `entry` unless the hash is already mapped; returns the stored entry
    async fn put_if_absent(&self, entry: DedupEntry) -> Result<DedupEntry, UploadError>;

    async fn remove(&self, content_hash: &str) -> Result<bool, UploadError>;

    async fn count(&self) -> Result<usize, UploadError>;
}

// ============================================================================
// In-Memory Session Store
// ============================================================================

/// One row per upload ID. `None` marks a removed row so a caller holding a
/// stale handle cannot resurrect it.
type SessionSlot = Arc<Mutex<Option<Versioned<UploadSession>>>>;

/// Process-local session store with one lock per upload ID
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionSlot>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, upload_id: &str) -> Option<SessionSlot> {
        self.sessions.read().get(upload_id).cloned()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, upload_id: &str) -> Result<Option<Versioned<UploadSession>>, UploadError> {
        let Some(slot) = self.slot(upload_id) else {
            return Ok(None);
        };
        let row = slot.lock().clone();
        Ok(row)
    }

    async fn insert_if_absent(
        &self,
        session: UploadSession,
    ) -> Result<Versioned<UploadSession>, UploadError> {
        loop {
            let slot = {
                let mut sessions = self.sessions.write();
                sessions
                    .entry(session.upload_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(None)))
                    .clone()
            };

            let mut row = slot.lock();
            if let Some(existing) = row.as_ref() {
                return Ok(existing.clone());
            }

            // A fresh slot is empty until we fill it. An emptied slot that is
            // no longer in the map was removed concurrently; try again.
            let still_mapped = self
                .sessions
                .read()
                .get(&session.upload_id)
                .map(|current| Arc::ptr_eq(current, &slot))
                .unwrap_or(false);
            if !still_mapped {
                continue;
            }

            let stored = Versioned {
                version: 1,
                value: session,
            };
            *row = Some(stored.clone());
            return Ok(stored);
        }
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        session: UploadSession,
    ) -> Result<Option<Versioned<UploadSession>>, UploadError> {
        let Some(slot) = self.slot(&session.upload_id) else {
            return Ok(None);
        };

        let mut row = slot.lock();
        match row.as_mut() {
            Some(current) if current.version == expected_version => {
                current.version += 1;
                current.value = session;
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn remove(&self, upload_id: &str) -> Result<Option<UploadSession>, UploadError> {
        let Some(slot) = self.sessions.write().remove(upload_id) else {
            return Ok(None);
        };
        let removed = slot.lock().take();
        Ok(removed.map(|v| v.value))
    }

    async fn compare_and_remove(
        &self,
        upload_id: &str,
        expected_version: u64,
    ) -> Result<Option<UploadSession>, UploadError> {
        let Some(slot) = self.slot(upload_id) else {
            return Ok(None);
        };

        let mut row = slot.lock();
        let matches = row
            .as_ref()
            .map(|current| current.version == expected_version)
            .unwrap_or(false);
        if !matches {
            return Ok(None);
        }

        // Unmap while the row is still locked. Nobody waits on a row lock
        // while holding the map lock, so this ordering cannot deadlock.
        self.sessions.write().remove(upload_id);
        Ok(row.take().map(|v| v.value))
    }

    async fn find_by_content_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<UploadSession>, UploadError> {
        let found = self
            .list()
            .await?
            .into_iter()
            .find(|s| s.content_hash == content_hash && s.status == SessionStatus::Receiving);
        Ok(found)
    }

    async fn list(&self) -> Result<Vec<UploadSession>, UploadError> {
        let slots: Vec<SessionSlot> = self.sessions.read().values().cloned().collect();
        let mut sessions: Vec<UploadSession> = slots
            .iter()
            .filter_map(|slot| slot.lock().as_ref().map(|v| v.value.clone()))
            .collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.upload_id.cmp(&b.upload_id))
        });
        Ok(sessions)
    }
}

// ============================================================================
// In-Memory Dedup Store
// ============================================================================

/// Process-local content hash index
#[derive(Clone, Default)]
pub struct MemoryDedupStore {
    entries: Arc<RwLock<HashMap<String, DedupEntry>>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DedupStore for MemoryDedupStore {
    async fn get(&self, content_hash: &str) -> Result<Option<DedupEntry>, UploadError> {
        Ok(self.entries.read().get(content_hash).cloned())
    }

    async fn put_if_absent(&self, entry: DedupEntry) -> Result<DedupEntry, UploadError> {
        let mut entries = self.entries.write();
        Ok(entries
            .entry(entry.content_hash.clone())
            .or_insert(entry)
            .clone())
    }

    async fn remove(&self, content_hash: &str) -> Result<bool, UploadError> {
        Ok(self.entries.write().remove(content_hash).is_some())
    }

    async fn count(&self) -> Result<usize, UploadError> {
        Ok(self.entries.read().len())
    }
}

// ============================================================================
// Tests
// ============================================================================
