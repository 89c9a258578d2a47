//! Offline fallback cache.
//!
//! A keyed, last-write-wins local store of unsynchronized documents,
//! written on every failed or suppressed flush and read back as the source
//! of truth while offline. Each write merges onto the existing entry so
//! fields absent from the current flush (unchanged tags, title) survive.
//!
//! Entries are keyed `offline-doc:{documentId}`. When opened with a
//! backing [`DocumentStore`] the cache writes through to its `offline`
//! column family; a failing fallback write is swallowed — the only
//! user-visible symptom of a broken cache is a persistent unsynchronized
//! status.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::protocol::unix_millis;
use crate::storage::DocumentStore;

/// Durable fallback key for a document.
pub fn cache_key(document_id: &str) -> String {
    format!("offline-doc:{document_id}")
}

/// One cached, not-yet-synchronized document state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineCacheEntry {
    pub id: String,
    pub title: Option<String>,
    pub content: String,
    pub content_snapshot: Option<String>,
    pub tags: Option<Vec<String>>,
    pub updated_at: u64,
    pub user_id: Option<String>,
    pub cached_at: u64,
    pub offline: bool,
    pub api_failed: bool,
}

/// Fields carried by one fallback write. `None` fields leave the existing
/// entry untouched.
#[derive(Debug, Clone, Default)]
pub struct OfflineCacheUpdate {
    pub document_id: String,
    pub content: String,
    pub title: Option<String>,
    pub content_snapshot: Option<String>,
    pub tags: Option<Vec<String>>,
    pub user_id: Option<String>,
    pub api_failed: bool,
}

impl OfflineCacheUpdate {
    pub fn new(document_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Client-local offline store. Only the owning session writes its own
/// keyed entries; there is no eviction and no size bound (bounded by open
/// documents, not a server-wide dataset).
pub struct OfflineCache {
    entries: Mutex<HashMap<String, OfflineCacheEntry>>,
    store: Option<Arc<DocumentStore>>,
}

impl Default for OfflineCache {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineCache {
    /// In-memory only.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Write-through to the `offline` column family of `store`.
    pub fn with_store(store: Arc<DocumentStore>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            store: Some(store),
        }
    }

    /// Merge-upsert one document state; last write wins.
    pub fn upsert(&self, update: OfflineCacheUpdate) {
        let now = unix_millis();
        let key = cache_key(&update.document_id);

        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| OfflineCacheEntry {
                    id: update.document_id.clone(),
                    title: None,
                    content: String::new(),
                    content_snapshot: None,
                    tags: None,
                    updated_at: now,
                    user_id: None,
                    cached_at: now,
                    offline: true,
                    api_failed: false,
                });

            entry.content = update.content;
            if update.title.is_some() {
                entry.title = update.title;
            }
            if update.content_snapshot.is_some() {
                entry.content_snapshot = update.content_snapshot;
            }
            if update.tags.is_some() {
                entry.tags = update.tags;
            }
            if update.user_id.is_some() {
                entry.user_id = update.user_id;
            }
            entry.api_failed = entry.api_failed || update.api_failed;
            entry.updated_at = now;
            entry.offline = true;
            entry.clone()
        };

        if let Some(store) = &self.store {
            match bincode::serde::encode_to_vec(&entry, bincode::config::standard()) {
                Ok(bytes) => {
                    if let Err(e) = store.offline_put(&key, &bytes) {
                        // Best-effort fallback of a best-effort fallback.
                        log::debug!("offline cache write failed for {key}: {e}");
                    }
                }
                Err(e) => log::debug!("offline cache encode failed for {key}: {e}"),
            }
        }
    }

    /// Latest cached state for a document, if any.
    pub fn get(&self, document_id: &str) -> Option<OfflineCacheEntry> {
        let key = cache_key(document_id);
        {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get(&key) {
                return Some(entry.clone());
            }
        }
        // Fall back to the durable copy from a previous run.
        let store = self.store.as_ref()?;
        let bytes = store.offline_get(&key).ok().flatten()?;
        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map(|(entry, _)| entry)
            .ok()
    }

    /// Drop a document's cached state after it fully synchronized.
    pub fn remove(&self, document_id: &str) {
        let key = cache_key(document_id);
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.remove(&key);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.offline_delete(&key) {
                log::debug!("offline cache delete failed for {key}: {e}");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
