//! In-memory document store.
//!
//! Backs tests and deployments that run without a storage path. Upsert and
//! history failures can be injected to exercise the log-and-continue error
//! path of the persistence worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{DocumentRecord, DocumentStorage, HistoryEntry, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, DocumentRecord>>,
    history: Mutex<Vec<HistoryEntry>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (tests the degraded path).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected write failure".to_string()));
        }
        Ok(())
    }

    pub fn document_count(&self) -> usize {
        self.documents.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn history_count(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl DocumentStorage for MemoryStore {
    fn load_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let docs = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        Ok(docs.get(document_id).cloned())
    }

    fn upsert_document(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut docs = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        docs.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn append_history(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push(entry.clone());
        Ok(())
    }

    fn history(&self, document_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        Ok(history
            .iter()
            .filter(|e| e.document_id == document_id)
            .cloned()
            .collect())
    }

    fn latest_revision(&self) -> Result<u64, StoreError> {
        let docs = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        Ok(docs.values().map(|d| d.revision).max().unwrap_or(0))
    }
}
