//! Durable storage behind the persistence worker.
//!
//! The sync engine talks to storage through the narrow [`DocumentStorage`]
//! trait: load a document, upsert it, append a history record. Everything
//! else about the relational world (schema, migrations, auth) lives
//! outside this crate.
//!
//! Two implementations ship here:
//! - [`memory::MemoryStore`] — for tests and storage-less deployments;
//! - [`rocks::DocumentStore`] — RocksDB with LZ4-compressed values, also
//!   backing the client's durable offline cache.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentStore, StoreConfig};

use serde::{Deserialize, Serialize};

/// Persisted state of one document. Last acknowledged write wins; the
/// `revision` makes concurrent upserts observable rather than silent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub title: Option<String>,
    /// Live content, possibly with markup.
    pub content: String,
    /// Canonical snapshot text used for diffing.
    pub snapshot_text: String,
    pub tags: Option<Vec<String>>,
    /// Monotonic, assigned by the persistence worker per upsert.
    pub revision: u64,
    pub updated_at: u64,
}

/// Append-only record of one committed textual change. Never mutated;
/// only written when `before != after`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub document_id: String,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub before: Option<String>,
    pub after: String,
    pub added: Option<String>,
    pub removed: Option<String>,
    pub created_at: u64,
}

/// The storage surface the sync engine consumes.
pub trait DocumentStorage: Send + Sync {
    fn load_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError>;

    fn upsert_document(&self, record: &DocumentRecord) -> Result<(), StoreError>;

    fn append_history(&self, entry: &HistoryEntry) -> Result<(), StoreError>;

    /// History records for a document, oldest first.
    fn history(&self, document_id: &str) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Highest revision ever written; seeds the worker's counter.
    fn latest_revision(&self) -> Result<u64, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    Database(String),
    NotFound(String),
    Serialization(String),
    Deserialization(String),
    Compression(String),
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Compression(e) => write!(f, "Compression error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
