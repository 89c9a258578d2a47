//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents` — current document records (LZ4 compressed)
//! - `history`   — append-only history entries, keyed `doc_id \0 seq` for
//!   ordered per-document scans
//! - `offline`   — the client's durable offline fallback entries, keyed by
//!   the `offline-doc:{id}` scheme
//! - `meta`      — global counters (latest revision, history sequence)
//!
//! Values are LZ4 compressed; document and history writes go through
//! atomic `WriteBatch`es together with their counters so a crash never
//! leaves the counters behind the data.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{DocumentRecord, DocumentStorage, HistoryEntry, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_HISTORY: &str = "history";
const CF_OFFLINE: &str = "offline";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_HISTORY, CF_OFFLINE, CF_META];

/// Meta CF keys.
const META_REVISION: &[u8] = b"revision";
const META_HISTORY_SEQ: &[u8] = b"history_seq";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// Bloom filter bits per key
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write
    pub sync_writes: bool,
    /// Max open files for RocksDB
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("notesync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Production defaults at the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// RocksDB document store.
pub struct DocumentStore {
    /// Single-threaded mode — concurrency comes from tokio tasks.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next history sequence number.
    history_seq: AtomicU64,
    /// Highest revision observed, mirrored in the meta CF.
    revision: AtomicU64,
}

impl DocumentStore {
    /// Open the store, creating the database and column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let history_seq = Self::read_counter(&db, META_HISTORY_SEQ)?;
        let revision = Self::read_counter(&db, META_REVISION)?;

        Ok(Self {
            db,
            config,
            history_seq: AtomicU64::new(history_seq),
            revision: AtomicU64::new(revision),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_OFFLINE | CF_META => {
                // Point lookups by document key.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_HISTORY => {
                // Many small appends, prefix-scanned by document id.
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    fn read_counter(
        db: &DBWithThreadMode<SingleThreaded>,
        key: &[u8],
    ) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::Database("meta column family missing".to_string()))?;
        match db.get_cf(&cf, key)? {
            Some(bytes) if bytes.len() >= 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                Ok(u64::from_be_bytes(buf))
            }
            _ => Ok(0),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// History key: document id bytes, NUL separator, sequence (8B BE).
    fn history_key(document_id: &str, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(document_id.len() + 9);
        key.extend_from_slice(document_id.as_bytes());
        key.push(0);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(value)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of documents currently stored.
    pub fn document_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item.map_err(|e| StoreError::Database(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    // ─── Offline fallback entries (client side) ───────────────────────

    /// Store an offline fallback value under its cache key.
    pub fn offline_put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_OFFLINE)?;
        let compressed = lz4_flex::compress_prepend_size(value);
        self.db
            .put_cf_opt(&cf, key.as_bytes(), &compressed, &self.write_opts())?;
        Ok(())
    }

    pub fn offline_get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_OFFLINE)?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn offline_delete(&self, key: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_OFFLINE)?;
        self.db.delete_cf(&cf, key.as_bytes())?;
        Ok(())
    }

    /// All offline cache keys currently stored.
    pub fn offline_keys(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_OFFLINE)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }
}

impl DocumentStorage for DocumentStore {
    fn load_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn upsert_document(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_META)?;

        let encoded = Self::encode(record)?;
        let revision = self.revision.load(Ordering::SeqCst).max(record.revision);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, record.id.as_bytes(), &encoded);
        batch.put_cf(&cf_meta, META_REVISION, revision.to_be_bytes());
        self.db.write_opt(batch, &self.write_opts())?;

        self.revision.store(revision, Ordering::SeqCst);
        Ok(())
    }

    fn append_history(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        let cf_history = self.cf(CF_HISTORY)?;
        let cf_meta = self.cf(CF_META)?;

        let seq = self.history_seq.fetch_add(1, Ordering::SeqCst);
        let key = Self::history_key(&entry.document_id, seq);
        let encoded = Self::encode(entry)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_history, &key, &encoded);
        batch.put_cf(&cf_meta, META_HISTORY_SEQ, (seq + 1).to_be_bytes());
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(())
    }

    fn history(&self, document_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let cf = self.cf(CF_HISTORY)?;

        let mut prefix = Vec::with_capacity(document_id.len() + 1);
        prefix.extend_from_slice(document_id.as_bytes());
        prefix.push(0);

        let mut entries = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            entries.push(Self::decode(&value)?);
        }
        Ok(entries)
    }

    fn latest_revision(&self) -> Result<u64, StoreError> {
        Ok(self.revision.load(Ordering::SeqCst))
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
