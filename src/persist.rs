//! Background persistence: document upserts and coalesced history.
//!
//! Acknowledgement happens before persistence, so jobs arrive on a bounded
//! queue via `try_send` and must never block a connection handler. Each job
//! upserts the document immediately; history entries are coalesced so that a
//! burst of saves from one author to one document inside
//! [`HISTORY_COALESCE_WINDOW`] produces a single entry spanning the burst's
//! first `before` and last `after`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::unix_millis;
use crate::storage::{DocumentRecord, DocumentStorage, HistoryEntry};

/// Saves by the same author to the same document inside this window
/// collapse into one history entry.
pub const HISTORY_COALESCE_WINDOW: Duration = Duration::from_secs(10);

/// Job queue depth; `submit` drops (with a log) beyond this.
pub const JOB_QUEUE_CAPACITY: usize = 1024;

/// Net insertion and removal between two document versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDiff {
    pub added: String,
    pub removed: String,
}

/// Diff two versions by stripping the longest common prefix and the longest
/// common suffix of the remainder; whatever is left in `after` was added,
/// whatever is left in `before` was removed. Splits stay on char boundaries.
pub fn compute_text_diff(before: &str, after: &str) -> TextDiff {
    let prefix = common_prefix_bytes(before, after);
    let (before_rest, after_rest) = (&before[prefix..], &after[prefix..]);
    let suffix = common_suffix_bytes(before_rest, after_rest);

    TextDiff {
        added: after_rest[..after_rest.len() - suffix].to_string(),
        removed: before_rest[..before_rest.len() - suffix].to_string(),
    }
}

fn common_prefix_bytes(a: &str, b: &str) -> usize {
    let mut len = 0;
    for (ca, cb) in a.chars().zip(b.chars()) {
        if ca != cb {
            break;
        }
        len += ca.len_utf8();
    }
    len
}

fn common_suffix_bytes(a: &str, b: &str) -> usize {
    let mut len = 0;
    for (ca, cb) in a.chars().rev().zip(b.chars().rev()) {
        if ca != cb {
            break;
        }
        len += ca.len_utf8();
    }
    len
}

/// One save to persist, submitted after the change was acknowledged.
#[derive(Debug, Clone)]
pub struct PersistJob {
    pub document_id: String,
    pub user_id: String,
    pub user_email: String,
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
    /// Live editor content, possibly with markup.
    pub content: String,
    /// Canonical plain text of this version; histories diff this.
    pub snapshot: String,
}

struct Burst {
    user_email: String,
    /// Snapshot text as stored before the burst began. `None` on a
    /// document's first version.
    before: Option<String>,
    after: String,
    deadline: Instant,
}

/// Owns the worker task and the job queue.
pub struct PersistenceWorker {
    tx: Option<mpsc::Sender<PersistJob>>,
    handle: Option<JoinHandle<()>>,
    revision: Arc<AtomicU64>,
}

impl PersistenceWorker {
    /// Spawn the worker over a storage backend. The revision counter resumes
    /// from the store's latest known revision.
    pub fn spawn(store: Arc<dyn DocumentStorage>, window: Duration) -> Self {
        let (tx, rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let revision = Arc::new(AtomicU64::new(
            store.latest_revision().unwrap_or_else(|e| {
                error!("revision recovery failed, restarting at 0: {}", e);
                0
            }),
        ));
        let handle = tokio::spawn(run_worker(store, rx, window, Arc::clone(&revision)));
        Self {
            tx: Some(tx),
            handle: Some(handle),
            revision,
        }
    }

    /// Queue a job without blocking. Returns `false` (and logs) when the
    /// queue is full or the worker has shut down.
    pub fn submit(&self, job: PersistJob) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!("persistence queue full, dropping save for {}", job.document_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn current_revision(&self) -> u64 {
        self.revision.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the worker to drain and flush all open
    /// bursts.
    pub async fn shutdown(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run_worker(
    store: Arc<dyn DocumentStorage>,
    mut rx: mpsc::Receiver<PersistJob>,
    window: Duration,
    revision: Arc<AtomicU64>,
) {
    // Open bursts keyed by (document, author).
    let mut bursts: HashMap<(String, String), Burst> = HashMap::new();

    loop {
        let next_deadline = bursts.values().map(|b| b.deadline).min();
        let job = match next_deadline {
            Some(deadline) => tokio::select! {
                job = rx.recv() => job,
                _ = tokio::time::sleep_until(deadline) => {
                    flush_expired(&store, &mut bursts).await;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        let Some(job) = job else {
            break;
        };
        apply_job(&store, &mut bursts, job, window, &revision).await;
    }

    // Queue closed: flush every open burst.
    for (key, burst) in bursts.drain() {
        flush_burst(store.as_ref(), key, burst);
    }
}

async fn apply_job(
    store: &Arc<dyn DocumentStorage>,
    bursts: &mut HashMap<(String, String), Burst>,
    job: PersistJob,
    window: Duration,
    revision: &AtomicU64,
) {
    let key = (job.document_id.clone(), job.user_id.clone());

    // A burst captures `before` from the stored snapshot at burst start, so
    // look it up before the upsert overwrites it.
    if !bursts.contains_key(&key) {
        let before = match store.load_document(&job.document_id) {
            Ok(record) => record.map(|r| r.snapshot_text),
            Err(e) => {
                error!("loading {} for history failed: {}", job.document_id, e);
                None
            }
        };
        bursts.insert(
            key.clone(),
            Burst {
                user_email: job.user_email.clone(),
                before,
                after: job.snapshot.clone(),
                deadline: Instant::now() + window,
            },
        );
    }

    let record = DocumentRecord {
        id: job.document_id.clone(),
        title: job.title.clone(),
        content: job.content.clone(),
        snapshot_text: job.snapshot.clone(),
        tags: job.tags.clone(),
        revision: revision.fetch_add(1, Ordering::Relaxed) + 1,
        updated_at: unix_millis(),
    };
    if let Err(e) = store.upsert_document(&record) {
        error!("persisting {} failed: {}", job.document_id, e);
    } else {
        debug!("persisted {} rev {}", record.id, record.revision);
    }

    if let Some(burst) = bursts.get_mut(&key) {
        burst.after = job.snapshot;
        burst.deadline = Instant::now() + window;
    }
}

async fn flush_expired(
    store: &Arc<dyn DocumentStorage>,
    bursts: &mut HashMap<(String, String), Burst>,
) {
    let now = Instant::now();
    let expired: Vec<(String, String)> = bursts
        .iter()
        .filter(|(_, b)| b.deadline <= now)
        .map(|(k, _)| k.clone())
        .collect();
    for key in expired {
        if let Some(burst) = bursts.remove(&key) {
            flush_burst(store.as_ref(), key, burst);
        }
    }
}

fn flush_burst(store: &dyn DocumentStorage, key: (String, String), burst: Burst) {
    let (document_id, user_id) = key;

    // A document's first version has nothing to diff against, and a burst
    // that ends where it began changed nothing worth recording.
    let Some(before) = burst.before else {
        return;
    };
    if before == burst.after {
        return;
    }

    let diff = compute_text_diff(&before, &burst.after);
    let entry = HistoryEntry {
        document_id: document_id.clone(),
        user_id: Some(user_id),
        user_email: Some(burst.user_email),
        before: Some(before),
        after: burst.after,
        added: Some(diff.added),
        removed: Some(diff.removed),
        created_at: unix_millis(),
    };
    if let Err(e) = store.append_history(&entry) {
        error!("appending history for {} failed: {}", document_id, e);
    }
}
