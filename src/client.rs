//! Client session: buffering, flushing, acknowledgment, offline fallback.
//!
//! One [`SyncClient`] owns one editing session against one document room.
//! Local edits go through the [`ChangeBuffer`](crate::buffer::ChangeBuffer)
//! heuristics; flushes are acknowledged round trips correlated by `seq`,
//! with at most one in flight. Failures feed the
//! [`ConnectionSupervisor`](crate::supervisor::ConnectionSupervisor); once
//! the verdict flips offline, edits land in the [`OfflineCache`] instead of
//! the wire, and the transport is torn down until something re-arms the
//! session.
//!
//! Remote traffic surfaces on a [`SyncEvent`] stream; the coarse
//! `Synchronized / Saving / Unsynchronized` status is a `watch` channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::buffer::{ChangeBuffer, DEBOUNCE, FlushSignal};
use crate::cache::{OfflineCache, OfflineCacheUpdate};
use crate::presence::{CursorTracker, RemoteCursor};
use crate::protocol::{
    AckResponse, ChangeMessage, CursorMessage, SessionInfo, Snapshot, WireMessage, unix_millis,
};
use crate::supervisor::{ConnectionSupervisor, SyncStatus};
use crate::transport::TransportHandle;

/// How long a flush waits for its ack before counting as failed.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 256;

/// Remote activity surfaced to the embedding editor.
#[derive(Debug)]
pub enum SyncEvent {
    /// Transport attached and the room was joined.
    Connected,
    /// Transport went away; the session is offline until re-armed.
    Disconnected,
    /// Another session changed the document.
    RemoteChange(ChangeMessage),
    /// Another session changed the title.
    RemoteTitle { title: String, ts: u64 },
    /// Another session moved its caret.
    CursorMoved(CursorMessage),
    /// Freehand canvas payload from another session.
    Drawing { payload: Vec<u8> },
    PeerJoined { username: String },
    PeerLeft,
}

/// Derives the persistable plain text from live (possibly marked-up)
/// editor content.
pub type SnapshotFn = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Called with the exact change a successful round trip committed.
pub type CommitObserver = Box<dyn Fn(&ChangeMessage) + Send + Sync>;

#[derive(Default)]
struct Metadata {
    title: Option<String>,
    tags: Option<Vec<String>>,
    user_id: Option<String>,
    user_email: Option<String>,
}

struct ClientInner {
    session: SessionInfo,
    transport: Mutex<Option<TransportHandle>>,
    supervisor: Mutex<ConnectionSupervisor>,
    buffer: Mutex<ChangeBuffer>,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<AckResponse>>>,
    cursors: Mutex<CursorTracker>,
    last_local_cursor: Mutex<Option<CursorMessage>>,
    metadata: Mutex<Metadata>,
    snapshot_fn: Mutex<Option<SnapshotFn>>,
    commit_observer: Mutex<Option<CommitObserver>>,
    debounce: Mutex<Option<JoinHandle<()>>>,
    cache: OfflineCache,
    status_tx: watch::Sender<SyncStatus>,
    event_tx: mpsc::Sender<SyncEvent>,
    next_seq: AtomicU64,
    in_flight: AtomicBool,
    /// Bumped on every attach and teardown, so a read loop left over from
    /// a replaced transport can tell it is stale and exit silently.
    transport_gen: AtomicU64,
}

/// Handle to one document synchronization session. Cheap to clone.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
    event_rx: Arc<Mutex<Option<mpsc::Receiver<SyncEvent>>>>,
}

impl SyncClient {
    pub fn new(session: SessionInfo) -> Self {
        Self::with_cache(session, OfflineCache::new())
    }

    /// Use a shared (possibly durable) offline cache.
    pub fn with_cache(session: SessionInfo, cache: OfflineCache) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::Unsynchronized);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let cursors = CursorTracker::new(session.client_id.clone(), session.username.clone());
        let inner = Arc::new(ClientInner {
            session,
            transport: Mutex::new(None),
            supervisor: Mutex::new(ConnectionSupervisor::new()),
            buffer: Mutex::new(ChangeBuffer::new()),
            pending_acks: Mutex::new(HashMap::new()),
            cursors: Mutex::new(cursors),
            last_local_cursor: Mutex::new(None),
            metadata: Mutex::new(Metadata::default()),
            snapshot_fn: Mutex::new(None),
            commit_observer: Mutex::new(None),
            debounce: Mutex::new(None),
            cache,
            status_tx,
            event_tx,
            next_seq: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            transport_gen: AtomicU64::new(0),
        });
        Self {
            inner,
            event_rx: Arc::new(Mutex::new(Some(event_rx))),
        }
    }

    pub fn session(&self) -> &SessionInfo {
        &self.inner.session
    }

    /// The remote-activity stream. Yields `Some` exactly once.
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        lock(&self.event_rx).take()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        *self.inner.status_tx.borrow()
    }

    /// Install the plain-text derivation used for persisted snapshots.
    /// Without one, the live content is persisted as-is.
    pub fn set_snapshot_fn(&self, f: SnapshotFn) {
        *lock(&self.inner.snapshot_fn) = Some(f);
    }

    /// Observe every successfully acknowledged change (snapshot, title,
    /// tags as they were committed).
    pub fn on_committed(&self, f: CommitObserver) {
        *lock(&self.inner.commit_observer) = Some(f);
    }

    pub fn set_title(&self, title: impl Into<String>) {
        lock(&self.inner.metadata).title = Some(title.into());
    }

    pub fn set_tags(&self, tags: Vec<String>) {
        lock(&self.inner.metadata).tags = Some(tags);
    }

    pub fn set_user(&self, user_id: impl Into<String>, user_email: impl Into<String>) {
        let mut meta = lock(&self.inner.metadata);
        meta.user_id = Some(user_id.into());
        meta.user_email = Some(user_email.into());
    }

    pub fn cache(&self) -> &OfflineCache {
        &self.inner.cache
    }

    pub fn is_offline(&self) -> bool {
        lock(&self.inner.supervisor).offline()
    }

    pub fn has_unsynced(&self) -> bool {
        lock(&self.inner.buffer).has_unsynced()
    }

    /// Dial a WebSocket server and attach the resulting transport.
    pub async fn connect(&self, url: &str) -> Result<(), crate::protocol::ProtocolError> {
        let (handle, incoming) = crate::transport::connect_ws(url).await?;
        self.attach_transport(handle, incoming).await;
        Ok(())
    }

    /// Attach a connected transport: re-arm the failure counters, join the
    /// room, and start consuming the incoming stream.
    pub async fn attach_transport(
        &self,
        handle: TransportHandle,
        incoming: mpsc::Receiver<Vec<u8>>,
    ) {
        lock(&self.inner.supervisor).rearm();
        *lock(&self.inner.transport) = Some(handle.clone());
        let generation = self.inner.transport_gen.fetch_add(1, Ordering::SeqCst) + 1;

        let join = WireMessage::JoinRoom {
            room_id: self.inner.session.room_id.clone(),
            client_id: self.inner.session.client_id.clone(),
            username: self.inner.session.username.clone(),
        };
        match join.encode() {
            Ok(frame) => {
                if let Err(e) = handle.send(frame).await {
                    warn!("join send failed: {}", e);
                }
            }
            Err(e) => warn!("join encode failed: {}", e),
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(read_loop(inner, incoming, generation));

        let _ = self.inner.status_tx.send(SyncStatus::Synchronized);
        let _ = self.inner.event_tx.send(SyncEvent::Connected).await;
    }

    /// Host network state changed. Going offline tears the transport down
    /// and suppresses reconnection; coming back online re-arms the
    /// counters, after which the caller attaches a fresh transport.
    pub fn set_host_online(&self, online: bool) {
        lock(&self.inner.supervisor).set_host_online(online);
        if !online {
            self.inner.teardown_transport();
            let _ = self.inner.status_tx.send(SyncStatus::Unsynchronized);
        }
    }

    /// Feed one local text state through the flush heuristics.
    ///
    /// While the session is offline (or has no transport) the state goes to
    /// the offline cache instead; nothing is sent and nothing re-arms here.
    /// An edit arriving mid-flight is cached for durability and buffered;
    /// the flush loop sends the latest state once the current trip ends.
    pub fn emit_local_change(&self, text: &str) {
        let signal = lock(&self.inner.buffer).observe(text);

        if self.is_offline() || lock(&self.inner.transport).is_none() {
            self.inner.cache_fallback(text, false);
            return;
        }
        if self.inner.in_flight.load(Ordering::SeqCst) {
            self.inner.cache_fallback(text, false);
            return;
        }

        match signal {
            FlushSignal::Immediate => {
                self.inner.cancel_debounce();
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { flush(inner).await });
            }
            FlushSignal::Debounce => {
                let inner = Arc::clone(&self.inner);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(DEBOUNCE).await;
                    flush(inner).await;
                });
                let mut debounce = lock(&self.inner.debounce);
                if let Some(prev) = debounce.replace(handle) {
                    prev.abort();
                }
            }
        }
    }

    /// Flush the current candidate immediately, skipping the heuristics.
    pub async fn flush_now(&self) {
        self.inner.cancel_debounce();
        flush(Arc::clone(&self.inner)).await;
    }

    /// Report local caret movement; emits a throttled cursor frame.
    pub async fn set_local_cursor(&self, offset: u32, x: f32, y: f32) {
        let msg = match lock(&self.inner.cursors).update_local(offset, x, y) {
            Some(msg) => msg,
            None => return,
        };
        *lock(&self.inner.last_local_cursor) = Some(msg.clone());

        if self.is_offline() {
            return;
        }
        let Some(handle) = lock(&self.inner.transport).clone() else {
            return;
        };
        let frame = WireMessage::CursorPosition {
            room_id: self.inner.session.room_id.clone(),
            cursor: msg,
        };
        // Side channel: a lost cursor frame is harmless.
        if let Ok(encoded) = frame.encode() {
            let _ = handle.send(encoded).await;
        }
    }

    /// Remote carets, stale entries dropped.
    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        lock(&self.inner.cursors).cursors()
    }

    /// Broadcast a title change (metadata only, never acknowledged).
    pub async fn emit_title_change(&self, title: impl Into<String>) {
        let title = title.into();
        lock(&self.inner.metadata).title = Some(title.clone());

        if self.is_offline() {
            return;
        }
        let Some(handle) = lock(&self.inner.transport).clone() else {
            return;
        };
        let frame = WireMessage::TitleUpdate {
            room_id: self.inner.session.room_id.clone(),
            client_id: self.inner.session.client_id.clone(),
            title,
            ts: unix_millis(),
        };
        if let Ok(encoded) = frame.encode() {
            let _ = handle.send(encoded).await;
        }
    }

    /// Relay an opaque canvas payload.
    pub async fn emit_drawing(&self, payload: Vec<u8>) {
        if self.is_offline() {
            return;
        }
        let Some(handle) = lock(&self.inner.transport).clone() else {
            return;
        };
        let frame = WireMessage::DrawingData {
            room_id: self.inner.session.room_id.clone(),
            client_id: self.inner.session.client_id.clone(),
            payload,
        };
        if let Ok(encoded) = frame.encode() {
            let _ = handle.send(encoded).await;
        }
    }

    /// Tear the session down: best-effort final flush, explicit leave,
    /// transport disconnect. Unsynced edits that fail the final flush stay
    /// in the offline cache.
    pub async fn close(&self) {
        self.inner.cancel_debounce();

        if !self.is_offline() && lock(&self.inner.transport).is_some() {
            flush(Arc::clone(&self.inner)).await;

            let handle = lock(&self.inner.transport).clone();
            if let Some(handle) = handle {
                let leave = WireMessage::LeaveRoom {
                    room_id: self.inner.session.room_id.clone(),
                    client_id: self.inner.session.client_id.clone(),
                };
                if let Ok(encoded) = leave.encode() {
                    let _ = handle.send(encoded).await;
                }
            }
        }
        self.inner.teardown_transport();
        let _ = self.inner.status_tx.send(SyncStatus::Unsynchronized);
    }
}

impl ClientInner {
    fn cancel_debounce(&self) {
        if let Some(handle) = lock(&self.debounce).take() {
            handle.abort();
        }
    }

    fn teardown_transport(&self) {
        self.transport_gen.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = lock(&self.transport).take() {
            handle.disconnect();
        }
        // Waiters on in-flight acks resolve as transport failures.
        lock(&self.pending_acks).clear();
    }

    /// Route `content` to the offline cache with the session's metadata.
    fn cache_fallback(&self, content: &str, api_failed: bool) {
        let meta = lock(&self.metadata);
        let snapshot = self.plain_text(content);
        self.cache.upsert(OfflineCacheUpdate {
            document_id: self.session.room_id.clone(),
            content: content.to_string(),
            title: meta.title.clone(),
            content_snapshot: Some(snapshot),
            tags: meta.tags.clone(),
            user_id: meta.user_id.clone(),
            api_failed,
        });
    }

    fn plain_text(&self, content: &str) -> String {
        match lock(&self.snapshot_fn).as_ref() {
            Some(f) => f(content),
            None => content.to_string(),
        }
    }

    fn build_change(&self, content: String) -> ChangeMessage {
        let meta = lock(&self.metadata);
        let snapshot = Snapshot::new(self.plain_text(&content));
        ChangeMessage {
            client_id: self.session.client_id.clone(),
            timestamp: unix_millis(),
            document_id: self.session.room_id.clone(),
            user_id: meta.user_id.clone(),
            user_email: meta.user_email.clone(),
            content,
            title: meta.title.clone(),
            tags: meta.tags.clone(),
            persist_snapshot: Some(snapshot),
            cursor: lock(&self.last_local_cursor).clone(),
        }
    }
}

/// Drain candidates through acknowledged round trips, one at a time.
///
/// The `in_flight` guard makes concurrent callers no-ops: edits arriving
/// mid-flight accumulate in the buffer and the loop picks them up as a
/// follow-up once the current trip succeeds.
async fn flush(inner: Arc<ClientInner>) {
    if inner
        .in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    loop {
        let drained = drain(&inner).await;
        inner.in_flight.store(false, Ordering::SeqCst);

        // An edit can land between the final empty take and the flag
        // clearing above; without this re-check it would sit in the buffer
        // until the next edit or an explicit flush.
        if !drained || !lock(&inner.buffer).has_unsynced() {
            break;
        }
        if inner
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            break;
        }
    }
}

/// Send candidates until the buffer runs dry. Returns `true` only on that
/// clean exit; offline and failed trips return `false` so the caller does
/// not immediately retry an uncommitted candidate.
async fn drain(inner: &Arc<ClientInner>) -> bool {
    loop {
        if lock(&inner.supervisor).offline() {
            if let Some(candidate) = lock(&inner.buffer).take_candidate() {
                inner.cache_fallback(&candidate, true);
            }
            return false;
        }
        let Some(candidate) = lock(&inner.buffer).take_candidate() else {
            return true;
        };
        if !round_trip(inner, candidate).await {
            return false;
        }
    }
}

/// One acknowledged send. Returns `true` on a confirmed ack.
async fn round_trip(inner: &Arc<ClientInner>, candidate: String) -> bool {
    let Some(handle) = lock(&inner.transport).clone() else {
        inner.cache_fallback(&candidate, false);
        return false;
    };

    let _ = inner.status_tx.send(SyncStatus::Saving);

    let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
    let change = inner.build_change(candidate.clone());
    let frame = WireMessage::TextUpdate {
        seq: Some(seq),
        change: change.clone(),
    };
    let encoded = match frame.encode() {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!("change encode failed: {}", e);
            inner.cache_fallback(&candidate, true);
            return false;
        }
    };

    let (ack_tx, ack_rx) = oneshot::channel();
    lock(&inner.pending_acks).insert(seq, ack_tx);

    if let Err(e) = handle.send(encoded).await {
        debug!("send failed for seq {}: {}", seq, e);
        lock(&inner.pending_acks).remove(&seq);
        let offline = lock(&inner.supervisor).record_transport_failure();
        on_failure(inner, &candidate, offline);
        return false;
    }

    match tokio::time::timeout(ACK_TIMEOUT, ack_rx).await {
        Ok(Ok(AckResponse::Ok)) => {
            lock(&inner.supervisor).record_success();
            lock(&inner.buffer).commit(&candidate);
            inner.cache.remove(&inner.session.room_id);
            let _ = inner.status_tx.send(SyncStatus::Synchronized);
            if let Some(observer) = lock(&inner.commit_observer).as_ref() {
                observer(&change);
            }
            true
        }
        Ok(Ok(AckResponse::Failed { error })) => {
            debug!("seq {} nacked: {}", seq, error);
            lock(&inner.pending_acks).remove(&seq);
            let offline = lock(&inner.supervisor).record_app_failure();
            on_failure(inner, &candidate, offline);
            false
        }
        Ok(Err(_)) => {
            // Ack sender dropped: the read loop died under us.
            lock(&inner.pending_acks).remove(&seq);
            let offline = lock(&inner.supervisor).record_transport_failure();
            on_failure(inner, &candidate, offline);
            false
        }
        Err(_) => {
            debug!("seq {} timed out", seq);
            lock(&inner.pending_acks).remove(&seq);
            let offline = lock(&inner.supervisor).record_app_failure();
            on_failure(inner, &candidate, offline);
            false
        }
    }
}

fn on_failure(inner: &Arc<ClientInner>, candidate: &str, offline: bool) {
    if offline {
        inner.teardown_transport();
    }
    let _ = inner.status_tx.send(SyncStatus::Unsynchronized);
    inner.cache_fallback(candidate, true);
}

/// Consume the incoming frame stream until it ends.
async fn read_loop(inner: Arc<ClientInner>, mut incoming: mpsc::Receiver<Vec<u8>>, generation: u64) {
    while let Some(bytes) = incoming.recv().await {
        let msg = match WireMessage::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping undecodable frame: {}", e);
                continue;
            }
        };
        dispatch(&inner, msg).await;
    }

    // Stream ended. If the transport was already replaced or torn down,
    // this loop is stale and must not touch the session state.
    if inner.transport_gen.load(Ordering::SeqCst) != generation {
        return;
    }

    // The channel is gone. One transport failure is enough for the
    // offline verdict.
    lock(&inner.supervisor).record_transport_failure();
    inner.teardown_transport();
    let _ = inner.status_tx.send(SyncStatus::Unsynchronized);
    let _ = inner.event_tx.send(SyncEvent::Disconnected).await;
}

async fn dispatch(inner: &Arc<ClientInner>, msg: WireMessage) {
    let own = &inner.session.client_id;
    match msg {
        WireMessage::Ack { seq, response } => {
            if let Some(tx) = lock(&inner.pending_acks).remove(&seq) {
                let _ = tx.send(response);
            }
        }
        WireMessage::TextUpdate { change, .. } => {
            if change.client_id == *own {
                return;
            }
            if let Some(cursor) = &change.cursor {
                lock(&inner.cursors).apply(cursor);
            }
            let _ = inner.event_tx.send(SyncEvent::RemoteChange(change)).await;
        }
        WireMessage::TitleUpdate {
            client_id, title, ts, ..
        } => {
            if client_id == *own {
                return;
            }
            lock(&inner.metadata).title = Some(title.clone());
            let _ = inner
                .event_tx
                .send(SyncEvent::RemoteTitle { title, ts })
                .await;
        }
        WireMessage::CursorPosition { cursor, .. } => {
            if cursor.client_id == *own {
                return;
            }
            lock(&inner.cursors).apply(&cursor);
            let _ = inner.event_tx.send(SyncEvent::CursorMoved(cursor)).await;
        }
        WireMessage::DrawingData {
            client_id, payload, ..
        } => {
            if client_id == *own {
                return;
            }
            let _ = inner.event_tx.send(SyncEvent::Drawing { payload }).await;
        }
        WireMessage::UserJoined {
            client_id, username, ..
        } => {
            if client_id == *own {
                return;
            }
            let _ = inner
                .event_tx
                .send(SyncEvent::PeerJoined { username })
                .await;
        }
        WireMessage::UserLeft { client_id, .. } => {
            if client_id == *own {
                return;
            }
            lock(&inner.cursors).remove(&client_id);
            let _ = inner.event_tx.send(SyncEvent::PeerLeft).await;
        }
        // Client-to-server frames never arrive here.
        WireMessage::JoinRoom { .. } | WireMessage::LeaveRoom { .. } => {}
    }
}

/// Poisoned locks are unrecoverable logic bugs; inherit the inner state.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::duplex;

    fn client() -> SyncClient {
        SyncClient::new(SessionInfo::new("doc-1", "alice"))
    }

    #[tokio::test]
    async fn test_offline_edit_goes_to_cache() {
        let c = client();
        // No transport attached: every edit falls back to the cache.
        c.emit_local_change("draft text");
        let entry = c.cache().get("doc-1").unwrap();
        assert_eq!(entry.content, "draft text");
        assert!(entry.offline);
    }

    #[tokio::test]
    async fn test_event_rx_taken_once() {
        let c = client();
        assert!(c.take_event_rx().is_some());
        assert!(c.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_attach_sends_join() {
        let c = client();
        let (handle, incoming, mut peer) = duplex();
        c.attach_transport(handle, incoming).await;

        let frame = peer.from_client.recv().await.unwrap();
        match WireMessage::decode(&frame).unwrap() {
            WireMessage::JoinRoom {
                room_id, username, ..
            } => {
                assert_eq!(room_id, "doc-1");
                assert_eq!(username, "alice");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(c.status(), SyncStatus::Synchronized);
    }

    #[tokio::test]
    async fn test_metadata_flows_into_change() {
        let c = client();
        c.set_user("u-1", "alice@example.com");
        c.set_title("Meeting notes");
        c.set_tags(vec!["work".to_string()]);

        let (handle, incoming, mut peer) = duplex();
        c.attach_transport(handle, incoming).await;
        let _join = peer.from_client.recv().await.unwrap();

        c.emit_local_change("0123456789"); // threshold: immediate flush
        let frame = peer.from_client.recv().await.unwrap();
        match WireMessage::decode(&frame).unwrap() {
            WireMessage::TextUpdate { seq, change } => {
                assert!(seq.is_some());
                assert_eq!(change.user_id.as_deref(), Some("u-1"));
                assert_eq!(change.title.as_deref(), Some("Meeting notes"));
                assert_eq!(change.persist_snapshot.unwrap().text, "0123456789");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_snapshot_fn_strips_markup() {
        let c = client();
        c.set_snapshot_fn(Box::new(|content| content.replace("**", "")));

        let (handle, incoming, mut peer) = duplex();
        c.attach_transport(handle, incoming).await;
        let _join = peer.from_client.recv().await.unwrap();

        c.emit_local_change("**bold** statement");
        let frame = peer.from_client.recv().await.unwrap();
        match WireMessage::decode(&frame).unwrap() {
            WireMessage::TextUpdate { change, .. } => {
                assert_eq!(change.content, "**bold** statement");
                assert_eq!(change.persist_snapshot.unwrap().text, "bold statement");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
