//! WebSocket sync server: accept loop, room routing, ack + persistence.
//!
//! Each connection runs its own handler task. Frames from room peers are
//! funneled through one per-connection channel (a forwarder task per joined
//! room), so the handler is a single select over the socket and that
//! channel. A `TextUpdate { seq: Some(_), .. }` is acknowledged immediately
//! after fan-out; persistence happens after the ack, on the background
//! worker, and never holds the ack hostage.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use crate::broker::{Frame, RoomBroker};
use crate::persist::{HISTORY_COALESCE_WINDOW, PersistJob, PersistenceWorker};
use crate::protocol::{AckResponse, ChangeMessage, ClientId, WireMessage};
use crate::storage::{DocumentStorage, DocumentStore, MemoryStore, StoreConfig};

const CONNECTION_QUEUE: usize = 256;

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Per-member frame queue depth in the broker.
    pub room_capacity: usize,
    pub max_members_per_room: usize,
    /// History coalescing window for the persistence worker.
    pub coalesce_window: Duration,
    /// Durable storage location; `None` keeps everything in memory.
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9400".to_string(),
            room_capacity: 128,
            max_members_per_room: 64,
            coalesce_window: HISTORY_COALESCE_WINDOW,
            storage_path: None,
        }
    }
}

/// Global counters, readable while the server runs.
#[derive(Default)]
pub struct ServerStats {
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,
    pub updates_relayed: AtomicU64,
}

impl ServerStats {
    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn relayed(&self) -> u64 {
        self.updates_relayed.load(Ordering::Relaxed)
    }
}

pub struct SyncServer {
    config: ServerConfig,
    broker: Arc<RoomBroker>,
    persistence: Arc<PersistenceWorker>,
    storage: Arc<dyn DocumentStorage>,
    stats: ServerStats,
}

impl SyncServer {
    /// Build a server, opening durable storage when the config names a
    /// path.
    pub fn new(config: ServerConfig) -> Result<Self, crate::storage::StoreError> {
        let storage: Arc<dyn DocumentStorage> = match &config.storage_path {
            Some(path) => Arc::new(DocumentStore::open(StoreConfig::new(path.clone()))?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_storage(config, storage))
    }

    pub fn with_defaults() -> Result<Self, crate::storage::StoreError> {
        Self::new(ServerConfig::default())
    }

    /// Plug in a prepared storage backend (shared with tests, or an
    /// injectable failing store).
    pub fn with_storage(config: ServerConfig, storage: Arc<dyn DocumentStorage>) -> Self {
        let broker = Arc::new(RoomBroker::with_capacity(config.room_capacity));
        let persistence = Arc::new(PersistenceWorker::spawn(
            Arc::clone(&storage),
            config.coalesce_window,
        ));
        Self {
            config,
            broker,
            persistence,
            storage,
            stats: ServerStats::default(),
        }
    }

    pub fn broker(&self) -> &Arc<RoomBroker> {
        &self.broker
    }

    pub fn storage(&self) -> &Arc<dyn DocumentStorage> {
        &self.storage
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Bind the configured address and return the listener, so callers
    /// (and tests binding port 0) can learn the actual address before
    /// serving.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept loop; runs until the listener errors.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("connection from {}", peer);
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.stats.total_connections.fetch_add(1, Ordering::Relaxed);
                server.stats.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = handle_connection(&server, stream).await {
                    debug!("connection from {} ended: {}", peer, e);
                }
                server.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Convenience: bind and serve in one call.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }
}

/// Per-connection room membership: the broker-side join plus the task
/// forwarding that room's frames into the connection channel.
struct Membership {
    room_id: String,
    forwarder: JoinHandle<()>,
}

async fn handle_connection(
    server: &Arc<SyncServer>,
    stream: TcpStream,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = accept_async(stream).await?;
    let (mut ws_writer, mut ws_reader) = ws.split();

    // All room traffic for this connection funnels through one channel.
    let (conn_tx, mut conn_rx) = mpsc::channel::<Frame>(CONNECTION_QUEUE);

    let mut client_id: Option<ClientId> = None;
    let mut memberships: Vec<Membership> = Vec::new();

    loop {
        tokio::select! {
            incoming = ws_reader.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!("socket error: {}", e);
                        break;
                    }
                    None => break,
                };
                let bytes = match msg {
                    Message::Binary(bytes) => bytes,
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                    other => {
                        debug!("ignoring non-binary frame: {:?}", other);
                        continue;
                    }
                };
                let frame = match WireMessage::decode(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("undecodable frame: {}", e);
                        continue;
                    }
                };
                let outcome = handle_frame(
                    server,
                    frame,
                    bytes.to_vec(),
                    &mut client_id,
                    &mut memberships,
                    &conn_tx,
                )
                .await;
                match outcome {
                    FrameOutcome::Continue => {}
                    FrameOutcome::Reply(reply) => {
                        if ws_writer.send(Message::Binary(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            forwarded = conn_rx.recv() => {
                // Senders are held by the forwarder tasks and by the local
                // conn_tx, so this never yields None while we are here.
                let Some(frame) = forwarded else { break };
                let bytes = frame.as_ref().clone();
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Connection over: sweep every membership, with synthesized leaves for
    // rooms the client never left explicitly.
    for membership in &memberships {
        membership.forwarder.abort();
    }
    if let Some(id) = &client_id {
        let swept = server.broker.disconnect(id).await;
        if !swept.is_empty() {
            debug!("client {} swept from {} room(s)", id, swept.len());
        }
    }
    Ok(())
}

enum FrameOutcome {
    Continue,
    /// Encoded frame to send straight back to this connection.
    Reply(Vec<u8>),
}

async fn handle_frame(
    server: &Arc<SyncServer>,
    frame: WireMessage,
    raw: Vec<u8>,
    client_id: &mut Option<ClientId>,
    memberships: &mut Vec<Membership>,
    conn_tx: &mpsc::Sender<Frame>,
) -> FrameOutcome {
    match frame {
        WireMessage::JoinRoom {
            room_id,
            client_id: sender,
            username,
        } => {
            if server.broker.members(&room_id).await >= server.config.max_members_per_room {
                warn!("room {} full, rejecting {}", room_id, sender);
                return FrameOutcome::Continue;
            }
            let mut room_rx = server.broker.join(&room_id, sender.clone(), &username).await;
            let tx = conn_tx.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(frame) = room_rx.recv().await {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
            });
            // A rejoin replaces the broker member; drop the stale
            // membership so one leave clears the room fully.
            if let Some(pos) = memberships.iter().position(|m| m.room_id == room_id) {
                memberships.remove(pos).forwarder.abort();
            }
            memberships.push(Membership { room_id, forwarder });
            *client_id = Some(sender);
            FrameOutcome::Continue
        }
        WireMessage::LeaveRoom {
            room_id,
            client_id: sender,
        } => {
            server.broker.leave(&room_id, &sender).await;
            if let Some(pos) = memberships.iter().position(|m| m.room_id == room_id) {
                let membership = memberships.remove(pos);
                membership.forwarder.abort();
            }
            FrameOutcome::Continue
        }
        WireMessage::TextUpdate { seq, change } => {
            let joined = memberships.iter().any(|m| m.room_id == change.document_id);
            if !joined {
                debug!(
                    "update for {} from non-member {}",
                    change.document_id, change.client_id
                );
                return match seq {
                    Some(seq) => ack_reply(seq, AckResponse::failed("not a room member")),
                    None => FrameOutcome::Continue,
                };
            }

            // Fan out the original encoded bytes; re-encoding buys nothing.
            server
                .broker
                .broadcast(&change.document_id, &change.client_id, Arc::new(raw))
                .await;
            server.stats.updates_relayed.fetch_add(1, Ordering::Relaxed);

            // Ack now; persistence is deliberately after the ack.
            let reply = match seq {
                Some(seq) => ack_reply(seq, AckResponse::Ok),
                None => FrameOutcome::Continue,
            };
            submit_persist(server, &change);
            reply
        }
        WireMessage::TitleUpdate {
            ref room_id,
            ref client_id,
            ..
        } => {
            relay(server, room_id.clone(), client_id.clone(), raw).await;
            FrameOutcome::Continue
        }
        WireMessage::CursorPosition {
            ref room_id,
            ref cursor,
        } => {
            relay(server, room_id.clone(), cursor.client_id.clone(), raw).await;
            FrameOutcome::Continue
        }
        WireMessage::DrawingData {
            ref room_id,
            ref client_id,
            ..
        } => {
            relay(server, room_id.clone(), client_id.clone(), raw).await;
            FrameOutcome::Continue
        }
        // Server-originated frames arriving from a client are bogus.
        WireMessage::UserJoined { .. } | WireMessage::UserLeft { .. } | WireMessage::Ack { .. } => {
            debug!("ignoring server-only frame from client");
            FrameOutcome::Continue
        }
    }
}

async fn relay(server: &Arc<SyncServer>, room_id: String, sender: ClientId, raw: Vec<u8>) {
    server.broker.broadcast(&room_id, &sender, Arc::new(raw)).await;
}

fn ack_reply(seq: u64, response: AckResponse) -> FrameOutcome {
    let ack = WireMessage::Ack { seq, response };
    match ack.encode() {
        Ok(encoded) => FrameOutcome::Reply(encoded),
        Err(e) => {
            error!("ack encode failed: {}", e);
            FrameOutcome::Continue
        }
    }
}

/// Queue the change for persistence when it carries a snapshot. Losing a
/// job here (full queue) is logged by the worker and never fails the ack.
fn submit_persist(server: &Arc<SyncServer>, change: &ChangeMessage) {
    let Some(snapshot) = &change.persist_snapshot else {
        return;
    };
    server.persistence.submit(PersistJob {
        document_id: change.document_id.clone(),
        user_id: change
            .user_id
            .clone()
            .unwrap_or_else(|| change.client_id.to_string()),
        user_email: change.user_email.clone().unwrap_or_default(),
        title: change.title.clone(),
        tags: change.tags.clone(),
        content: change.content.clone(),
        snapshot: snapshot.text.clone(),
    });
}
