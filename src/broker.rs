//! Room broker: keyed fan-out of encoded frames to room members.
//!
//! Each member holds a bounded mpsc receiver; `broadcast` walks the room and
//! `try_send`s an `Arc` of the encoded frame to every member except the
//! sender, so a client never receives its own update back. A member whose
//! channel is full loses that frame (counted in stats) rather than stalling
//! the room. Empty rooms are removed when their last member leaves.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use tokio::sync::RwLock;
use tokio::sync::mpsc;

use crate::protocol::{ClientId, WireMessage};

/// Per-member frame queue depth before drops kick in.
pub const MEMBER_QUEUE_CAPACITY: usize = 128;

/// Shared frame type: encoded once, cloned by reference per member.
pub type Frame = Arc<Vec<u8>>;

struct Member {
    username: String,
    tx: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct Room {
    members: HashMap<ClientId, Member>,
}

/// Fan-out counters, updated with relaxed atomics on the hot path.
#[derive(Default)]
pub struct BrokerStats {
    pub messages_sent: AtomicU64,
    pub messages_dropped: AtomicU64,
}

impl BrokerStats {
    pub fn sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }
}

/// Routes encoded frames between members of named rooms.
pub struct RoomBroker {
    rooms: RwLock<HashMap<String, Room>>,
    capacity: usize,
    stats: BrokerStats,
}

impl RoomBroker {
    pub fn new() -> Self {
        Self::with_capacity(MEMBER_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            stats: BrokerStats::default(),
        }
    }

    /// Add a member to a room, creating the room on first join. Existing
    /// members are notified with a `UserJoined` frame. Returns the member's
    /// frame receiver.
    pub async fn join(
        &self,
        room_id: &str,
        client_id: ClientId,
        username: &str,
    ) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_default();

        let joined = WireMessage::UserJoined {
            room_id: room_id.to_string(),
            client_id: client_id.clone(),
            username: username.to_string(),
        };
        if let Ok(encoded) = joined.encode() {
            let frame: Frame = Arc::new(encoded);
            for (member_id, member) in room.members.iter() {
                if *member_id == client_id {
                    continue;
                }
                self.deliver(member, &frame);
            }
        }

        room.members.insert(
            client_id.clone(),
            Member {
                username: username.to_string(),
                tx,
            },
        );
        debug!(
            "client {} joined room {} ({} members)",
            client_id,
            room_id,
            room.members.len()
        );
        rx
    }

    /// Remove a member, notify the remainder with `UserLeft`, and drop the
    /// room when it empties.
    pub async fn leave(&self, room_id: &str, client_id: &ClientId) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        if room.members.remove(client_id).is_none() {
            return;
        }

        let left = WireMessage::UserLeft {
            room_id: room_id.to_string(),
            client_id: client_id.clone(),
        };
        if let Ok(encoded) = left.encode() {
            let frame: Frame = Arc::new(encoded);
            for peer in room.members.values() {
                self.deliver(peer, &frame);
            }
        }

        if room.members.is_empty() {
            rooms.remove(room_id);
            debug!("room {} emptied, removed", room_id);
        }
    }

    /// Fan a frame out to every room member except `sender`.
    pub async fn broadcast(&self, room_id: &str, sender: &ClientId, frame: Frame) {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(room_id) else {
            return;
        };
        for (member_id, member) in room.members.iter() {
            if member_id == sender {
                continue;
            }
            self.deliver(member, &frame);
        }
    }

    /// Remove a client from every room it occupies, synthesizing leaves.
    /// Used when a connection drops without an explicit `leave-room`.
    pub async fn disconnect(&self, client_id: &ClientId) -> Vec<String> {
        let occupied: Vec<String> = {
            let rooms = self.rooms.read().await;
            rooms
                .iter()
                .filter(|(_, room)| room.members.contains_key(client_id))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for room_id in &occupied {
            self.leave(room_id, client_id).await;
        }
        occupied
    }

    fn deliver(&self, member: &Member, frame: &Frame) {
        match member.tx.try_send(Arc::clone(frame)) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("member queue full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub async fn members(&self, room_id: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|r| r.members.len()).unwrap_or(0)
    }

    /// Display names of a room's current members.
    pub async fn member_names(&self, room_id: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|r| r.members.values().map(|m| m.username.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }
}

impl Default for RoomBroker {
    fn default() -> Self {
        Self::new()
    }
}
