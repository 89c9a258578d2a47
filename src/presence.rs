//! Cursor relay: the throttled caret side-channel.
//!
//! Local caret movement is rate-limited to one emission per
//! [`CURSOR_THROTTLE`]; the server rebroadcasts cursor frames verbatim and
//! never persists them. Remote carets live in a map keyed by client id;
//! an entry is dropped on an explicit `user-left` or after
//! [`CURSOR_STALE_AFTER`] without updates, whichever comes first.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{ClientId, CursorMessage, unix_millis};

/// Minimum interval between local cursor emissions.
pub const CURSOR_THROTTLE: Duration = Duration::from_millis(50);
/// Untouched remote cursors are garbage-collected after this long.
pub const CURSOR_STALE_AFTER: Duration = Duration::from_secs(60);

/// One remote caret as the UI consumes it.
#[derive(Debug, Clone)]
pub struct RemoteCursor {
    pub client_id: ClientId,
    pub username: String,
    pub offset: u32,
    pub x: f32,
    pub y: f32,
    /// Sender-side timestamp of the latest applied update.
    pub ts: u64,
    /// Local receipt time, drives staleness GC.
    pub last_update: Instant,
}

/// Tracks the local throttle and the remote cursor map for one session.
pub struct CursorTracker {
    local_id: ClientId,
    username: String,
    remote: HashMap<ClientId, RemoteCursor>,
    last_emitted: Option<Instant>,
    throttle: Duration,
    stale_after: Duration,
}

impl CursorTracker {
    pub fn new(local_id: ClientId, username: impl Into<String>) -> Self {
        Self {
            local_id,
            username: username.into(),
            remote: HashMap::new(),
            last_emitted: None,
            throttle: CURSOR_THROTTLE,
            stale_after: CURSOR_STALE_AFTER,
        }
    }

    /// Custom intervals for tests.
    pub fn with_intervals(
        local_id: ClientId,
        username: impl Into<String>,
        throttle: Duration,
        stale_after: Duration,
    ) -> Self {
        let mut tracker = Self::new(local_id, username);
        tracker.throttle = throttle;
        tracker.stale_after = stale_after;
        tracker
    }

    /// Record local caret movement. Returns the message to emit, or `None`
    /// while throttled.
    pub fn update_local(&mut self, offset: u32, x: f32, y: f32) -> Option<CursorMessage> {
        if let Some(last) = self.last_emitted {
            if last.elapsed() < self.throttle {
                return None;
            }
        }
        self.last_emitted = Some(Instant::now());
        Some(CursorMessage {
            client_id: self.local_id.clone(),
            username: self.username.clone(),
            offset,
            x,
            y,
            ts: unix_millis(),
        })
    }

    /// Apply a remote cursor frame. Own echoes and stale (older `ts`)
    /// updates are ignored.
    pub fn apply(&mut self, msg: &CursorMessage) {
        if msg.client_id == self.local_id {
            return;
        }
        match self.remote.get_mut(&msg.client_id) {
            Some(existing) => {
                if msg.ts < existing.ts {
                    return;
                }
                existing.offset = msg.offset;
                existing.x = msg.x;
                existing.y = msg.y;
                existing.ts = msg.ts;
                existing.username = msg.username.clone();
                existing.last_update = Instant::now();
            }
            None => {
                self.remote.insert(
                    msg.client_id.clone(),
                    RemoteCursor {
                        client_id: msg.client_id.clone(),
                        username: msg.username.clone(),
                        offset: msg.offset,
                        x: msg.x,
                        y: msg.y,
                        ts: msg.ts,
                        last_update: Instant::now(),
                    },
                );
            }
        }
    }

    /// Drop a peer's caret on `user-left`.
    pub fn remove(&mut self, client_id: &ClientId) -> bool {
        self.remote.remove(client_id).is_some()
    }

    /// Remove carets untouched past the staleness window; returns the
    /// dropped ids.
    pub fn cleanup_stale(&mut self) -> Vec<ClientId> {
        let stale_after = self.stale_after;
        let stale: Vec<ClientId> = self
            .remote
            .iter()
            .filter(|(_, c)| c.last_update.elapsed() > stale_after)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.remote.remove(id);
        }
        stale
    }

    /// Current remote carets, after GC.
    pub fn cursors(&mut self) -> Vec<RemoteCursor> {
        self.cleanup_stale();
        self.remote.values().cloned().collect()
    }

    pub fn cursor(&self, client_id: &ClientId) -> Option<&RemoteCursor> {
        self.remote.get(client_id)
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }
}
