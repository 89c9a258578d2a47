//! # notesync — Real-time note synchronization engine
//!
//! Keeps concurrently edited documents synchronized across sessions over a
//! WebSocket binary protocol, with buffered flushing, acknowledged saves,
//! and a local offline fallback when the connection degrades.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket      ┌──────────────┐
//! │  SyncClient  │ ◄─────────────────► │  SyncServer  │
//! │  (per user)  │    Binary Proto     │  (central)   │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ ChangeBuffer │                     │  RoomBroker  │
//! │ OfflineCache │                     │  (fan-out)   │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                     ┌───────┴───────┐
//!                                     │ Persistence   │
//!                                     │ Worker + RocksDB
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded WireMessage)
//! - [`buffer`] — Flush heuristics: char threshold, word boundary, debounce
//! - [`supervisor`] — Failure fusion into the offline verdict
//! - [`transport`] — WebSocket channel plus an in-memory test duplex
//! - [`client`] — Editing session: flushing, acks, offline fallback
//! - [`cache`] — Keyed offline fallback store
//! - [`presence`] — Throttled cursor relay and remote caret tracking
//! - [`broker`] — Room-based fan-out with sender exclusion
//! - [`persist`] — Post-ack persistence with coalesced history
//! - [`server`] — WebSocket sync server
//! - [`storage`] — Document and history storage (RocksDB or in-memory)

pub mod broker;
pub mod buffer;
pub mod cache;
pub mod client;
pub mod persist;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use broker::{BrokerStats, Frame, RoomBroker};
pub use buffer::{ChangeBuffer, FlushSignal};
pub use cache::{OfflineCache, OfflineCacheEntry, OfflineCacheUpdate, cache_key};
pub use client::{SyncClient, SyncEvent};
pub use persist::{PersistJob, PersistenceWorker, TextDiff, compute_text_diff};
pub use presence::{CursorTracker, RemoteCursor};
pub use protocol::{
    AckResponse, ChangeMessage, ClientId, CursorMessage, ProtocolError, SessionInfo, Snapshot,
    WireMessage,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    DocumentRecord, DocumentStorage, DocumentStore, HistoryEntry, MemoryStore, StoreConfig,
    StoreError,
};
pub use supervisor::{ConnectionSupervisor, SyncStatus};
pub use transport::{TransportHandle, connect_ws};
