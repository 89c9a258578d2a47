//! Transport seam for one session.
//!
//! The client receives a constructor-injected [`TransportHandle`] plus an
//! incoming frame receiver — no shared connection registry. Two
//! constructors ship: [`connect_ws`] for a real WebSocket, and
//! [`duplex`] for an in-memory pair driven by tests.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::ProtocolError;

/// Frames buffered per direction before senders start waiting.
const CHANNEL_CAPACITY: usize = 256;

/// Outbound half of a session's channel.
#[derive(Clone)]
pub struct TransportHandle {
    outgoing: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

impl TransportHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send one encoded frame. Fails once the channel is down.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Tear the channel down; all further sends fail.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Connect a WebSocket transport.
///
/// Spawns a writer task draining the outgoing channel into the socket and
/// a reader task forwarding binary frames to the returned receiver. The
/// receiver yields `None` when the socket closes or errors.
pub async fn connect_ws(
    url: &str,
) -> Result<(TransportHandle, mpsc::Receiver<Vec<u8>>), ProtocolError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let connected = Arc::new(AtomicBool::new(true));
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);

    let writer_connected = connected.clone();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if !writer_connected.load(Ordering::SeqCst) {
                break;
            }
            if ws_writer.send(Message::Binary(frame.into())).await.is_err() {
                writer_connected.store(false, Ordering::SeqCst);
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    let reader_connected = connected.clone();
    tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    if in_tx.send(bytes).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        reader_connected.store(false, Ordering::SeqCst);
        // Dropping in_tx ends the client's incoming stream.
    });

    Ok((TransportHandle { outgoing: out_tx, connected }, in_rx))
}

/// The far end of an in-memory transport pair.
pub struct DuplexPeer {
    /// Frames the client sent.
    pub from_client: mpsc::Receiver<Vec<u8>>,
    /// Inject frames toward the client.
    pub to_client: mpsc::Sender<Vec<u8>>,
}

/// In-memory transport pair for tests: a handle plus incoming receiver for
/// the client, and the scripted peer on the other side. Dropping the
/// peer's `to_client` sender simulates a transport-level disconnect.
pub fn duplex() -> (TransportHandle, mpsc::Receiver<Vec<u8>>, DuplexPeer) {
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = TransportHandle {
        outgoing: out_tx,
        connected: Arc::new(AtomicBool::new(true)),
    };
    let peer = DuplexPeer {
        from_client: out_rx,
        to_client: in_tx,
    };
    (handle, in_rx, peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_frame_flow() {
        let (handle, mut incoming, mut peer) = duplex();

        handle.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(peer.from_client.recv().await.unwrap(), vec![1, 2, 3]);

        peer.to_client.send(vec![4, 5]).await.unwrap();
        assert_eq!(incoming.recv().await.unwrap(), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let (handle, _incoming, _peer) = duplex();
        assert!(handle.is_connected());

        handle.disconnect();
        assert!(!handle.is_connected());
        assert!(handle.send(vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn test_peer_drop_ends_incoming_stream() {
        let (_handle, mut incoming, peer) = duplex();
        drop(peer);
        assert!(incoming.recv().await.is_none());
    }
}
