//! Individual peer connection management.
//!
//! Each admitted peer gets a writer task that drains its outbound queue into
//! the WebSocket, while the read loop feeds inbound frames to the signaling
//! handler. When either side fails the peer is cleaned up through the relay.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::{ConnectionId, Frame, HandleOutcome, SignalingHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// How long teardown waits for the writer to flush before aborting it.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a connection's read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of stream
    RemoteClosed,
    /// Transport error
    NetworkError,
    /// The handler asked to drop the connection
    ProtocolError,
}

/// A live, admitted WebSocket connection.
pub struct PeerConnection {
    pub peer_id: String,
    pub connection_id: ConnectionId,
    /// Handle to the write task
    write_task: Option<JoinHandle<()>>,
}

impl PeerConnection {
    /// Take over an upgraded socket for an admitted peer.
    ///
    /// Spawns the write task, which drains `outbox` until the relay drops
    /// the peer's sink.
    pub fn new(
        peer_id: String,
        connection_id: ConnectionId,
        write: WsSink,
        outbox: mpsc::Receiver<Frame>,
    ) -> Self {
        let write_peer_id = peer_id.clone();
        let write_task = tokio::spawn(async move {
            Self::write_loop(write_peer_id, write, outbox).await;
        });

        Self {
            peer_id,
            connection_id,
            write_task: Some(write_task),
        }
    }

    /// Write loop that forwards queued frames to the socket.
    ///
    /// On a write error the loop exits and drops `outbox`; later deliveries
    /// to this peer then fail and the relay cleans it up.
    async fn write_loop(peer_id: String, mut write: WsSink, mut outbox: mpsc::Receiver<Frame>) {
        while let Some(frame) = outbox.recv().await {
            if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Write side of {} closed", peer_id);
                    }
                    _ => {
                        warn!("Failed to write to {}: {}", peer_id, e);
                    }
                }
                return;
            }
        }

        // Sink dropped by the relay: peer removed or superseded
        debug!("Outbox for {} closed, sending close frame", peer_id);
        let _ = write.send(Message::Close(None)).await;
    }

    /// Run the read loop until the connection ends, then clean up.
    pub async fn run(
        mut self,
        read: WsSource,
        handler: Arc<SignalingHandler>,
        max_message_size: usize,
    ) -> CloseReason {
        let reason = self.read_loop(read, &handler, max_message_size).await;

        let removed = handler
            .relay()
            .disconnect_connection(&self.peer_id, self.connection_id);
        info!(
            peer_id = %self.peer_id,
            connection_id = self.connection_id,
            ?reason,
            removed,
            "Connection closed"
        );

        // The sink is gone, so the writer flushes a close frame and exits
        if let Some(mut task) = self.write_task.take() {
            if tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                debug!("Writer for {} did not finish, aborting", self.peer_id);
                task.abort();
            }
        }
        reason
    }

    async fn read_loop(
        &self,
        mut read: WsSource,
        handler: &SignalingHandler,
        max_message_size: usize,
    ) -> CloseReason {
        loop {
            let data = match read.next().await {
                Some(Ok(msg)) => match msg {
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(data) => data,
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame from {}", self.peer_id);
                        return CloseReason::RemoteClosed;
                    }
                },
                Some(Err(e)) => {
                    return match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", self.peer_id);
                            CloseReason::RemoteClosed
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", self.peer_id, e);
                            CloseReason::NetworkError
                        }
                    };
                }
                None => {
                    debug!("Connection {} stream ended", self.peer_id);
                    return CloseReason::RemoteClosed;
                }
            };

            if data.len() > max_message_size {
                warn!(
                    "Message from {} exceeds max size ({} > {}), dropping",
                    self.peer_id,
                    data.len(),
                    max_message_size
                );
                continue;
            }

            match handler
                .handle_frame(&self.peer_id, self.connection_id, &data)
                .await
            {
                HandleOutcome::Continue => {}
                HandleOutcome::Disconnect => return CloseReason::ProtocolError,
            }
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
    }
}
