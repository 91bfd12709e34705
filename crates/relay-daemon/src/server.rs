//! WebSocket server for accepting peer connections.
//!
//! Peers connect to `/ws/{token}`, optionally with `?session_id=...` (or the
//! web client's `?whiteboard_id=...`) to join a session immediately. The
//! token is resolved through the configured identity provider before the
//! peer is admitted to the relay.

use crate::config::RelayLimits;
use crate::connection::PeerConnection;
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use relay_core::{ChannelSink, IdentityProvider, SignalingHandler};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// What a peer asked for in its connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub token: String,
    pub session_id: Option<String>,
}

impl ConnectRequest {
    /// Parse `.../ws/{token}?session_id=...`.
    ///
    /// Any path prefix is accepted so the relay can sit behind a proxy route
    /// such as `/api/webrtc/ws/{token}`.
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        let (_, token) = uri.path().rsplit_once("/ws/")?;
        if token.is_empty() || token.contains('/') {
            return None;
        }
        // Percent-decode the path segment
        let token = url::form_urlencoded::parse(format!("token={}", token).as_bytes())
            .next()
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();

        let mut session_id = None;
        if let Some(query) = uri.query() {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if (key == "session_id" || key == "whiteboard_id") && !value.is_empty() {
                    session_id = Some(value.into_owned());
                    break;
                }
            }
        }

        Some(Self { token, session_id })
    }
}

/// WebSocket server admitting peers into the relay.
pub struct RelayServer {
    handler: Arc<SignalingHandler>,
    identity: Arc<dyn IdentityProvider>,
    limits: RelayLimits,
}

impl RelayServer {
    /// Create a new server.
    pub fn new(
        handler: Arc<SignalingHandler>,
        identity: Arc<dyn IdentityProvider>,
        limits: RelayLimits,
    ) -> Self {
        Self {
            handler,
            identity,
            limits,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listen_addr);
        Ok(listener)
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.accept_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Handle a new incoming TCP connection through to its close.
    pub async fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let mut request = None;
        let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match ConnectRequest::from_uri(req.uri()) {
                Some(parsed) => {
                    request = Some(parsed);
                    Ok(response)
                }
                None => {
                    let mut rejection = ErrorResponse::new(Some("expected /ws/{token}".into()));
                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                    Err(rejection)
                }
            }
        };

        // Upgrade to WebSocket
        let ws_stream = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks connect and close without completing the
                // handshake; log those as debug, not error.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    warn!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };
        let Some(request) = request else {
            return;
        };

        let identity = match self.identity.resolve(&request.token).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Rejecting connection from {}: {}", addr, e);
                let mut ws_stream = ws_stream;
                let _ = ws_stream
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Policy,
                        reason: e.to_string().into(),
                    })))
                    .await;
                return;
            }
        };

        let (write, read) = ws_stream.split();
        let (sink, outbox) = ChannelSink::channel(self.limits.queue_capacity);
        let relay = self.handler.relay();
        let connection_id = relay.connect(&identity.peer_id, Box::new(sink), identity.info);
        info!(
            peer_id = %identity.peer_id,
            connection_id,
            %addr,
            "New connection"
        );

        let connection = PeerConnection::new(identity.peer_id.clone(), connection_id, write, outbox);
        if let Some(session_id) = &request.session_id {
            relay.join_session(&identity.peer_id, session_id);
        }

        connection
            .run(read, Arc::clone(&self.handler), self.limits.max_message_size)
            .await;
    }
}
