//! Inbound message routing.
//!
//! `SignalingHandler` classifies each frame a peer sends and calls the
//! matching `Relay` operation. Malformed messages are dropped and the
//! connection stays open; undecodable frames ask the caller to disconnect.

use crate::protocol::Inbound;
use crate::registry::ConnectionId;
use crate::relay::Relay;
use crate::store::{DrawingElement, WhiteboardStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the connection loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Continue,
    Disconnect,
}

pub struct SignalingHandler {
    relay: Arc<Relay>,
    /// Receives relayed drawing elements when persistence is enabled.
    store: Option<Arc<dyn WhiteboardStore>>,
}

impl SignalingHandler {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay, store: None }
    }

    pub fn with_store(mut self, store: Arc<dyn WhiteboardStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Handle one raw frame from `peer_id` on `connection_id`.
    pub async fn handle_frame(
        &self,
        peer_id: &str,
        connection_id: ConnectionId,
        data: &[u8],
    ) -> HandleOutcome {
        if !self.relay.is_current_connection(peer_id, connection_id) {
            debug!(peer_id, connection_id, "Frame from superseded connection");
            return HandleOutcome::Disconnect;
        }

        match Inbound::parse(data) {
            Ok(message) => {
                self.dispatch(peer_id, message).await;
                HandleOutcome::Continue
            }
            Err(e) if e.is_fatal() => {
                warn!(peer_id, error = %e, "Undecodable frame, disconnecting");
                HandleOutcome::Disconnect
            }
            Err(e) => {
                warn!(peer_id, error = %e, "Dropping malformed message");
                HandleOutcome::Continue
            }
        }
    }

    /// Route a parsed message.
    pub async fn dispatch(&self, peer_id: &str, message: Inbound) {
        debug!(peer_id, message_type = message.message_type(), "Handling message");

        match message {
            Inbound::JoinSession { session_id } => {
                self.relay.join_session(peer_id, &session_id);
            }
            Inbound::LeaveSession => {
                self.relay.leave_session(peer_id);
            }
            Inbound::DrawingData { data } => {
                let element = match &self.store {
                    Some(_) => DrawingElement::from_payload(&data),
                    None => None,
                };
                let session_id = self.relay.drawing_broadcast(peer_id, data);
                if let (Some(session_id), Some(element)) = (session_id, element) {
                    self.persist(peer_id, &session_id, element).await;
                }
            }
            Inbound::Signal {
                kind,
                target_peer_id,
                payload,
            } => {
                let forwarded = self.relay.forward_direct(peer_id, &target_peer_id, payload);
                debug!(peer_id, %kind, target = %target_peer_id, forwarded, "Signal handled");
            }
        }
    }

    async fn persist(&self, peer_id: &str, session_id: &str, element: DrawingElement) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(session_id, element).await {
            warn!(peer_id, session_id, error = %e, "Failed to persist drawing element");
        }
    }
}
