//! Connection registry: peer ID to live outbound sink.
//!
//! The registry owns peer existence. Each admission gets a fresh
//! [`ConnectionId`] so that teardown of a superseded connection can be told
//! apart from teardown of the connection that replaced it.
//!
//! Delivery through a [`PeerSink`] never blocks. A sink that cannot take a
//! frame reports failure and the caller decides what to clean up; the
//! registry never removes peers on its own.

use crate::protocol::{Frame, UserInfo};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Identifies one admission of a peer.
pub type ConnectionId = u64;

/// Why a frame could not be handed to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

/// Outbound half of a peer's transport.
pub trait PeerSink: Send + Sync {
    /// Hand a frame to the transport without waiting.
    fn deliver(&self, frame: Frame) -> Result<(), SinkError>;
}

/// Bounded per-peer queue drained by the connection's writer task.
///
/// A slow peer fills its own queue and starts failing deliveries; it never
/// stalls delivery to anyone else.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Frame>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver its writer should drain.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl PeerSink for ChannelSink {
    fn deliver(&self, frame: Frame) -> Result<(), SinkError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Result of a tracked send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The sink rejected the frame. Carries the connection that failed.
    Failed(ConnectionId),
    NotRegistered,
}

struct PeerEntry {
    connection_id: ConnectionId,
    sink: Box<dyn PeerSink>,
    info: UserInfo,
}

/// Metadata used when a peer is admitted without any.
pub fn default_info(peer_id: &str) -> UserInfo {
    let mut info = UserInfo::new();
    info.insert("display_name".into(), Value::String(peer_id.to_string()));
    info
}

/// Registry of connected peers.
///
/// Thread-safe; share through the owning `Relay`.
pub struct ConnectionRegistry {
    peers: RwLock<HashMap<String, PeerEntry>>,
    next_connection_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, PeerEntry>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, PeerEntry>> {
        self.peers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `sink` under `peer_id`.
    ///
    /// Last writer wins: an existing entry for the same ID is replaced and
    /// its sink dropped, which closes the superseded connection's writer.
    pub fn admit(
        &self,
        peer_id: &str,
        sink: Box<dyn PeerSink>,
        info: Option<UserInfo>,
    ) -> ConnectionId {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let entry = PeerEntry {
            connection_id,
            sink,
            info: info.unwrap_or_else(|| default_info(peer_id)),
        };

        let previous = self.write().insert(peer_id.to_string(), entry);
        if let Some(previous) = previous {
            warn!(
                peer_id,
                replaced = previous.connection_id,
                connection_id,
                "Peer ID admitted again, replacing previous connection"
            );
        }
        connection_id
    }

    /// Remove a peer regardless of which connection it is on.
    ///
    /// Returns the removed peer's metadata, or None if it was not registered.
    pub fn remove(&self, peer_id: &str) -> Option<UserInfo> {
        self.write().remove(peer_id).map(|entry| entry.info)
    }

    /// Remove a peer only if its live entry belongs to `connection_id`.
    pub fn remove_connection(&self, peer_id: &str, connection_id: ConnectionId) -> Option<UserInfo> {
        let mut peers = self.write();
        match peers.get(peer_id) {
            Some(entry) if entry.connection_id == connection_id => {
                peers.remove(peer_id).map(|entry| entry.info)
            }
            Some(entry) => {
                debug!(
                    peer_id,
                    connection_id,
                    live = entry.connection_id,
                    "Ignoring removal of superseded connection"
                );
                None
            }
            None => None,
        }
    }

    /// Deliver a frame, reporting which connection failed if it did.
    pub fn deliver(&self, peer_id: &str, frame: &Frame) -> SendOutcome {
        let peers = self.read();
        let Some(entry) = peers.get(peer_id) else {
            return SendOutcome::NotRegistered;
        };
        match entry.sink.deliver(Frame::clone(frame)) {
            Ok(()) => SendOutcome::Delivered,
            Err(e) => {
                warn!(
                    peer_id,
                    connection_id = entry.connection_id,
                    error = %e,
                    "Failed to deliver message"
                );
                SendOutcome::Failed(entry.connection_id)
            }
        }
    }

    /// Deliver a frame. Failure leaves the peer registered.
    pub fn send(&self, peer_id: &str, frame: &Frame) -> bool {
        self.deliver(peer_id, frame) == SendOutcome::Delivered
    }

    pub fn exists(&self, peer_id: &str) -> bool {
        self.read().contains_key(peer_id)
    }

    /// The live connection for a peer.
    pub fn connection_id(&self, peer_id: &str) -> Option<ConnectionId> {
        self.read().get(peer_id).map(|entry| entry.connection_id)
    }

    pub fn info(&self, peer_id: &str) -> Option<UserInfo> {
        self.read().get(peer_id).map(|entry| entry.info.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.read().len()
    }
}
