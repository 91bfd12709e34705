//! The relay service: joins, leaves, broadcasts and direct forwarding.
//!
//! `Relay` is constructed once and shared (`Arc<Relay>`) by every connection
//! task. Compound operations run with the membership lock held for their
//! whole duration, so a join, its announcements and the snapshot sent to the
//! joining peer are one atomic step as seen by every other operation.
//! Deliveries are non-blocking enqueues, so holding the lock never waits on
//! a socket.
//!
//! Lock order is membership, then registry.
//!
//! A failed delivery marks the recipient as dead. Dead peers are collected
//! while iterating and disconnected only after the loop finishes, never
//! while the member set is being walked.

use crate::membership::MembershipTable;
use crate::protocol::{self, Frame, RelayEvent, SessionUser, UserInfo};
use crate::registry::{default_info, ConnectionId, ConnectionRegistry, PeerSink, SendOutcome};
use serde_json::{Map, Value};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// A recipient whose delivery failed, pending disconnect.
type Casualty = (String, ConnectionId);

#[derive(Default)]
pub struct Relay {
    registry: ConnectionRegistry,
    membership: Mutex<MembershipTable>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    fn membership(&self) -> MutexGuard<'_, MembershipTable> {
        self.membership.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Admit a peer whose identity was already established.
    pub fn connect(
        &self,
        peer_id: &str,
        sink: Box<dyn PeerSink>,
        info: Option<UserInfo>,
    ) -> ConnectionId {
        let connection_id = self.registry.admit(peer_id, sink, info);
        info!(peer_id, connection_id, "Peer connected");
        connection_id
    }

    /// Disconnect a peer: leave its session, announce the departure and
    /// drop its registry entry. Safe to call any number of times.
    pub fn disconnect(&self, peer_id: &str) -> bool {
        self.disconnect_matching(peer_id, None)
    }

    /// Disconnect a peer only if `connection_id` is still its live
    /// connection. Used by connection teardown so that a superseded socket
    /// closing never evicts the connection that replaced it.
    pub fn disconnect_connection(&self, peer_id: &str, connection_id: ConnectionId) -> bool {
        self.disconnect_matching(peer_id, Some(connection_id))
    }

    fn disconnect_matching(&self, peer_id: &str, connection_id: Option<ConnectionId>) -> bool {
        let mut casualties = Vec::new();
        let removed = {
            let mut membership = self.membership();
            self.disconnect_locked(&mut membership, peer_id, connection_id, &mut casualties)
        };
        self.cleanup(casualties);
        removed
    }

    fn disconnect_locked(
        &self,
        membership: &mut MembershipTable,
        peer_id: &str,
        connection_id: Option<ConnectionId>,
        casualties: &mut Vec<Casualty>,
    ) -> bool {
        // Registry removal and membership detach happen under the same
        // membership lock, so no reader sees one without the other.
        let removed = match connection_id {
            Some(id) => {
                let removed = self.registry.remove_connection(peer_id, id);
                if removed.is_none() {
                    return false;
                }
                removed
            }
            None => self.registry.remove(peer_id),
        };

        let left = membership.leave(peer_id);
        if let Some(session_id) = &left {
            let user_info = removed.clone().unwrap_or_else(|| default_info(peer_id));
            let event = RelayEvent::UserLeft {
                user_id: peer_id.to_string(),
                user_info,
            };
            self.broadcast_event_locked(membership, session_id, &event, None, casualties);
        }

        let changed = removed.is_some() || left.is_some();
        if changed {
            info!(peer_id, session = left.as_deref(), "Peer disconnected");
        }
        changed
    }

    /// Disconnect every peer whose delivery failed. Disconnecting announces
    /// `user_left`, which can uncover further dead peers; those are queued
    /// and handled in the same loop.
    fn cleanup(&self, mut casualties: Vec<Casualty>) {
        while let Some((peer_id, connection_id)) = casualties.pop() {
            debug!(peer_id = %peer_id, connection_id, "Cleaning up peer after failed delivery");
            let mut membership = self.membership();
            self.disconnect_locked(&mut membership, &peer_id, Some(connection_id), &mut casualties);
        }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Move a peer into a session and announce it.
    ///
    /// Members of the old session (if any) receive `user_left`, the other
    /// members of the new session receive `user_joined`, and the joining
    /// peer receives a `current_users` snapshot of everyone else. Rejoining
    /// the current session only resends the snapshot.
    pub fn join_session(&self, peer_id: &str, session_id: &str) {
        let mut casualties = Vec::new();
        {
            let mut membership = self.membership();

            // Checked under the lock: disconnect also runs under it.
            let Some(user_info) = self.registry.info(peer_id) else {
                warn!(peer_id, session_id, "Ignoring join from unregistered peer");
                return;
            };

            let outcome = membership.join(peer_id, session_id);

            if let Some(previous) = &outcome.left {
                let event = RelayEvent::UserLeft {
                    user_id: peer_id.to_string(),
                    user_info: user_info.clone(),
                };
                self.broadcast_event_locked(&membership, previous, &event, None, &mut casualties);
                info!(peer_id, session_id = %previous, "Peer left session");
            }

            if !outcome.already_member {
                let event = RelayEvent::UserJoined {
                    user_id: peer_id.to_string(),
                    user_info,
                };
                self.broadcast_event_locked(
                    &membership,
                    session_id,
                    &event,
                    Some(peer_id),
                    &mut casualties,
                );
            }

            let users = membership
                .members(session_id)
                .filter(|member| member.as_str() != peer_id)
                .map(|member| SessionUser {
                    user_id: member.clone(),
                    user_info: self
                        .registry
                        .info(member)
                        .unwrap_or_else(|| default_info(member)),
                })
                .collect();
            self.send_event(peer_id, &RelayEvent::CurrentUsers { users }, &mut casualties);

            info!(
                peer_id,
                session_id,
                members = membership.member_count(session_id),
                rejoin = outcome.already_member,
                "Peer joined session"
            );
        }
        self.cleanup(casualties);
    }

    /// Take a peer out of its session and announce `user_left` to the
    /// remaining members. Returns the session it left.
    pub fn leave_session(&self, peer_id: &str) -> Option<String> {
        let mut casualties = Vec::new();
        let left = {
            let mut membership = self.membership();
            let left = membership.leave(peer_id);
            if let Some(session_id) = &left {
                let event = RelayEvent::UserLeft {
                    user_id: peer_id.to_string(),
                    user_info: self
                        .registry
                        .info(peer_id)
                        .unwrap_or_else(|| default_info(peer_id)),
                };
                self.broadcast_event_locked(&membership, session_id, &event, None, &mut casualties);
                info!(peer_id, session_id = %session_id, "Peer left session");
            } else {
                debug!(peer_id, "Leave requested but peer is not in a session");
            }
            left
        };
        self.cleanup(casualties);
        left
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Deliver `frame` to every member of `session_id` except
    /// `exclude_peer_id`. Members whose delivery fails are skipped and then
    /// disconnected once the broadcast has finished.
    ///
    /// Returns the number of members the frame was handed to.
    pub fn broadcast(&self, session_id: &str, frame: &Frame, exclude_peer_id: Option<&str>) -> usize {
        let mut casualties = Vec::new();
        let delivered = {
            let membership = self.membership();
            self.broadcast_locked(&membership, session_id, frame, exclude_peer_id, &mut casualties)
        };
        self.cleanup(casualties);
        delivered
    }

    fn broadcast_locked(
        &self,
        membership: &MembershipTable,
        session_id: &str,
        frame: &Frame,
        exclude_peer_id: Option<&str>,
        casualties: &mut Vec<Casualty>,
    ) -> usize {
        let mut delivered = 0;
        for member in membership.members(session_id) {
            if Some(member.as_str()) == exclude_peer_id {
                continue;
            }
            match self.registry.deliver(member, frame) {
                SendOutcome::Delivered => delivered += 1,
                SendOutcome::Failed(connection_id) => {
                    casualties.push((member.clone(), connection_id));
                }
                SendOutcome::NotRegistered => {
                    warn!(peer_id = %member, session_id, "Session member missing from registry");
                }
            }
        }
        delivered
    }

    fn broadcast_event_locked(
        &self,
        membership: &MembershipTable,
        session_id: &str,
        event: &RelayEvent,
        exclude_peer_id: Option<&str>,
        casualties: &mut Vec<Casualty>,
    ) -> usize {
        match event.encode() {
            Ok(frame) => {
                let delivered =
                    self.broadcast_locked(membership, session_id, &frame, exclude_peer_id, casualties);
                debug!(
                    event_type = event.event_type(),
                    session_id, delivered, "Broadcast event"
                );
                delivered
            }
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "Failed to encode event");
                0
            }
        }
    }

    fn send_event(&self, peer_id: &str, event: &RelayEvent, casualties: &mut Vec<Casualty>) {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "Failed to encode event");
                return;
            }
        };
        if let SendOutcome::Failed(connection_id) = self.registry.deliver(peer_id, &frame) {
            casualties.push((peer_id.to_string(), connection_id));
        }
    }

    /// Forward a signaling payload to one peer, tagged with the sender.
    ///
    /// Unknown targets are dropped silently. A failed delivery disconnects
    /// the target, the same as a failed broadcast delivery would.
    pub fn forward_direct(
        &self,
        source_peer_id: &str,
        target_peer_id: &str,
        payload: Map<String, Value>,
    ) -> bool {
        if !self.registry.exists(target_peer_id) {
            debug!(
                source_peer_id,
                target_peer_id, "Dropping signal for unknown target"
            );
            return false;
        }

        let frame = match protocol::forwarded_signal(payload, source_peer_id) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(source_peer_id, error = %e, "Failed to encode signal");
                return false;
            }
        };

        match self.registry.deliver(target_peer_id, &frame) {
            SendOutcome::Delivered => {
                debug!(source_peer_id, target_peer_id, "Forwarded signal");
                true
            }
            SendOutcome::Failed(connection_id) => {
                self.cleanup(vec![(target_peer_id.to_string(), connection_id)]);
                false
            }
            SendOutcome::NotRegistered => false,
        }
    }

    /// Relay a drawing event to the rest of the sender's session.
    ///
    /// Returns the session it was relayed in, or None if the sender is not
    /// in a session.
    pub fn drawing_broadcast(&self, peer_id: &str, data: Value) -> Option<String> {
        let mut casualties = Vec::new();
        let session_id = {
            let membership = self.membership();
            let Some(session_id) = membership.session_of(peer_id).map(str::to_owned) else {
                debug!(peer_id, "Dropping drawing data from peer outside any session");
                return None;
            };
            let event = RelayEvent::DrawingData {
                user_id: peer_id.to_string(),
                data,
                timestamp: protocol::timestamp_now(),
            };
            self.broadcast_event_locked(
                &membership,
                &session_id,
                &event,
                Some(peer_id),
                &mut casualties,
            );
            session_id
        };
        self.cleanup(casualties);
        Some(session_id)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Members of a session, sorted. Empty if the session does not exist.
    pub fn get_session_users(&self, session_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self.membership().members(session_id).cloned().collect();
        users.sort();
        users
    }

    pub fn session_of(&self, peer_id: &str) -> Option<String> {
        self.membership().session_of(peer_id).map(str::to_owned)
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.registry.exists(peer_id)
    }

    /// Whether `connection_id` is the peer's live connection.
    pub fn is_current_connection(&self, peer_id: &str, connection_id: ConnectionId) -> bool {
        self.registry.connection_id(peer_id) == Some(connection_id)
    }

    pub fn peer_info(&self, peer_id: &str) -> Option<UserInfo> {
        self.registry.info(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.registry.peer_count()
    }

    pub fn session_count(&self) -> usize {
        self.membership().session_count()
    }
}
