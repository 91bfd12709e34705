//! Session membership table.
//!
//! Tracks which peers are in which session, in both directions:
//! - session ID -> set of member peer IDs
//! - peer ID -> current session ID
//!
//! A peer is in at most one session. Sessions exist only while they have
//! members; the last member leaving deletes the record.
//!
//! The table is a plain data structure. `Relay` wraps it in a mutex so that
//! each compound operation is atomic with respect to the others.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// A broken membership edge, as reported by [`MembershipTable::check_invariant`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipViolation {
    #[error("peer {peer_id} points at session {session_id} but is not a member")]
    MissingMember { peer_id: String, session_id: String },
    #[error("peer {peer_id} is a member of {session_id} but points at {actual:?}")]
    WrongPointer {
        peer_id: String,
        session_id: String,
        actual: Option<String>,
    },
    #[error("session {0} has no members")]
    EmptySession(String),
}

/// What a [`MembershipTable::join`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Session the peer was moved out of.
    pub left: Option<String>,
    /// The peer was already in the target session; nothing changed.
    pub already_member: bool,
}

#[derive(Debug, Default)]
pub struct MembershipTable {
    sessions: HashMap<String, HashSet<String>>,
    peer_sessions: HashMap<String, String>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `peer_id` into `session_id`, detaching it from its current
    /// session first.
    pub fn join(&mut self, peer_id: &str, session_id: &str) -> JoinOutcome {
        if self.session_of(peer_id) == Some(session_id) {
            return JoinOutcome {
                left: None,
                already_member: true,
            };
        }

        let left = self.leave(peer_id);
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(peer_id.to_string());
        self.peer_sessions
            .insert(peer_id.to_string(), session_id.to_string());

        JoinOutcome {
            left,
            already_member: false,
        }
    }

    /// Detach `peer_id` from its session. Returns the session it left.
    pub fn leave(&mut self, peer_id: &str) -> Option<String> {
        let session_id = self.peer_sessions.remove(peer_id)?;
        if let Some(members) = self.sessions.get_mut(&session_id) {
            members.remove(peer_id);
            if members.is_empty() {
                self.sessions.remove(&session_id);
            }
        }
        Some(session_id)
    }

    /// Snapshot of a session's members (empty if the session is absent).
    pub fn members_of(&self, session_id: &str) -> HashSet<String> {
        self.sessions.get(session_id).cloned().unwrap_or_default()
    }

    /// Iterate a session's members without copying.
    pub fn members(&self, session_id: &str) -> impl Iterator<Item = &String> {
        self.sessions.get(session_id).into_iter().flatten()
    }

    pub fn member_count(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map_or(0, HashSet::len)
    }

    pub fn session_of(&self, peer_id: &str) -> Option<&str> {
        self.peer_sessions.get(peer_id).map(String::as_str)
    }

    pub fn contains_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Verify that both directions of the membership relation agree and that
    /// no empty session record exists.
    pub fn check_invariant(&self) -> Result<(), MembershipViolation> {
        for (peer_id, session_id) in &self.peer_sessions {
            let is_member = self
                .sessions
                .get(session_id)
                .is_some_and(|members| members.contains(peer_id));
            if !is_member {
                return Err(MembershipViolation::MissingMember {
                    peer_id: peer_id.clone(),
                    session_id: session_id.clone(),
                });
            }
        }

        for (session_id, members) in &self.sessions {
            if members.is_empty() {
                return Err(MembershipViolation::EmptySession(session_id.clone()));
            }
            for peer_id in members {
                let actual = self.peer_sessions.get(peer_id);
                if actual != Some(session_id) {
                    return Err(MembershipViolation::WrongPointer {
                        peer_id: peer_id.clone(),
                        session_id: session_id.clone(),
                        actual: actual.cloned(),
                    });
                }
            }
        }
        Ok(())
    }
}
