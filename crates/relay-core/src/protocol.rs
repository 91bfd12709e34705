//! Wire protocol for the signaling relay.
//!
//! Every frame is a UTF-8 JSON object tagged by a `"type"` field. Inbound
//! frames are parsed into [`Inbound`]; outbound events are built as
//! [`RelayEvent`] and serialized once into a shared [`Frame`] that is handed
//! to every recipient.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A serialized outbound message, shared between all recipients.
pub type Frame = Arc<str>;

/// Display metadata attached to a peer (e.g. `{"display_name": "alice"}`).
pub type UserInfo = Map<String, Value>;

/// Field the relay adds to forwarded signaling messages.
pub const SOURCE_PEER_FIELD: &str = "source_peer_id";

/// Errors produced while decoding or encoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Decode(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("message has no \"type\" field")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("message type {0} is not accepted from peers")]
    Unsupported(String),
    #[error("{kind} message is missing required field \"{field}\"")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Whether the frame was undecodable, as opposed to well-formed JSON
    /// carrying a bad message. Undecodable frames end the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::Decode(_) | ProtocolError::NotAnObject)
    }
}

/// Kind of a peer-to-peer WebRTC negotiation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice_candidate",
        }
    }

    fn from_type(message_type: &str) -> Option<Self> {
        match message_type {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "ice_candidate" => Some(SignalKind::IceCandidate),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Enter a session, leaving the current one if any.
    JoinSession { session_id: String },
    /// Leave the current session.
    LeaveSession,
    /// Drawing event to fan out to the rest of the session.
    DrawingData { data: Value },
    /// Negotiation payload for one other peer. `payload` is the whole
    /// inbound object, forwarded as-is.
    Signal {
        kind: SignalKind,
        target_peer_id: String,
        payload: Map<String, Value>,
    },
}

impl Inbound {
    /// Parse a raw frame (text or binary WebSocket payload).
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Self::parse_str(text)
    }

    pub fn parse_str(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        match value {
            Value::Object(object) => Self::from_object(object),
            _ => Err(ProtocolError::NotAnObject),
        }
    }

    pub fn from_object(mut object: Map<String, Value>) -> Result<Self, ProtocolError> {
        let message_type = match object.get("type") {
            Some(Value::String(t)) => t.clone(),
            _ => return Err(ProtocolError::MissingType),
        };

        match message_type.as_str() {
            "join_session" => {
                // The web client sends `whiteboard_id`
                let session_id = string_field(&object, &["session_id", "whiteboard_id"]).ok_or(
                    ProtocolError::MissingField {
                        kind: "join_session",
                        field: "session_id",
                    },
                )?;
                Ok(Inbound::JoinSession { session_id })
            }
            "leave_session" => Ok(Inbound::LeaveSession),
            "drawing_data" => match object.remove("data") {
                Some(data) if !data.is_null() => Ok(Inbound::DrawingData { data }),
                _ => Err(ProtocolError::MissingField {
                    kind: "drawing_data",
                    field: "data",
                }),
            },
            other => {
                if let Some(kind) = SignalKind::from_type(other) {
                    let target_peer_id =
                        string_field(&object, &["target_peer_id", "target_user_id"]).ok_or(
                            ProtocolError::MissingField {
                                kind: kind.as_str(),
                                field: "target_peer_id",
                            },
                        )?;
                    return Ok(Inbound::Signal {
                        kind,
                        target_peer_id,
                        payload: object,
                    });
                }
                match other {
                    "user_joined" | "user_left" | "current_users" => {
                        Err(ProtocolError::Unsupported(message_type))
                    }
                    _ => Err(ProtocolError::UnknownType(message_type)),
                }
            }
        }
    }

    /// The wire `type` of this message.
    pub fn message_type(&self) -> &'static str {
        match self {
            Inbound::JoinSession { .. } => "join_session",
            Inbound::LeaveSession => "leave_session",
            Inbound::DrawingData { .. } => "drawing_data",
            Inbound::Signal { kind, .. } => kind.as_str(),
        }
    }
}

/// First string value among `names`. IDs are opaque, so an empty string
/// is still a value.
fn string_field(object: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match object.get(*name) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    })
}

/// One entry of a `current_users` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUser {
    pub user_id: String,
    pub user_info: UserInfo,
}

/// Events synthesized by the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// A peer entered the session.
    UserJoined { user_id: String, user_info: UserInfo },
    /// A peer left the session or disconnected.
    UserLeft { user_id: String, user_info: UserInfo },
    /// Sent to a joining peer: everyone else already in the session.
    CurrentUsers { users: Vec<SessionUser> },
    /// A drawing event relayed from `user_id`.
    DrawingData {
        user_id: String,
        data: Value,
        timestamp: String,
    },
}

impl RelayEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            RelayEvent::UserJoined { .. } => "user_joined",
            RelayEvent::UserLeft { .. } => "user_left",
            RelayEvent::CurrentUsers { .. } => "current_users",
            RelayEvent::DrawingData { .. } => "drawing_data",
        }
    }

    /// Serialize into a shareable frame.
    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        serde_json::to_string(self)
            .map(Frame::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Build the frame delivered to the target of a signaling message: the
/// original object with the sender's ID attached.
pub fn forwarded_signal(
    mut payload: Map<String, Value>,
    source_peer_id: &str,
) -> Result<Frame, ProtocolError> {
    payload.insert(
        SOURCE_PEER_FIELD.to_string(),
        Value::String(source_peer_id.to_string()),
    );
    serde_json::to_string(&payload)
        .map(Frame::from)
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Current time as ISO-8601 UTC, millisecond precision.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
