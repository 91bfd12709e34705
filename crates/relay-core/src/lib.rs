//! relay-core: connection registry, session membership and message fan-out
//! for the whiteboard signaling relay.
//!
//! This crate provides:
//! - The wire protocol (inbound parsing, outbound events)
//! - `ConnectionRegistry` mapping peer IDs to their outbound sinks
//! - `MembershipTable` mapping sessions to members and peers to sessions
//! - `Relay`, the service object that joins, leaves, broadcasts and forwards
//! - `SignalingHandler`, which routes inbound frames to the relay
//! - Collaborator traits for identity resolution and drawing storage
//!
//! There is no networking here; the daemon crate owns sockets.

pub mod handler;
pub mod identity;
pub mod membership;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod store;

pub use handler::{HandleOutcome, SignalingHandler};
pub use identity::{IdentityError, IdentityProvider, PeerIdentity, TokenGrant, TokenTable};
pub use membership::{JoinOutcome, MembershipTable, MembershipViolation};
pub use protocol::{Frame, Inbound, ProtocolError, RelayEvent, SessionUser, SignalKind, UserInfo};
pub use registry::{ChannelSink, ConnectionId, ConnectionRegistry, PeerSink, SendOutcome, SinkError};
pub use relay::Relay;
pub use store::{DrawingElement, ElementKind, MemoryStore, StoreError, WhiteboardStore};
