//! relay-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to start a server in-process.

pub mod api;
pub mod config;
pub mod connection;
pub mod server;
pub mod store;

// Re-export key types for convenience
pub use config::{Config, RelayLimits};
pub use connection::{CloseReason, PeerConnection};
pub use server::{ConnectRequest, RelayServer};
pub use store::JsonFileStore;
