//! # Transport Module
//!
//! The duplex connection to the content server.
//!
//! - **`backoff`**: `ReconnectBackoff`, the capped exponential delay policy.
//! - **`ws_transport`**: `Transport`, a WebSocket client built on
//!   `tokio-tungstenite` with heartbeat, reconnect and inbound classification.

/// Reconnect delay policy.
pub mod backoff;
/// WebSocket transport.
pub mod ws_transport;

pub use backoff::ReconnectBackoff;
pub use ws_transport::{
    ConnectionState, CredentialProvider, MessageCallback, StaticCredential, Transport, TransportConfig,
    TransportEvent,
};
