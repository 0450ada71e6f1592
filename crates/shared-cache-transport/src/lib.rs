//! Transport layer between the authority and its clients.
//!
//! Provides:
//! - Wire protocol (JSON + base64)
//! - WebSocket endpoint for the authority (feature: websocket)
//! - WebSocket client implementing `AuthorityService` (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod client;
#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "websocket")]
pub use client::{RemoteAuthority, TransportError, connect_agent};
pub use protocol::{ClientMessage, ServerMessage, WireError};
#[cfg(feature = "websocket")]
pub use websocket::{RemotePeer, create_authority_router};
