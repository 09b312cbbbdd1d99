//! # tether-client
//!
//! A resilient, long-lived logical connection over a message-oriented
//! socket: one-way indications, correlated request/response pairs, and
//! broadcast fan-out, with automatic reconnection hidden behind an
//! idempotent `connect`.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `transport` | Socket seam + tokio-tungstenite implementation |
//! | `manager` | Connection lifecycle, reconnect loop, request correlation |
//! | `connector` | Handler registry, stale-update rejection, fan-out |
//! | `session` | Peer sessions and the fan-out registry |
//!
//! ## Data Flow
//!
//! Outbound: [`Connector`] → [`ConnectionManager`] → link.
//! Inbound: link → [`ConnectionManager`] (decode, correlate) →
//! [`Connector`] (sequence gate, route) → registered handler.

#![deny(unsafe_code)]

pub mod connector;
pub mod manager;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connector::{ActionHandler, Connector, ReconnectHook, create_connector};
pub use manager::{
    ConnectionManager, ConnectionOptions, Dispatch, StateChangeFn, TokenFactory,
};
pub use session::{PeerSession, Session, SessionHub, SessionManager};
pub use transport::{LinkEvent, LinkSink, LinkStream, SplitLink, Transport, WsTransport};
