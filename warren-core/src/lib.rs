//! WebSocket-framed byte-stream transport and idle-session primitives.
//!
//! This crate is the tunnel's core: the wire contract that turns a
//! WebSocket connection into a reliable, half-close-capable bidirectional
//! byte pipe ([`stream::StreamConn`]), the outbound handshake and idle
//! session it's promoted from ([`dial`]), and the bidirectional bridge
//! that shuttles bytes between two such streams ([`bridge`]).
//!
//! The client-side idle-connection pool built on top of [`dial::Dialer`]
//! lives in the sibling `warren-pool` crate; the inbound handshake and
//! authentication in `warren-server`.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod bridge;
pub mod dial;
pub mod error;
pub mod headers;
pub mod id;
pub mod io_adapter;
pub mod stream;

pub use error::ProxyError;
pub use id::SessionId;
