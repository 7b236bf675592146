//! The inbound half of the tunnel: HTTP upgrade handling, authentication,
//! mode selection (idle vs. direct), target dial and bridging (spec
//! §4.3), plus the TLS acceptor setup a non-"insecure" listener needs.
//!
//! The listening socket itself and the process-level graceful-shutdown
//! loop are external collaborators (`warren-cli`); this crate only knows
//! how to turn one accepted connection into a handled tunnel session.

pub mod handler;
pub mod tls;

pub use handler::Handler;
