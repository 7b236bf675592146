//! Client-side pool of idle, pre-handshaken tunnel sessions.
//!
//! Holding a handful of sessions parked in `Idle` phase lets a dial
//! skip the WebSocket handshake round-trip on the common path, at the
//! cost of a background worker per slot re-establishing whatever dies
//! or gets promoted.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod pool;

pub use pool::Pool;
