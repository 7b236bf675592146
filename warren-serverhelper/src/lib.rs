//! Server-side helpers that sit beside the tunnel core: a static-key
//! authenticator, real-client-IP extraction presets for CDN-fronted
//! deployments, and a synthetic speed-test endpoint (spec §10.1).
//!
//! None of this is part of the wire contract in `warren-core`; it is the
//! injected `authenticate(remote_ip, key)` predicate and the
//! `real_ip(peer, headers)` helper the server handler consults, plus an
//! optional extra route mounted on the same listener.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod auth;
pub mod realip;
pub mod speedtest;

pub use auth::{AuthKey, StaticKeyAuthenticator};
pub use realip::{AwsCloudfrontRealIp, CloudflareRealIp, DefaultRealIp, RealIp};
