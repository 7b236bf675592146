//! Fixed wire header names exchanged on the upgrade request/response.
//!
//! Names match the original implementation's wire format byte-for-byte;
//! clients and servers built against different language runtimes must
//! agree on the header names, not just their semantics.

use http::HeaderName;

/// Carries the shared auth secret on the upgrade request.
pub static X_PROXY_AUTHORIZATION: HeaderName = HeaderName::from_static("x-proxy-authorization");

/// Carries the requested protocol (only `"tcp"` is supported) on a direct-mode
/// upgrade request.
pub static X_PROXY_PROTOCOL: HeaderName = HeaderName::from_static("x-proxy-protocol");

/// Carries the requested `host:port` target on a direct-mode upgrade request.
pub static X_PROXY_TARGET: HeaderName = HeaderName::from_static("x-proxy-target");

/// Set by the server on the upgrade response; identifies the session for
/// logging and idle-promotion correlation.
pub static X_PROXY_ID: HeaderName = HeaderName::from_static("x-proxy-id");

/// The only protocol value the wire contract currently understands.
pub const PROTOCOL_TCP: &str = "tcp";

/// The idle-mode promotion success marker (exact match, not a prefix).
pub const IDLE_OK: &str = "ok";
