//! Error types shared across the warren crates.

/// A type-erased error, used at boundaries where the concrete cause
/// does not matter to the caller.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error kinds produced by the tunnel core.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Invalid endpoint, empty auth key, or similar fatal startup misconfiguration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The WebSocket handshake failed: non-101 response, malformed
    /// `X-PROXY-ID`, or a TLS failure.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Framing failure, peer reset, or keepalive timeout. Once returned,
    /// the stream is closed in both directions.
    #[error("transport error: {0}")]
    Transport(String),

    /// Promotion was attempted on an idle session that was already taken
    /// or has died. Callers should fall back to a fresh direct dial.
    #[error("stale idle session: {0}")]
    StaleIdle(String),

    /// `Pick`/`Dial` was called on a pool after `Close`.
    #[error("pool is closed")]
    PoolClosed,

    /// Catch-all for foreign errors that don't warrant a dedicated variant.
    #[error(transparent)]
    Other(#[from] BoxError),
}

impl ProxyError {
    /// True if this error's message contains the given HTTP status code,
    /// e.g. for asserting on `HandshakeError` messages in tests.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.to_string().contains(needle)
    }

    /// Shorthand for a [`ProxyError::Transport`] built from a `Display`able cause.
    #[must_use]
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Self::Transport(cause.to_string())
    }
}
