//! Session identifiers.
//!
//! The wire contract only requires a time-sortable id with a canonical
//! string form that round-trips over an HTTP header (spec §9); this
//! wraps a UUIDv7 rather than porting the original's `xid` library.

use std::{fmt, str::FromStr};

use uuid::Uuid;

/// An opaque, time-sortable session identifier.
///
/// The server mints one per accepted upgrade and returns it on
/// `X-PROXY-ID`; the client only ever parses it back for logging and
/// idle-promotion correlation, never interprets its bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Mints a fresh, time-sortable id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Parses a canonical string form as produced by [`SessionId::new`].
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_over_a_header_string() {
        let id = SessionId::new();
        let rendered = id.to_string();
        let parsed: SessionId = rendered.parse().expect("valid session id string");
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(SessionId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn ids_are_monotonically_sortable() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert!(a <= b);
    }
}
