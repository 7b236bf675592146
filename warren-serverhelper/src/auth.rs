//! Static-key authentication for inbound upgrade requests (spec §10.1).
//! Grounded on `serverhelper/auth.go` (original source).

use std::fmt;

/// A shared secret compared byte-for-byte against the client's
/// `X-PROXY-Authorization` value.
///
/// Deliberately does not derive `Debug`/`Display` verbatim, so the key
/// cannot end up in a log line by accident.
#[derive(Clone)]
pub struct AuthKey(String);

impl AuthKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AuthKey").field(&"<redacted>").finish()
    }
}

/// Accepts iff the presented value matches the configured key by exact
/// string equality. Mirrors the original's non-constant-time comparison;
/// timing-safety is not called out as a requirement here.
pub struct StaticKeyAuthenticator {
    key: AuthKey,
}

impl StaticKeyAuthenticator {
    #[must_use]
    pub fn new(key: AuthKey) -> Self {
        Self { key }
    }

    #[must_use]
    pub fn authenticate(&self, _remote_ip: &str, presented: &str) -> bool {
        presented == self.key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_key() {
        let auth = StaticKeyAuthenticator::new(AuthKey::new("12345"));
        assert!(auth.authenticate("127.0.0.1", "12345"));
    }

    #[test]
    fn rejects_mismatched_key() {
        let auth = StaticKeyAuthenticator::new(AuthKey::new("12345"));
        assert!(!auth.authenticate("127.0.0.1", "11111"));
    }

    #[test]
    fn debug_does_not_leak_the_key() {
        let key = AuthKey::new("super-secret");
        assert!(!format!("{key:?}").contains("super-secret"));
    }
}
