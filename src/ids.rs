//! Bounded identifiers: GID, session id, client id, proxy connection id.

use crate::error::GtmError;
use std::fmt;

/// A bounded UTF-8 identifier for a prepared (2PC) transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gid(String);

impl Gid {
    pub fn new(raw: impl Into<String>, max_len: usize) -> Result<Self, GtmError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(GtmError::Protocol("empty GID".into()));
        }
        if raw.len() > max_len {
            return Err(GtmError::Protocol(format!(
                "GID exceeds maximum length of {max_len} bytes"
            )));
        }
        Ok(Gid(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bounded, possibly-empty session identifier. Empty means "no session".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(raw: impl Into<String>, max_len: usize) -> Result<Self, GtmError> {
        let raw = raw.into();
        if raw.len() > max_len {
            return Err(GtmError::Protocol(format!(
                "session id exceeds maximum length of {max_len} bytes"
            )));
        }
        Ok(SessionId(raw))
    }

    #[must_use]
    pub fn empty() -> Self {
        SessionId(String::new())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 32-bit client identifier issued by the server, compared modularly to
/// tolerate wraparound, the same way GXIDs are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u32);

impl ClientId {
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        ClientId(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn follows(self, other: ClientId) -> bool {
        (self.0.wrapping_sub(other.0) as i32) > 0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A proxy-assigned backend connection id; `-1` means "no proxy".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyConnId(i32);

impl ProxyConnId {
    pub const NONE: ProxyConnId = ProxyConnId(-1);

    #[must_use]
    pub const fn new(raw: i32) -> Self {
        ProxyConnId(raw)
    }

    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }

    /// Does this caller-supplied filter match a slot's recorded proxy id?
    /// Per spec.md §4.3.6: match if equal, or if the filter is "no proxy".
    #[must_use]
    pub const fn matches(self, slot_proxy: ProxyConnId) -> bool {
        self.0 == slot_proxy.0 || self.is_none()
    }
}

impl Default for ProxyConnId {
    fn default() -> Self {
        ProxyConnId::NONE
    }
}

impl fmt::Display for ProxyConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gid_enforces_max_len() {
        assert!(Gid::new("tx1", 8).is_ok());
        assert!(Gid::new("way-too-long-gid", 4).is_err());
        assert!(Gid::new("", 8).is_err());
    }

    #[test]
    fn session_id_allows_empty() {
        let s = SessionId::empty();
        assert!(s.is_empty());
    }

    #[test]
    fn proxy_conn_id_matches_none_filter() {
        let slot_proxy = ProxyConnId::new(7);
        assert!(ProxyConnId::NONE.matches(slot_proxy));
        assert!(ProxyConnId::new(7).matches(slot_proxy));
        assert!(!ProxyConnId::new(8).matches(slot_proxy));
    }

    #[test]
    fn client_id_follows_is_modular() {
        let a = ClientId::new(5);
        let b = ClientId::new(10);
        assert!(b.follows(a));
        assert!(!a.follows(b));
    }
}
