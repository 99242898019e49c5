//! Shared identifiers used across the transport core.

use std::fmt;

/// Opaque identifier for a remote hub; the primary key across every map
/// the manager keeps (`PeerConnectionRecord`s, signaling handles, grace
/// timers).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct HubId(pub String);

impl fmt::Display for HubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for HubId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HubId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for HubId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier for a logical subscription, either caller-supplied (semantic
/// IDs such as `terminal:agent-3:pty-0`) or generator-allocated
/// (`sub_<counter>_<millis>`). Uniqueness within a hub for semantic IDs is
/// the caller's responsibility.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SubscriptionId(pub String);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SubscriptionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
