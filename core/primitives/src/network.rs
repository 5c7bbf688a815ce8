use std::fmt;

/// Opaque identity of a remote peer, assigned by the transport layer.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A signed adjustment applied to a peer's reputation by the peer-set
/// manager. Negative values may eventually lead to a ban.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReputationChange {
    pub value: i32,
    pub reason: &'static str,
}

impl ReputationChange {
    pub const fn new(value: i32, reason: &'static str) -> Self {
        Self { value, reason }
    }
}

/// Well-known reputation adjustments.
pub mod rep {
    use super::ReputationChange;

    pub const GOOD_TRANSACTION: ReputationChange =
        ReputationChange::new(1 << 7, "Good transaction");
    pub const BAD_TRANSACTION: ReputationChange =
        ReputationChange::new(-(1 << 12), "Bad transaction");
    pub const BAD_SIGNATURE: ReputationChange =
        ReputationChange::new(-(1 << 20), "Bad signature");
    pub const BAD_MESSAGE: ReputationChange =
        ReputationChange::new(-(1 << 12), "Bad message");
}
