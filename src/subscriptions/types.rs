//! Subscription types shared by the tag index and the registry.

use std::fmt;
use std::sync::Weak;

use crate::types::Version;

use super::mailbox::Mailbox;

/// Unique identifier for a connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One tag-index entry: a connection subscribed to a tag since `watermark`.
///
/// Holds only a weak reference to the connection's mailbox; the session
/// owns the subscription.
#[derive(Clone, Debug)]
pub struct Subscriber {
    pub connection: ConnectionId,
    pub mailbox: Weak<Mailbox>,
    /// Writes at or below this version were covered by replay.
    pub watermark: Version,
}

impl Subscriber {
    /// Whether a write at `version` belongs to the live stream.
    pub fn is_live(&self, version: Version) -> bool {
        version > self.watermark
    }
}
