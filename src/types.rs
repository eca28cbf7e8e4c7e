//! Basic type definitions shared by server and client
//!
//! - `RoomName`: non-empty room identifier, short enough for a ROSTER
//! - `Peer`: a room member, identified by its observed UDP endpoint

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use crate::message::MAX_ROOM_NAME;

/// Room name (newtype pattern)
///
/// Any non-empty UTF-8 string of at most `MAX_ROOM_NAME` bytes, so the
/// room's ROSTER fits one datagram with at least one member. Names are
/// case-sensitive and carried on the wire verbatim, embedded control bytes
/// included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomName(String);

impl RoomName {
    /// Create a room name, rejecting empty and overlong names
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_ROOM_NAME {
            None
        } else {
            Some(Self(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A room member
///
/// Identity is the endpoint alone: two peers are equal iff IP and port are
/// equal. A NAT re-binding therefore shows up as a new peer, and the old one
/// ages out through the liveness sweep.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Public (NAT-mapped) endpoint as observed by the receiver
    pub endpoint: SocketAddr,
    /// Optional display name, empty when unknown
    pub display_name: String,
}

impl Peer {
    /// Create a peer with no display name
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            display_name: String::new(),
        }
    }

    /// Create a peer with a display name
    pub fn named(endpoint: SocketAddr, display_name: impl Into<String>) -> Self {
        Self {
            endpoint,
            display_name: display_name.into(),
        }
    }

    /// Display name if set, otherwise the endpoint
    pub fn label(&self) -> String {
        if self.display_name.is_empty() {
            self.endpoint.to_string()
        } else {
            format!("{} ({})", self.display_name, self.endpoint)
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.endpoint.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
