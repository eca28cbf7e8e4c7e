//! Room struct definition
//!
//! Server-side state of one chat room: members in join order, the last time
//! each was heard from, and the roster version of the current membership.

use std::net::SocketAddr;
use std::time::Instant;

use crate::types::{Peer, RoomName};

/// One member plus its liveness timestamp
#[derive(Debug, Clone)]
pub struct Member {
    pub peer: Peer,
    pub last_seen: Instant,
}

/// Multi-party chat room
///
/// Members are kept in join order; a re-join of an existing endpoint keeps
/// its position. The room is owned by the registry and only mutated while
/// the registry holds its entry.
#[derive(Debug)]
pub struct Room {
    /// Room name for identification
    pub name: RoomName,
    /// Members in join order
    members: Vec<Member>,
    /// Version of the current membership, bumped on every change
    pub version: u64,
}

impl Room {
    /// Create an empty room with the given name and initial version
    pub fn new(name: RoomName, version: u64) -> Self {
        Self {
            name,
            members: Vec::new(),
            version,
        }
    }

    /// Add a peer or refresh an existing one
    ///
    /// Returns true if the peer was not yet a member.
    pub fn upsert(&mut self, peer: Peer, now: Instant) -> bool {
        match self.position(peer.endpoint) {
            Some(idx) => {
                let member = &mut self.members[idx];
                if !peer.display_name.is_empty() {
                    member.peer.display_name = peer.display_name;
                }
                member.last_seen = now;
                false
            }
            None => {
                self.members.push(Member {
                    peer,
                    last_seen: now,
                });
                true
            }
        }
    }

    /// Remove a member
    ///
    /// Returns true if the endpoint was a member.
    pub fn remove(&mut self, endpoint: SocketAddr) -> bool {
        match self.position(endpoint) {
            Some(idx) => {
                self.members.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Refresh `last_seen`; returns false if the endpoint is not a member
    pub fn touch(&mut self, endpoint: SocketAddr, now: Instant) -> bool {
        match self.position(endpoint) {
            Some(idx) => {
                self.members[idx].last_seen = now;
                true
            }
            None => false,
        }
    }

    /// When `endpoint` was last heard from in this room
    pub fn last_seen(&self, endpoint: SocketAddr) -> Option<Instant> {
        self.position(endpoint).map(|idx| self.members[idx].last_seen)
    }

    /// Check if an endpoint is a member
    pub fn contains(&self, endpoint: SocketAddr) -> bool {
        self.position(endpoint).is_some()
    }

    /// Members in join order
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Member peers in join order
    pub fn peers(&self) -> Vec<Peer> {
        self.members.iter().map(|m| m.peer.clone()).collect()
    }

    /// Member endpoints in join order
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.members.iter().map(|m| m.peer.endpoint).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    fn position(&self, endpoint: SocketAddr) -> Option<usize> {
        self.members.iter().position(|m| m.peer.endpoint == endpoint)
    }
}
