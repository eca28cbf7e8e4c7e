//! Peer/room registry
//!
//! In-memory `room name -> Room` map plus an `endpoint -> rooms` reverse
//! index. Every mutation of a room happens while holding that room's map
//! entry, so operations on one room are serialized while different rooms
//! proceed independently. Lock order is always rooms before index; no
//! method holds an index entry while touching the rooms map.

use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::ProtocolViolation;
use crate::message::Roster;
use crate::room::Room;
use crate::types::{Peer, RoomName};

/// Membership of one room at one version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterSnapshot {
    pub room: RoomName,
    pub version: u64,
    /// Members in join order; empty when the room was deleted
    pub members: Vec<Peer>,
}

impl RosterSnapshot {
    fn of(room: &Room) -> Self {
        Self {
            room: room.name.clone(),
            version: room.version,
            members: room.peers(),
        }
    }

    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.members.iter().map(|p| p.endpoint).collect()
    }

    /// Wire payload for this snapshot
    pub fn to_roster(&self) -> Roster {
        Roster {
            room: self.room.clone(),
            version: self.version,
            members: self.endpoints(),
        }
    }
}

/// Work found by one liveness pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepPlan {
    /// Endpoints idle past the grace window, each listed once
    pub ping: Vec<SocketAddr>,
    /// (room, endpoint) pairs idle past the eviction timeout
    pub evict: Vec<(RoomName, SocketAddr)>,
}

/// Concurrent room registry
#[derive(Debug)]
pub struct Registry {
    rooms: DashMap<RoomName, Room>,
    memberships: DashMap<SocketAddr, HashSet<RoomName>>,
    version: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            version: AtomicU64::new(1),
        }
    }

    /// Registry-wide, so a re-created room never reuses a version
    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::Relaxed)
    }

    /// Add `peer` to `room`, creating the room if needed
    ///
    /// Idempotent: an existing endpoint only gets its `last_seen` (and a
    /// non-empty display name) refreshed, and the version is unchanged.
    /// A new member is refused once the room's ROSTER would no longer fit
    /// one datagram.
    pub fn join(&self, room: &RoomName, peer: Peer) -> Result<RosterSnapshot, ProtocolViolation> {
        let endpoint = peer.endpoint;
        let mut entry = self
            .rooms
            .entry(room.clone())
            .or_insert_with(|| Room::new(room.clone(), 0));

        let capacity = Roster::max_members(room);
        if !entry.contains(endpoint) && entry.len() >= capacity {
            return Err(ProtocolViolation::RoomFull {
                room: room.to_string(),
                capacity,
            });
        }

        if entry.upsert(peer, Instant::now()) {
            entry.version = self.next_version();
            self.memberships
                .entry(endpoint)
                .or_default()
                .insert(room.clone());
        }
        Ok(RosterSnapshot::of(&entry))
    }

    /// Remove `endpoint` from `room`, deleting the room once empty
    ///
    /// Returns the remaining membership, or None if it was not a member.
    pub fn leave(&self, room: &RoomName, endpoint: SocketAddr) -> Option<RosterSnapshot> {
        self.remove_where(room, endpoint, |_| true)
    }

    /// Remove `endpoint` only if it has not been heard from since `cutoff`
    ///
    /// Checked under the room's entry, so a touch racing with the sweep wins.
    pub fn leave_if_idle(
        &self,
        room: &RoomName,
        endpoint: SocketAddr,
        cutoff: Instant,
    ) -> Option<RosterSnapshot> {
        self.remove_where(room, endpoint, |r| {
            r.last_seen(endpoint).is_some_and(|seen| seen <= cutoff)
        })
    }

    fn remove_where(
        &self,
        room: &RoomName,
        endpoint: SocketAddr,
        pred: impl FnOnce(&Room) -> bool,
    ) -> Option<RosterSnapshot> {
        let Entry::Occupied(mut entry) = self.rooms.entry(room.clone()) else {
            return None;
        };
        if !entry.get().contains(endpoint) || !pred(entry.get()) {
            return None;
        }

        entry.get_mut().remove(endpoint);
        self.unindex(endpoint, room);

        if entry.get().is_empty() {
            let (_, removed) = entry.remove_entry();
            return Some(RosterSnapshot {
                room: removed.name,
                version: self.next_version(),
                members: Vec::new(),
            });
        }

        let version = self.next_version();
        entry.get_mut().version = version;
        Some(RosterSnapshot::of(entry.get()))
    }

    fn unindex(&self, endpoint: SocketAddr, room: &RoomName) {
        if let Entry::Occupied(mut rooms) = self.memberships.entry(endpoint) {
            rooms.get_mut().remove(room);
            if rooms.get().is_empty() {
                rooms.remove();
            }
        }
    }

    /// Refresh `last_seen` without changing membership
    pub fn touch(&self, room: &RoomName, endpoint: SocketAddr) -> bool {
        self.rooms
            .get_mut(room)
            .is_some_and(|mut r| r.touch(endpoint, Instant::now()))
    }

    /// Touch every room `endpoint` belongs to; returns how many were touched
    pub fn touch_all(&self, endpoint: SocketAddr) -> usize {
        self.rooms_of(endpoint)
            .iter()
            .filter(|room| self.touch(room, endpoint))
            .count()
    }

    /// Rooms `endpoint` is a member of
    pub fn rooms_of(&self, endpoint: SocketAddr) -> Vec<RoomName> {
        self.memberships
            .get(&endpoint)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Members of `room` in join order; empty if the room does not exist
    pub fn members(&self, room: &RoomName) -> Vec<Peer> {
        self.rooms.get(room).map(|r| r.peers()).unwrap_or_default()
    }

    /// Current membership and version of `room`
    pub fn snapshot(&self, room: &RoomName) -> Option<RosterSnapshot> {
        self.rooms.get(room).map(|r| RosterSnapshot::of(&r))
    }

    pub fn contains_room(&self, room: &RoomName) -> bool {
        self.rooms.contains_key(room)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Find idle members without mutating anything
    ///
    /// A member idle for at least `evict_after` is listed for eviction;
    /// one idle for at least `ping_after` (but not evictable) is listed
    /// for a ping. Each room entry is read-locked only while it is scanned.
    pub fn plan_sweep(&self, now: Instant, ping_after: Duration, evict_after: Duration) -> SweepPlan {
        let mut ping = BTreeSet::new();
        let mut evict = Vec::new();

        for room in self.rooms.iter() {
            for member in room.members() {
                let idle = now.saturating_duration_since(member.last_seen);
                if idle >= evict_after {
                    evict.push((room.name.clone(), member.peer.endpoint));
                } else if idle >= ping_after {
                    ping.insert(member.peer.endpoint);
                }
            }
        }

        SweepPlan {
            ping: ping.into_iter().collect(),
            evict,
        }
    }

    /// Evict every member idle for at least `evict_after`
    ///
    /// Returns the resulting snapshot of each affected room, in eviction
    /// order. A room that lost several members appears once per eviction;
    /// only its last snapshot is current.
    pub fn evict_idle(
        &self,
        plan: &SweepPlan,
        now: Instant,
        evict_after: Duration,
    ) -> Vec<RosterSnapshot> {
        let Some(cutoff) = now.checked_sub(evict_after) else {
            return Vec::new();
        };
        plan.evict
            .iter()
            .filter_map(|(room, endpoint)| self.leave_if_idle(room, *endpoint, cutoff))
            .collect()
    }
}
