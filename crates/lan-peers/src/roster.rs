//! Known peers with time-to-live expiry.
//!
//! The roster is a plain data structure and is not synchronised; the
//! listener task owns it and is the only writer.

use crate::model::Peer;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First sighting.
    New,
    /// Already known, but alias or device class changed.
    Changed,
    /// Already known; only the last-seen time moved.
    Refreshed,
}

#[derive(Debug)]
struct Entry {
    peer: Peer,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct Roster {
    ttl: Duration,
    entries: HashMap<SocketAddr, Entry>,
}

impl Roster {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert a peer or refresh its last-seen time. Status and queued
    /// requests of a known peer are kept.
    pub fn upsert(&mut self, peer: Peer, now: Instant) -> Upsert {
        match self.entries.get_mut(&peer.address) {
            Some(entry) => {
                entry.last_seen = now;
                if entry.peer.identity_differs(&peer) {
                    entry.peer.alias = peer.alias;
                    entry.peer.device = peer.device;
                    Upsert::Changed
                } else {
                    Upsert::Refreshed
                }
            }
            None => {
                self.entries.insert(
                    peer.address,
                    Entry {
                        peer,
                        last_seen: now,
                    },
                );
                Upsert::New
            }
        }
    }

    /// Remove and return every peer not seen within the TTL.
    pub fn expire(&mut self, now: Instant) -> Vec<Peer> {
        let ttl = self.ttl;
        let stale: Vec<SocketAddr> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > ttl)
            .map(|(addr, _)| *addr)
            .collect();

        stale
            .into_iter()
            .filter_map(|addr| self.entries.remove(&addr))
            .map(|e| e.peer)
            .collect()
    }

    pub fn find(&self, address: &SocketAddr) -> Option<&Peer> {
        self.entries.get(address).map(|e| &e.peer)
    }

    pub fn find_mut(&mut self, address: &SocketAddr) -> Option<&mut Peer> {
        self.entries.get_mut(address).map(|e| &mut e.peer)
    }

    pub fn remove(&mut self, address: &SocketAddr) -> Option<Peer> {
        self.entries.remove(address).map(|e| e.peer)
    }

    /// Snapshot ordered by alias, then address.
    pub fn all(&self) -> Vec<Peer> {
        let mut out: Vec<Peer> = self.entries.values().map(|e| e.peer.clone()).collect();
        out.sort_by(|a, b| (&a.alias, a.address).cmp(&(&b.alias, b.address)));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
