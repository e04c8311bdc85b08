//! Most-recently-heard peers
//!
//! Keyed by source name, refreshed on every decoded inbound message. The
//! only consumer view is "the K most recent, non-stale peers".

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Last value heard from one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    pub value: i32,
    pub last_seen: Instant,
}

/// Read-only row of the recent-peers view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub name: String,
    pub value: i32,
    pub age: Duration,
}

#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<String, PeerEntry>,
    capacity: usize,
    /// Entries older than this are hidden from views and pruned.
    stale_after: Option<Duration>,
}

impl PeerTable {
    pub fn new(capacity: usize, stale_after: Option<Duration>) -> Self {
        Self {
            peers: HashMap::new(),
            capacity: capacity.max(1),
            stale_after,
        }
    }

    /// Add or refresh a peer.
    pub fn upsert(&mut self, name: &str, value: i32, now: Instant) {
        if let Some(entry) = self.peers.get_mut(name) {
            entry.value = value;
            entry.last_seen = now;
            return;
        }
        if self.peers.len() >= self.capacity {
            self.evict_oldest();
        }
        self.peers.insert(
            name.to_string(),
            PeerEntry {
                value,
                last_seen: now,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&PeerEntry> {
        self.peers.get(name)
    }

    fn is_stale(&self, entry: &PeerEntry, now: Instant) -> bool {
        match self.stale_after {
            Some(limit) => now.saturating_duration_since(entry.last_seen) >= limit,
            None => false,
        }
    }

    /// Up to `k` non-stale peers, most recently heard first.
    pub fn recent(&self, k: usize, now: Instant) -> Vec<PeerSnapshot> {
        let mut rows: Vec<(&String, &PeerEntry)> = self
            .peers
            .iter()
            .filter(|(_, entry)| !self.is_stale(entry, now))
            .collect();
        rows.sort_by(|a, b| {
            b.1.last_seen
                .cmp(&a.1.last_seen)
                .then_with(|| a.0.cmp(b.0))
        });
        rows.into_iter()
            .take(k)
            .map(|(name, entry)| PeerSnapshot {
                name: name.clone(),
                value: entry.value,
                age: now.saturating_duration_since(entry.last_seen),
            })
            .collect()
    }

    /// Remove stale peers; returns how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let Some(limit) = self.stale_after else {
            return 0;
        };
        let before = self.peers.len();
        self.peers
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) < limit);
        before - self.peers.len()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .peers
            .iter()
            .min_by_key(|(_, entry)| entry.last_seen)
            .map(|(name, _)| name.clone())
        {
            self.peers.remove(&oldest);
        }
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new(32, Some(Duration::from_secs(10)))
    }
}
