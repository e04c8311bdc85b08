//! Bounded dedup memory
//!
//! Relays remember which messages they already processed. Identities carry
//! no sequence number, so the memory is bounded both by size (oldest entry
//! evicted first) and by a time window after which the same identity counts
//! as new again.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::codec::Message;

/// Which fields make two messages "the same".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityPolicy {
    /// `(source, destination, payload)`.
    #[default]
    SourceDestinationPayload,
    /// `(source, destination, payload, hop)`.
    IncludeHop,
}

/// Truncated hash of a message identity.
pub type IdentityDigest = [u8; 8];

/// Compute the identity digest of a message.
pub fn identity_digest(message: &Message, policy: IdentityPolicy) -> IdentityDigest {
    let mut hasher = Sha256::new();
    hasher.update(b"steami-mesh-identity-v1");
    hasher.update((message.source_id.len() as u32).to_le_bytes());
    hasher.update(message.source_id.as_bytes());
    match &message.destination_id {
        Some(destination) => {
            hasher.update([1u8]);
            hasher.update((destination.len() as u32).to_le_bytes());
            hasher.update(destination.as_bytes());
        }
        None => hasher.update([0u8]),
    }
    hasher.update(message.payload.to_le_bytes());
    if policy == IdentityPolicy::IncludeHop {
        hasher.update([message.hop_count]);
    }
    let hash = hasher.finalize();
    let mut digest = [0u8; 8];
    digest.copy_from_slice(&hash[..8]);
    digest
}

/// Seen-set with a capacity and an optional time window.
#[derive(Debug)]
pub struct SeenSet {
    /// Digest -> time of first sighting.
    entries: HashMap<IdentityDigest, Instant>,
    /// Insertion order; may hold superseded pairs, skipped on eviction.
    order: VecDeque<(IdentityDigest, Instant)>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl SeenSet {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    fn is_live(&self, seen_at: Instant, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(seen_at) < ttl,
            None => true,
        }
    }

    /// Record `digest` unless it is already known.
    /// Returns true if it was NEW.
    pub fn check_and_insert(&mut self, digest: IdentityDigest, now: Instant) -> bool {
        self.evict_expired(now);

        if let Some(seen_at) = self.entries.get(&digest) {
            if self.is_live(*seen_at, now) {
                return false;
            }
        }

        while self.entries.len() >= self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }
        self.entries.insert(digest, now);
        self.order.push_back((digest, now));
        true
    }

    /// Check membership without recording anything.
    pub fn contains(&self, digest: &IdentityDigest, now: Instant) -> bool {
        self.entries
            .get(digest)
            .map(|seen_at| self.is_live(*seen_at, now))
            .unwrap_or(false)
    }

    /// Forget entries older than the time window.
    pub fn evict_expired(&mut self, now: Instant) {
        let Some(ttl) = self.ttl else {
            return;
        };
        while let Some((digest, seen_at)) = self.order.front().copied() {
            if now.saturating_duration_since(seen_at) < ttl {
                break;
            }
            self.order.pop_front();
            if self.entries.get(&digest) == Some(&seen_at) {
                self.entries.remove(&digest);
            }
        }
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((digest, seen_at)) = self.order.pop_front() {
            if self.entries.get(&digest) == Some(&seen_at) {
                self.entries.remove(&digest);
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(256, Some(Duration::from_secs(30)))
    }
}
