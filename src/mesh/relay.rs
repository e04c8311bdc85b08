//! Relay / dedup engine
//!
//! Decides, for every decoded packet, whether it is ours, filtered, a
//! duplicate, or new; records new ones; works out the local delivery; and
//! for relaying roles prepares the re-broadcast in a single outbound slot.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::addressing::{Addressing, Bucketing};
use super::seen::{identity_digest, IdentityPolicy, SeenSet};
use crate::codec::{Message, Packet};

/// What a node does in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Broadcasts its own sensed value and consumes what is addressed to it.
    Endpoint,
    /// Forwards other nodes' messages, never originates telemetry.
    Relay,
    /// Forwards after replacing the payload by its bucket code.
    TerminalRelay,
}

impl NodeRole {
    pub fn relays(self) -> bool {
        matches!(self, NodeRole::Relay | NodeRole::TerminalRelay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Sent by this node, or a relayed copy of its own message.
    Own,
    /// Sender rejected by the prefix filter.
    Filtered,
}

/// A message that concerns this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub source_id: String,
    pub payload: i32,
    /// Indicator code derived from the payload, if it maps to one.
    pub code: Option<u8>,
}

/// Re-broadcast waiting for the next advertise window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingForward {
    pub message: Message,
    /// Indicator to hold on while it is advertised.
    pub code: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ignored(IgnoreReason),
    Duplicate,
    Accepted {
        delivery: Option<Delivery>,
        forward: Option<Message>,
    },
}

/// Counters kept by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub ignored: u64,
    pub queued: u64,
    /// Queued forwards overwritten by a newer message before being sent.
    pub replaced: u64,
    pub hop_limited: u64,
}

/// Relay behaviour knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub role: NodeRole,
    pub identity: IdentityPolicy,
    /// Messages that already made this many hops are not forwarded.
    pub max_hops: Option<u8>,
    /// Re-address forwarded messages to this consumer.
    pub forward_to: Option<String>,
    pub bucketing: Option<Bucketing>,
}

impl RelaySettings {
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            identity: IdentityPolicy::default(),
            max_hops: None,
            forward_to: None,
            bucketing: None,
        }
    }
}

pub struct RelayEngine {
    settings: RelaySettings,
    addressing: Addressing,
    seen: SeenSet,
    pending: Option<PendingForward>,
    stats: RelayStats,
}

impl RelayEngine {
    pub fn new(settings: RelaySettings, addressing: Addressing, seen: SeenSet) -> Self {
        Self {
            settings,
            addressing,
            seen,
            pending: None,
            stats: RelayStats::default(),
        }
    }

    pub fn role(&self) -> NodeRole {
        self.settings.role
    }

    pub fn addressing(&self) -> &Addressing {
        &self.addressing
    }

    /// Indicator code for a payload: its bucket when bucketing is
    /// configured, otherwise the payload itself when it is a valid code.
    pub fn code_for(&self, payload: i32) -> Option<u8> {
        match &self.settings.bucketing {
            Some(bucketing) => Some(bucketing.classify(payload)),
            None => u8::try_from(payload).ok(),
        }
    }

    /// Run one decoded packet through the engine.
    pub fn process(&mut self, packet: &Packet, now: Instant) -> Disposition {
        if self.addressing.is_own(packet) {
            self.stats.ignored += 1;
            return Disposition::Ignored(IgnoreReason::Own);
        }
        if !self.addressing.accepts_sender(&packet.sender) {
            self.stats.ignored += 1;
            return Disposition::Ignored(IgnoreReason::Filtered);
        }

        let digest = identity_digest(&packet.message, self.settings.identity);
        if !self.seen.check_and_insert(digest, now) {
            self.stats.duplicates += 1;
            log::debug!(
                "Duplicate from {} (source {}, payload {})",
                packet.sender,
                packet.message.source_id,
                packet.message.payload
            );
            return Disposition::Duplicate;
        }
        self.stats.accepted += 1;

        let message = &packet.message;
        let delivery = self.addressing.is_addressed_to_me(packet).then(|| Delivery {
            source_id: message.source_id.clone(),
            payload: message.payload,
            code: self.code_for(message.payload),
        });

        let forward = if self.settings.role.relays() {
            self.prepare_forward(message)
        } else {
            None
        };

        Disposition::Accepted { delivery, forward }
    }

    fn prepare_forward(&mut self, message: &Message) -> Option<Message> {
        if let Some(max_hops) = self.settings.max_hops {
            if message.hop_count >= max_hops {
                self.stats.hop_limited += 1;
                log::debug!(
                    "Not forwarding {} at hop {} (ceiling {})",
                    message.source_id,
                    message.hop_count,
                    max_hops
                );
                return None;
            }
        }
        let Some(mut forward) = message.forwarded() else {
            self.stats.hop_limited += 1;
            return None;
        };

        let code = self.code_for(message.payload);
        if self.settings.role == NodeRole::TerminalRelay {
            let bucketing = self.settings.bucketing.clone().unwrap_or_default();
            forward.payload = bucketing.classify(message.payload) as i32;
        }
        if let Some(destination) = &self.settings.forward_to {
            forward.destination_id = Some(destination.clone());
        }

        // Latest accepted message wins the single slot.
        let replaced = self.pending.replace(PendingForward {
            message: forward.clone(),
            code,
        });
        if replaced.is_some() {
            self.stats.replaced += 1;
        }
        self.stats.queued += 1;
        Some(forward)
    }

    /// Empty the outbound slot.
    pub fn take_forward(&mut self) -> Option<PendingForward> {
        self.pending.take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::addressing::PresenceBucket;
    use std::time::Duration;

    fn engine(role: NodeRole, name: &str, prefix: Option<&str>) -> RelayEngine {
        let mut settings = RelaySettings::new(role);
        if role == NodeRole::TerminalRelay {
            settings.bucketing = Some(Bucketing::default());
        }
        RelayEngine::new(
            settings,
            Addressing::new(name, prefix.map(String::from), Some(6)),
            SeenSet::new(64, None),
        )
    }

    fn structured(sender: &str, source: &str, payload: i32, hop: u8) -> Packet {
        let mut message = Message::new(source, payload).to("R9");
        message.hop_count = hop;
        Packet::new(sender, message)
    }

    #[test]
    fn test_same_message_twice_forwards_once() {
        let mut relay = engine(NodeRole::Relay, "STeaMi-R1", Some("STeaMi"));
        let now = Instant::now();
        let packet = structured("STeaMi-S1", "S1", 420, 0);

        let first = relay.process(&packet, now);
        assert!(matches!(first, Disposition::Accepted { forward: Some(_), .. }));
        assert_eq!(relay.seen_len(), 1);
        assert!(relay.take_forward().is_some());

        let second = relay.process(&packet, now);
        assert_eq!(second, Disposition::Duplicate);
        assert_eq!(relay.seen_len(), 1);
        assert!(relay.take_forward().is_none());
        assert_eq!(relay.stats().queued, 1);
        assert_eq!(relay.stats().duplicates, 1);
    }

    #[test]
    fn test_forward_increments_hop_once() {
        let mut relay = engine(NodeRole::Relay, "STeaMi-R1", None);
        for hop in [0u8, 1, 7, 254] {
            let packet = structured("STeaMi-R2", "S1", hop as i32, hop);
            relay.process(&packet, Instant::now());
            let forward = relay.take_forward().unwrap();
            assert_eq!(forward.message.hop_count, hop + 1);
            assert_eq!(forward.message.source_id, "S1");
            assert_eq!(forward.message.payload, hop as i32);
        }
    }

    #[test]
    fn test_hop_255_cannot_be_forwarded() {
        let mut relay = engine(NodeRole::Relay, "STeaMi-R1", None);
        let disposition = relay.process(&structured("STeaMi-R2", "S1", 1, u8::MAX), Instant::now());
        assert!(matches!(disposition, Disposition::Accepted { forward: None, .. }));
        assert_eq!(relay.stats().hop_limited, 1);
    }

    #[test]
    fn test_hop_ceiling() {
        let mut settings = RelaySettings::new(NodeRole::Relay);
        settings.max_hops = Some(2);
        let mut relay = RelayEngine::new(
            settings,
            Addressing::new("STeaMi-R1", None, Some(6)),
            SeenSet::new(64, None),
        );
        relay.process(&structured("STeaMi-R2", "S1", 1, 1), Instant::now());
        assert!(relay.take_forward().is_some());
        relay.process(&structured("STeaMi-R2", "S1", 2, 2), Instant::now());
        assert!(relay.take_forward().is_none());
        assert_eq!(relay.stats().hop_limited, 1);
    }

    #[test]
    fn test_own_and_filtered_are_ignored() {
        let mut relay = engine(NodeRole::Relay, "STeaMi-R1", Some("STeaMi-S"));
        let now = Instant::now();
        assert_eq!(
            relay.process(&Packet::originated("STeaMi-R1", 1), now),
            Disposition::Ignored(IgnoreReason::Own)
        );
        assert_eq!(
            relay.process(&Packet::originated("STeaMi-R2", 1), now),
            Disposition::Ignored(IgnoreReason::Filtered)
        );
        assert!(relay.seen_len() == 0);
    }

    #[test]
    fn test_endpoint_never_forwards() {
        let mut endpoint = engine(NodeRole::Endpoint, "R9", Some("STeaMi-R"));
        let packet = structured("STeaMi-R1", "S1", 250, 1);
        match endpoint.process(&packet, Instant::now()) {
            Disposition::Accepted { delivery, forward } => {
                let delivery = delivery.unwrap();
                assert_eq!(delivery.payload, 250);
                assert_eq!(delivery.source_id, "S1");
                assert!(forward.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!endpoint.has_pending());
    }

    #[test]
    fn test_delivery_needs_matching_destination() {
        let mut endpoint = engine(NodeRole::Endpoint, "R8", None);
        let disposition = endpoint.process(&structured("STeaMi-R1", "S1", 250, 1), Instant::now());
        assert_eq!(
            disposition,
            Disposition::Accepted {
                delivery: None,
                forward: None
            }
        );
    }

    #[test]
    fn test_terminal_relay_buckets_payload() {
        let mut relay = engine(NodeRole::TerminalRelay, "STeaMi-R", Some("STeaMi-S"));
        relay.process(&Packet::originated("STeaMi-S", 250), Instant::now());
        let forward = relay.take_forward().unwrap();
        assert_eq!(forward.message.payload, PresenceBucket::Near.code() as i32);
        assert_eq!(forward.code, Some(0));
        assert_eq!(forward.message.hop_count, 1);

        relay.process(&Packet::originated("STeaMi-S", 650), Instant::now());
        let forward = relay.take_forward().unwrap();
        assert_eq!(forward.message.payload, PresenceBucket::Far.code() as i32);
    }

    #[test]
    fn test_latest_message_wins_slot() {
        let mut relay = engine(NodeRole::Relay, "STeaMi-R1", None);
        let now = Instant::now();
        relay.process(&Packet::originated("STeaMi-S1", 100), now);
        relay.process(&Packet::originated("STeaMi-S2", 200), now);
        relay.process(&Packet::originated("STeaMi-S1", 300), now);
        let forward = relay.take_forward().unwrap();
        assert_eq!(forward.message.source_id, "STeaMi-S1");
        assert_eq!(forward.message.payload, 300);
        assert_eq!(relay.stats().replaced, 2);
        assert!(!relay.has_pending());
    }

    #[test]
    fn test_forward_to_readdresses() {
        let mut settings = RelaySettings::new(NodeRole::Relay);
        settings.forward_to = Some("A".into());
        let mut relay = RelayEngine::new(
            settings,
            Addressing::new("STeaMi-R1", None, Some(6)),
            SeenSet::new(64, None),
        );
        relay.process(&structured("STeaMi-S1", "S1", 5, 0), Instant::now());
        let forward = relay.take_forward().unwrap();
        assert_eq!(forward.message.destination_id.as_deref(), Some("A"));
    }

    #[test]
    fn test_duplicate_forgotten_after_window() {
        let mut relay = RelayEngine::new(
            RelaySettings::new(NodeRole::Relay),
            Addressing::new("STeaMi-R1", None, None),
            SeenSet::new(64, Some(Duration::from_secs(1))),
        );
        let t0 = Instant::now();
        let packet = Packet::originated("STeaMi-S1", 42);
        relay.process(&packet, t0);
        assert_eq!(
            relay.process(&packet, t0 + Duration::from_millis(500)),
            Disposition::Duplicate
        );
        assert!(matches!(
            relay.process(&packet, t0 + Duration::from_secs(1)),
            Disposition::Accepted { .. }
        ));
    }

    #[test]
    fn test_relay_code_passes_through_presence() {
        let relay = engine(NodeRole::Relay, "STeaMi-R2", None);
        assert_eq!(relay.code_for(2), Some(2));
        assert_eq!(relay.code_for(-1), None);
        assert_eq!(relay.code_for(300), None);
    }
}
