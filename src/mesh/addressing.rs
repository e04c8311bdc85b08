//! Destination matching and presence bucketing

use serde::{Deserialize, Serialize};

use crate::codec::names::truncate_id;
use crate::codec::Packet;

/// Decides which packets concern this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addressing {
    local_id: String,
    /// Senders must start with this prefix; `None` accepts everyone.
    accept_prefix: Option<String>,
    /// Ids travel cut to this many bytes, so comparisons are made on the
    /// same suffix.
    id_len: Option<usize>,
}

impl Addressing {
    pub fn new(local_id: impl Into<String>, accept_prefix: Option<String>, id_len: Option<usize>) -> Self {
        Self {
            local_id: local_id.into(),
            accept_prefix,
            id_len,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Our id as it appears inside a message on the wire.
    pub fn wire_id(&self) -> &str {
        match self.id_len {
            Some(len) => truncate_id(&self.local_id, len),
            None => &self.local_id,
        }
    }

    pub fn accepts_sender(&self, sender: &str) -> bool {
        match &self.accept_prefix {
            Some(prefix) => sender.starts_with(prefix.as_str()),
            None => true,
        }
    }

    /// Sent by us, or a relayed copy of something we originated.
    pub fn is_own(&self, packet: &Packet) -> bool {
        packet.sender == self.local_id || packet.message.source_id == self.wire_id()
    }

    /// Explicit destination: exact id match. No destination: the sender
    /// passes the prefix filter.
    pub fn is_addressed_to_me(&self, packet: &Packet) -> bool {
        match &packet.message.destination_id {
            Some(destination) => destination == self.wire_id(),
            None => self.accepts_sender(&packet.sender),
        }
    }
}

/// Coarse presence category of the default three-bucket layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceBucket {
    Near,
    Mid,
    Far,
}

impl PresenceBucket {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PresenceBucket::Near),
            1 => Some(PresenceBucket::Mid),
            2 => Some(PresenceBucket::Far),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            PresenceBucket::Near => 0,
            PresenceBucket::Mid => 1,
            PresenceBucket::Far => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PresenceBucket::Near => "NEAR",
            PresenceBucket::Mid => "MID",
            PresenceBucket::Far => "FAR",
        }
    }
}

/// Ordered thresholds splitting a scalar into buckets.
///
/// Bucket `i` covers `[thresholds[i-1], thresholds[i])`: lower bound
/// inclusive, upper bound exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucketing {
    pub thresholds: Vec<i32>,
}

impl Bucketing {
    pub fn new(thresholds: Vec<i32>) -> Self {
        Self { thresholds }
    }

    /// Bucket code of `value`. Saturates at 255 for oversized layouts.
    pub fn classify(&self, value: i32) -> u8 {
        let bucket = self.thresholds.iter().take_while(|t| value >= **t).count();
        u8::try_from(bucket).unwrap_or(u8::MAX)
    }

    /// Code of the last bucket.
    pub fn max_code(&self) -> u8 {
        u8::try_from(self.thresholds.len()).unwrap_or(u8::MAX)
    }

    pub fn bucket_count(&self) -> usize {
        self.thresholds.len() + 1
    }

    /// Thresholds must be strictly ascending and fit a one-byte code.
    pub fn is_valid(&self) -> bool {
        !self.thresholds.is_empty()
            && self.thresholds.len() < u8::MAX as usize
            && self.thresholds.windows(2).all(|w| w[0] < w[1])
    }
}

impl Default for Bucketing {
    /// Near below 300 mm, mid up to 600 mm, far beyond.
    fn default() -> Self {
        Self::new(vec![300, 600])
    }
}
