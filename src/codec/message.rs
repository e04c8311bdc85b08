//! Application message and the frame-level packet carrying it

use serde::{Deserialize, Serialize};

/// The unit exchanged over the air.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    /// Node the value originates from.
    pub source_id: String,
    /// Intended consumer, or `None` for "anyone interested in this source".
    pub destination_id: Option<String>,
    /// Scalar value (distance in mm, presence bucket code, ...).
    pub payload: i32,
    /// Number of relay retransmissions so far.
    pub hop_count: u8,
}

impl Message {
    /// A fresh message originating at `source_id`.
    pub fn new(source_id: impl Into<String>, payload: i32) -> Self {
        Self {
            source_id: source_id.into(),
            destination_id: None,
            payload,
            hop_count: 0,
        }
    }

    /// Address the message to a specific consumer.
    pub fn to(mut self, destination_id: impl Into<String>) -> Self {
        self.destination_id = Some(destination_id.into());
        self
    }

    /// Copy for re-broadcast with the hop count incremented.
    /// Returns `None` if the hop count cannot grow any further.
    pub fn forwarded(&self) -> Option<Self> {
        let hop_count = self.hop_count.checked_add(1)?;
        Some(Self {
            hop_count,
            ..self.clone()
        })
    }
}

/// What one advertising frame carries: the broadcast name of the node that
/// transmitted it, and the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub sender: String,
    pub message: Message,
}

impl Packet {
    pub fn new(sender: impl Into<String>, message: Message) -> Self {
        Self {
            sender: sender.into(),
            message,
        }
    }

    /// Packet for a node broadcasting its own value under its own name.
    pub fn originated(sender: impl Into<String>, payload: i32) -> Self {
        let sender = sender.into();
        Self {
            message: Message::new(sender.clone(), payload),
            sender,
        }
    }
}
