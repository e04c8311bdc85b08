//! Message codec for the advertising mesh
//!
//! Turns a [`Packet`] into a legacy advertising frame and back. The
//! manufacturer field carries either a raw fixed-width integer or an
//! XOR-obfuscated structured record; which one is a deployment choice made
//! in [`PayloadFormat`], never guessed from the bytes.

pub mod ad;
pub mod message;
pub mod names;
pub mod record;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use message::{Message, Packet};

use ad::{AD_TYPE_COMPLETE_LOCAL_NAME, AD_TYPE_MANUFACTURER_DATA};
use record::{decode_record, encode_record, xor_in_place};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Inconsistent framing; the packet is discarded.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Value or frame does not fit; nothing is transmitted.
    #[error("Payload overflow: {0}")]
    PayloadOverflow(String),
}

/// Width of the payload scalar on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarWidth {
    I8,
    I16,
}

impl ScalarWidth {
    pub fn bytes(self) -> usize {
        match self {
            ScalarWidth::I8 => 1,
            ScalarWidth::I16 => 2,
        }
    }

    pub fn min(self) -> i32 {
        match self {
            ScalarWidth::I8 => i8::MIN as i32,
            ScalarWidth::I16 => i16::MIN as i32,
        }
    }

    pub fn max(self) -> i32 {
        match self {
            ScalarWidth::I8 => i8::MAX as i32,
            ScalarWidth::I16 => i16::MAX as i32,
        }
    }

    pub fn check(self, value: i32) -> Result<(), CodecError> {
        if value < self.min() || value > self.max() {
            return Err(CodecError::PayloadOverflow(format!(
                "{} does not fit in {} byte(s)",
                value,
                self.bytes()
            )));
        }
        Ok(())
    }

    /// Append `value` little-endian. The caller has checked the range.
    pub fn write(self, value: i32, buf: &mut Vec<u8>) {
        match self {
            ScalarWidth::I8 => buf.push(value as i8 as u8),
            ScalarWidth::I16 => buf.extend_from_slice(&(value as i16).to_le_bytes()),
        }
    }

    /// Read a value from exactly `self.bytes()` bytes.
    pub fn read(self, bytes: &[u8]) -> i32 {
        match self {
            ScalarWidth::I8 => bytes[0] as i8 as i32,
            ScalarWidth::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as i32,
        }
    }
}

/// What the manufacturer field of a deployment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadFormat {
    /// A bare signed integer; the sender name is the source.
    RawScalar { width: ScalarWidth },
    /// A structured record XOR-ed with a fixed key. Not a security measure.
    Obfuscated {
        key: u8,
        width: ScalarWidth,
        /// Ids are cut to their last `id_len` bytes.
        id_len: usize,
    },
}

impl PayloadFormat {
    pub const DEFAULT_KEY: u8 = 0x5A;
    pub const DEFAULT_ID_LEN: usize = 6;

    pub fn raw(width: ScalarWidth) -> Self {
        PayloadFormat::RawScalar { width }
    }

    pub fn obfuscated() -> Self {
        PayloadFormat::Obfuscated {
            key: Self::DEFAULT_KEY,
            width: ScalarWidth::I16,
            id_len: Self::DEFAULT_ID_LEN,
        }
    }

    pub fn width(&self) -> ScalarWidth {
        match self {
            PayloadFormat::RawScalar { width } | PayloadFormat::Obfuscated { width, .. } => *width,
        }
    }

    /// Maximum id length carried on the wire, if ids travel at all.
    pub fn id_len(&self) -> Option<usize> {
        match self {
            PayloadFormat::RawScalar { .. } => None,
            PayloadFormat::Obfuscated { id_len, .. } => Some(*id_len),
        }
    }
}

/// Encoder/decoder bound to one [`PayloadFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    format: PayloadFormat,
}

impl Codec {
    pub fn new(format: PayloadFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    /// Build the advertising frame for a packet.
    ///
    /// The raw format only transmits the sender name and the payload.
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        let opaque = match self.format {
            PayloadFormat::RawScalar { width } => {
                width.check(packet.message.payload)?;
                let mut buf = Vec::with_capacity(width.bytes());
                width.write(packet.message.payload, &mut buf);
                buf
            }
            PayloadFormat::Obfuscated { key, width, id_len } => {
                let mut buf = encode_record(&packet.message, width, id_len)?;
                xor_in_place(&mut buf, key);
                buf
            }
        };
        ad::build_frame(&packet.sender, &opaque)
    }

    /// Parse an advertising frame.
    pub fn decode(&self, frame: &[u8]) -> Result<Packet, CodecError> {
        let structures = ad::parse(frame)?;
        let name = structures
            .iter()
            .find(|s| s.ad_type == AD_TYPE_COMPLETE_LOCAL_NAME)
            .ok_or_else(|| CodecError::MalformedPacket("no name field".to_string()))?;
        let opaque = structures
            .iter()
            .find(|s| s.ad_type == AD_TYPE_MANUFACTURER_DATA)
            .ok_or_else(|| CodecError::MalformedPacket("no manufacturer field".to_string()))?;

        let sender = String::from_utf8(name.data.to_vec())
            .map_err(|_| CodecError::MalformedPacket("name is not UTF-8".to_string()))?;
        if sender.is_empty() {
            return Err(CodecError::MalformedPacket("empty name".to_string()));
        }

        let message = match self.format {
            PayloadFormat::RawScalar { width } => {
                if opaque.data.len() != width.bytes() {
                    return Err(CodecError::MalformedPacket(format!(
                        "expected {} payload byte(s), got {}",
                        width.bytes(),
                        opaque.data.len()
                    )));
                }
                Message::new(sender.clone(), width.read(opaque.data))
            }
            PayloadFormat::Obfuscated { key, width, .. } => {
                let mut buf = opaque.data.to_vec();
                xor_in_place(&mut buf, key);
                decode_record(&buf, width)?
            }
        };

        Ok(Packet { sender, message })
    }
}
