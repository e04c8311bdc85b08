//! Fixed-layout structured record carried by the obfuscated format
//!
//! Layout before obfuscation:
//! `[tag][src_len][src][dst_len][dst][payload, LE][hop]`, with
//! `dst_len == 0` meaning the message has no destination.

use super::message::Message;
use super::names::truncate_id;
use super::{CodecError, ScalarWidth};

/// Tag of the only record layout defined so far.
pub const RECORD_TAG: u8 = 0x01;

/// Byte-wise XOR; applying it twice restores the input.
pub fn xor_in_place(buf: &mut [u8], key: u8) {
    for b in buf.iter_mut() {
        *b ^= key;
    }
}

/// Size of a record for ids of the given byte lengths.
pub fn record_len(src_len: usize, dst_len: usize, width: ScalarWidth) -> usize {
    1 + 1 + src_len + 1 + dst_len + width.bytes() + 1
}

/// Serialize a message, truncating ids to their last `id_len` bytes.
pub fn encode_record(
    message: &Message,
    width: ScalarWidth,
    id_len: usize,
) -> Result<Vec<u8>, CodecError> {
    width.check(message.payload)?;
    let id_len = id_len.min(u8::MAX as usize);
    let src = truncate_id(&message.source_id, id_len);
    let dst = message
        .destination_id
        .as_deref()
        .map(|d| truncate_id(d, id_len))
        .unwrap_or("");

    let mut buf = Vec::with_capacity(record_len(src.len(), dst.len(), width));
    buf.push(RECORD_TAG);
    buf.push(src.len() as u8);
    buf.extend_from_slice(src.as_bytes());
    buf.push(dst.len() as u8);
    buf.extend_from_slice(dst.as_bytes());
    width.write(message.payload, &mut buf);
    buf.push(message.hop_count);
    Ok(buf)
}

/// Parse a record. The whole buffer must be consumed.
pub fn decode_record(bytes: &[u8], width: ScalarWidth) -> Result<Message, CodecError> {
    let mut reader = Reader { bytes, pos: 0 };

    let tag = reader.byte("tag")?;
    if tag != RECORD_TAG {
        return Err(CodecError::MalformedPacket(format!(
            "unknown record tag 0x{:02x}",
            tag
        )));
    }
    let src_len = reader.byte("source length")? as usize;
    let source_id = reader.text(src_len, "source id")?;
    if source_id.is_empty() {
        return Err(CodecError::MalformedPacket("empty source id".to_string()));
    }
    let dst_len = reader.byte("destination length")? as usize;
    let destination = reader.text(dst_len, "destination id")?;
    let payload = width.read(reader.take(width.bytes(), "payload")?);
    let hop_count = reader.byte("hop count")?;

    if reader.pos != bytes.len() {
        return Err(CodecError::MalformedPacket(format!(
            "{} trailing bytes after record",
            bytes.len() - reader.pos
        )));
    }

    Ok(Message {
        source_id,
        destination_id: (!destination.is_empty()).then_some(destination),
        payload,
        hop_count,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], CodecError> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(CodecError::MalformedPacket(format!(
                "record truncated in {} (need {} bytes at offset {}, have {})",
                what,
                n,
                self.pos,
                self.bytes.len() - self.pos
            )));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self, what: &str) -> Result<u8, CodecError> {
        Ok(self.take(1, what)?[0])
    }

    fn text(&mut self, n: usize, what: &str) -> Result<String, CodecError> {
        let raw = self.take(n, what)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CodecError::MalformedPacket(format!("{} is not UTF-8", what)))
    }
}
