//! Node naming helpers
//!
//! Board names share a long common prefix (`STeaMi-`) and differ only in a
//! short suffix, so every shortening keeps the end of the name.

/// Default broadcast name prefix of the boards.
pub const NAME_PREFIX: &str = "STeaMi";

/// Keep the last characters of `id` so that it fits in `max_len` bytes.
///
/// Never splits a UTF-8 character; the result may be shorter than
/// `max_len` when a multi-byte character straddles the cut.
pub fn truncate_id(id: &str, max_len: usize) -> &str {
    if id.len() <= max_len {
        return id;
    }
    let mut start = id.len() - max_len;
    while !id.is_char_boundary(start) {
        start += 1;
    }
    &id[start..]
}

/// Name derived from the last two bytes of the MAC address, e.g.
/// `STeaMi-1A2B`.
pub fn device_name_from_mac(prefix: &str, mac: &[u8]) -> String {
    let tail = &mac[mac.len().saturating_sub(2)..];
    format!("{}-{}", prefix, hex::encode_upper(tail))
}

/// Short label used on the 128 px screen (last 4 characters).
pub fn display_suffix(name: &str) -> &str {
    truncate_id(name, 4)
}
