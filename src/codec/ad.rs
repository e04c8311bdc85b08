//! Advertising data framing
//!
//! A legacy advertising frame is a run of AD structures, each
//! `[len][type][data...]` where `len` counts the type byte and the data.
//! Our frames carry exactly two: the complete local name and one
//! manufacturer-specific field.

use super::CodecError;

/// Link-layer budget of a legacy advertising frame.
pub const ADV_DATA_MAX: usize = 31;

pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// One `[len][type][data]` structure borrowed from a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdStructure<'a> {
    pub ad_type: u8,
    pub data: &'a [u8],
}

/// Size of a frame holding a name of `name_len` bytes and a manufacturer
/// field of `manufacturer_len` bytes.
pub fn frame_len(name_len: usize, manufacturer_len: usize) -> usize {
    2 + name_len + 2 + manufacturer_len
}

/// Build `[len][0x09][name] [len][0xFF][manufacturer]`.
pub fn build_frame(name: &str, manufacturer: &[u8]) -> Result<Vec<u8>, CodecError> {
    let size = frame_len(name.len(), manufacturer.len());
    if size > ADV_DATA_MAX {
        return Err(CodecError::PayloadOverflow(format!(
            "frame needs {} bytes, budget is {}",
            size, ADV_DATA_MAX
        )));
    }

    let mut frame = Vec::with_capacity(size);
    frame.push((name.len() + 1) as u8);
    frame.push(AD_TYPE_COMPLETE_LOCAL_NAME);
    frame.extend_from_slice(name.as_bytes());
    frame.push((manufacturer.len() + 1) as u8);
    frame.push(AD_TYPE_MANUFACTURER_DATA);
    frame.extend_from_slice(manufacturer);
    Ok(frame)
}

/// Split a frame into its AD structures.
///
/// A zero length byte ends the significant part (the rest is padding).
pub fn parse(frame: &[u8]) -> Result<Vec<AdStructure<'_>>, CodecError> {
    if frame.len() > ADV_DATA_MAX {
        return Err(CodecError::MalformedPacket(format!(
            "frame is {} bytes, budget is {}",
            frame.len(),
            ADV_DATA_MAX
        )));
    }

    let mut structures = Vec::new();
    let mut i = 0usize;
    while i < frame.len() {
        let len = frame[i] as usize;
        if len == 0 {
            break;
        }
        let end = i + 1 + len;
        if end > frame.len() {
            return Err(CodecError::MalformedPacket(format!(
                "AD structure at offset {} declares {} bytes, {} left",
                i,
                len,
                frame.len() - i - 1
            )));
        }
        structures.push(AdStructure {
            ad_type: frame[i + 1],
            data: &frame[i + 2..end],
        });
        i = end;
    }
    Ok(structures)
}

/// First structure of the given type.
pub fn find(frame: &[u8], ad_type: u8) -> Result<Option<&[u8]>, CodecError> {
    Ok(parse(frame)?
        .into_iter()
        .find(|s| s.ad_type == ad_type)
        .map(|s| s.data))
}

/// Complete local name of a frame, if it has a readable one.
pub fn local_name(frame: &[u8]) -> Option<String> {
    let data = find(frame, AD_TYPE_COMPLETE_LOCAL_NAME).ok()??;
    String::from_utf8(data.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_frame_layout() {
        let frame = build_frame("STeaMi-S1", &[0xFA, 0x00]).unwrap();
        assert_eq!(frame[0], 10);
        assert_eq!(frame[1], AD_TYPE_COMPLETE_LOCAL_NAME);
        assert_eq!(&frame[2..11], b"STeaMi-S1");
        assert_eq!(frame[11], 3);
        assert_eq!(frame[12], AD_TYPE_MANUFACTURER_DATA);
        assert_eq!(&frame[13..], &[0xFA, 0x00]);
        assert_eq!(frame.len(), frame_len(9, 2));
    }

    #[test]
    fn test_build_frame_budget() {
        // 2 + 20 + 2 + 7 = 31 fits exactly.
        assert!(build_frame(&"n".repeat(20), &[0u8; 7]).is_ok());
        let result = build_frame(&"n".repeat(20), &[0u8; 8]);
        assert!(matches!(result, Err(CodecError::PayloadOverflow(_))));
    }

    #[test]
    fn test_parse_stops_at_padding() {
        let mut frame = build_frame("A", &[0x01]).unwrap();
        frame.extend_from_slice(&[0, 0, 0]);
        let structures = parse(&frame).unwrap();
        assert_eq!(structures.len(), 2);
        assert_eq!(structures[1].data, &[0x01]);
    }

    #[test]
    fn test_parse_rejects_overrun() {
        assert!(matches!(
            parse(&[0x05, 0x09, b'A']),
            Err(CodecError::MalformedPacket(_))
        ));
        // Length byte with no room for the type.
        assert!(matches!(parse(&[0x01]), Err(CodecError::MalformedPacket(_))));
    }

    #[test]
    fn test_parse_rejects_oversized_frame() {
        assert!(matches!(
            parse(&[0u8; 32]),
            Err(CodecError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_local_name() {
        let frame = build_frame("STeaMi-R", &[0x00]).unwrap();
        assert_eq!(local_name(&frame).as_deref(), Some("STeaMi-R"));
        assert_eq!(local_name(&[0x02, 0xFF, 0x00]), None);
        assert_eq!(local_name(&[0x03, 0x09, 0xFF, 0xFE]), None);
    }
}
