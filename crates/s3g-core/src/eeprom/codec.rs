//! Pure field codecs for EEPROM contents
//!
//! Erased EEPROM reads back as `0xFF`; a field whose bytes are all `0xFF`
//! (or that could not be read in full) is unset and callers fall back to a
//! default.

use byteorder::{ByteOrder, LittleEndian};
use std::ops::Range;

/// One packet's worth of a larger write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// EEPROM offset of the first byte
    pub offset: u16,
    /// Range of the source buffer carried by this chunk
    pub range: Range<usize>,
}

/// Split a write of `len` bytes at `offset` into chunks of at most `max`
/// bytes, in increasing offset order
pub fn plan_chunks(offset: u16, len: usize, max: usize) -> Vec<Chunk> {
    let max = max.max(1);
    (0..len)
        .step_by(max)
        .map(|start| Chunk {
            offset: offset.wrapping_add(start as u16),
            range: start..(start + max).min(len),
        })
        .collect()
}

/// True if the field reads as erased memory
pub fn is_unset(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0xFF)
}

/// Little-endian u16, or `None` if short or erased
pub fn read_u16(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < 2 || is_unset(&bytes[..2]) {
        return None;
    }
    Some(LittleEndian::read_u16(bytes))
}

/// Little-endian u32, or `None` if short or erased
pub fn read_u32(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < 4 || is_unset(&bytes[..4]) {
        return None;
    }
    Some(LittleEndian::read_u32(bytes))
}

/// Little-endian bytes of a u16
pub fn u16_bytes(value: u16) -> [u8; 2] {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, value);
    buf
}

/// Little-endian bytes of a u32
pub fn u32_bytes(value: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, value);
    buf
}

/// Largest value an 8.8 fixed-point field can hold
pub const FIXED88_MAX: f64 = 255.0 + 255.0 / 256.0;

/// Encode as 8.8 fixed point: whole part then 256ths, both unsigned bytes.
/// Out-of-range values are clamped.
pub fn encode_fixed88(value: f64) -> [u8; 2] {
    let value = if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, FIXED88_MAX)
    };
    let whole = value.floor();
    let frac = ((value - whole) * 256.0).floor();
    [whole as u8, frac as u8]
}

/// Inverse of `encode_fixed88`
pub fn decode_fixed88(bytes: [u8; 2]) -> f64 {
    bytes[0] as f64 + bytes[1] as f64 / 256.0
}

/// 8.8 fixed point, or `None` if short or erased
pub fn read_fixed88(bytes: &[u8]) -> Option<f64> {
    if bytes.len() < 2 || is_unset(&bytes[..2]) {
        return None;
    }
    Some(decode_fixed88([bytes[0], bytes[1]]))
}

/// Encode a string into a fixed-length ISO-8859-1 field. Longer strings are
/// truncated; characters outside Latin-1 become `?`; the rest is NUL.
pub fn encode_latin1(text: &str, len: usize) -> Vec<u8> {
    let mut field: Vec<u8> = text
        .chars()
        .take(len)
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect();
    field.resize(len, 0);
    field
}

/// Decode a NUL-terminated ISO-8859-1 field
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| char::from(b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_chunk_plan() {
        let chunks = plan_chunks(0x40, 25, 11);
        assert_eq!(
            chunks,
            vec![
                Chunk { offset: 0x40, range: 0..11 },
                Chunk { offset: 0x4B, range: 11..22 },
                Chunk { offset: 0x56, range: 22..25 },
            ]
        );
        assert_eq!(plan_chunks(0, 16, 16).len(), 1);
        assert!(plan_chunks(0, 0, 11).is_empty());
    }

    #[test]
    fn test_unset_fields() {
        assert_eq!(read_u16(&[0xFF, 0xFF]), None);
        assert_eq!(read_u16(&[0x2C]), None);
        assert_eq!(read_u16(&[0x2C, 0x01]), Some(300));
        assert_eq!(read_u32(&[0xA0, 0x86, 0x01, 0x00]), Some(100_000));
        assert_eq!(read_u32(&[0xFF; 4]), None);
        assert_eq!(read_fixed88(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn test_fixed_point() {
        assert_eq!(encode_fixed88(7.0), [7, 0]);
        assert_eq!(encode_fixed88(0.325), [0, 83]);
        assert_eq!(encode_fixed88(36.5), [36, 128]);
        assert_eq!(decode_fixed88([36, 128]), 36.5);
        // Clamped rather than wrapped
        assert_eq!(encode_fixed88(300.0), [255, 255]);
        assert_eq!(encode_fixed88(-1.0), [0, 0]);
    }

    #[test]
    fn test_latin1_field() {
        assert_eq!(encode_latin1("Cupcake", 10), b"Cupcake\0\0\0".to_vec());
        assert_eq!(encode_latin1("Thing-O-Matic Deluxe", 16), b"Thing-O-Matic De".to_vec());
        assert_eq!(encode_latin1("Größe€", 8), vec![b'G', b'r', 0xF6, 0xDF, b'e', b'?', 0, 0]);
        assert_eq!(decode_latin1(&[b'G', b'r', 0xF6, 0xDF, b'e', 0, b'x']), "Größe");
        assert_eq!(decode_latin1(b"full-length-name"), "full-length-name");
    }
}
