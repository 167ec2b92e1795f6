//! QUIC variable-length integers (RFC 9000 §16).

use bytes::{Buf, BytesMut};

/// Largest value representable as a QUIC varint.
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Number of bytes `value` occupies on the wire.
pub fn varint_len(value: u64) -> usize {
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

/// Append `value` to `buf` in varint encoding.
///
/// Values above [`MAX_VARINT`] are not representable; they are clamped in
/// debug builds and silently truncated to the 8-byte form otherwise, which
/// callers avoid by construction (lengths and IDs are bounded well below).
pub fn put_varint(buf: &mut BytesMut, value: u64) {
    debug_assert!(value <= MAX_VARINT, "varint overflow: {value}");
    if value < 1 << 6 {
        buf.extend_from_slice(&[value as u8]);
    } else if value < 1 << 14 {
        buf.extend_from_slice(&((value as u16) | 0x4000).to_be_bytes());
    } else if value < 1 << 30 {
        buf.extend_from_slice(&((value as u32) | 0x8000_0000).to_be_bytes());
    } else {
        buf.extend_from_slice(&(value | 0xc000_0000_0000_0000).to_be_bytes());
    }
}

/// Read a varint from the start of `data` without consuming.
///
/// Returns the value and the number of bytes it occupied, or `None` when
/// `data` does not hold a complete varint.
pub fn peek_varint(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    let len = 1usize << (first >> 6);
    if data.len() < len {
        return None;
    }

    let mut value = (first & 0x3f) as u64;
    for byte in &data[1..len] {
        value = (value << 8) | *byte as u64;
    }
    Some((value, len))
}

/// Read and consume a varint from `buf`.
pub fn get_varint(buf: &mut BytesMut) -> Option<u64> {
    let (value, len) = peek_varint(buf)?;
    buf.advance(len);
    Some(value)
}
