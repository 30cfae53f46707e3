//! Unsigned LEB128 varints.
//!
//! Seven bits per byte, least significant group first; the high bit of each
//! byte marks a continuation.

use crate::error::ProtocolError;
use bytes::BufMut;

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends `value` to `buf`.
pub fn put_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Returns the number of bytes `value` occupies once encoded.
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Decodes a varint from the front of `data`.
///
/// Returns `Ok(None)` when `data` ends before the terminating byte, and the
/// decoded value with its encoded length otherwise.
pub fn decode_varint(data: &[u8]) -> Result<Option<(u64, usize)>, ProtocolError> {
    let mut value: u64 = 0;

    for (i, &byte) in data.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(ProtocolError::VarintOverflow { bits: 64 });
        }

        let group = u64::from(byte & 0x7f);
        if i == MAX_VARINT_LEN - 1 && group > 1 {
            return Err(ProtocolError::VarintOverflow { bits: 64 });
        }
        value |= group << (7 * i);

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if data.len() >= MAX_VARINT_LEN {
        return Err(ProtocolError::VarintOverflow { bits: 64 });
    }
    Ok(None)
}
