//! Unsigned LEB128 varints.
//!
//! Used for CID fields and for every frame length prefix on the wire.

use crate::wire::WireError;

/// Longest valid encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

/// Append the LEB128 encoding of `value` to `out`.
pub fn encode_uvarint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        if value < 0x80 {
            out.push(value as u8);
            return;
        }
        out.push(0x80 | (value & 0x7f) as u8);
        value >>= 7;
    }
}

/// Number of bytes `encode_uvarint` would produce for `value`.
pub fn uvarint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Decode a LEB128 value from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed. Rejects encodings
/// with a trailing zero continuation byte (e.g. `[0x81, 0x00]`) so every
/// value has exactly one representation.
pub fn decode_uvarint(bytes: &[u8]) -> Result<(u64, usize), WireError> {
    let mut out = 0u64;

    for (n, byte) in bytes.iter().enumerate() {
        if n >= MAX_VARINT_LEN {
            return Err(WireError::VarintOverflow);
        }

        let chunk = u64::from(byte & 0x7f);
        if n == MAX_VARINT_LEN - 1 && chunk > 1 {
            return Err(WireError::VarintOverflow);
        }
        out |= chunk << (7 * n);

        if byte & 0x80 == 0 {
            if n >= 1 && *byte == 0 {
                return Err(WireError::VarintNotMinimal);
            }
            return Ok((out, n + 1));
        }
    }

    Err(WireError::Truncated)
}
