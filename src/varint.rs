//! Self-delimiting integer encoding shared by [`crate::ack`] and [`crate::seq`].
//!
//! This is a thin, named wrapper around [`octs::VarInt`] rather than a
//! hand-rolled continuation-bit reader: `octs::VarInt<u64>` already implements
//! the standard little-endian, 7-bits-per-byte continuation encoding this
//! protocol's wire format calls for (see `original_source`'s `varint.h`, which
//! this is bit-for-bit compatible with).

use octs::{Buf, BufTooShortOr, Decode, Encode, EncodeLen, FixedEncodeLenHint, Read, VarInt, Write};

/// Reads a `u64` varint from `src`.
///
/// # Errors
///
/// Errors if the buffer is exhausted before a complete varint is read, or if
/// the encoded value does not fit in a `u64`.
pub fn read_u64(src: &mut impl Buf) -> Result<u64, BufTooShortOr<octs::VarIntTooLarge>> {
    Ok(src.read::<VarInt<u64>>()?.0)
}

/// Writes `value` to `dst` as a varint.
///
/// # Errors
///
/// Errors if `dst` does not have enough remaining capacity.
pub fn write_u64(dst: &mut impl octs::Write, value: u64) -> Result<(), BufTooShortOr<core::convert::Infallible>> {
    dst.write(VarInt(value))
}

/// Number of bytes `value` would occupy when varint-encoded.
#[must_use]
pub fn encode_len_u64(value: u64) -> usize {
    VarInt(value).encode_len()
}

/// Largest number of bytes a varint-encoded `u64` can occupy.
pub const MAX_ENCODE_LEN: usize = <VarInt<u64> as FixedEncodeLenHint>::MAX_ENCODE_LEN;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for value in [0u64, 1, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_u64(&mut buf, value).unwrap();
            assert!(buf.len() <= MAX_ENCODE_LEN);
            let mut src = buf.as_slice();
            assert_eq!(value, read_u64(&mut src).unwrap());
            assert!(src.is_empty());
        }
    }

    #[test]
    fn encode_len_matches_actual() {
        for value in [0u64, 300, u64::MAX] {
            let mut buf = Vec::new();
            write_u64(&mut buf, value).unwrap();
            assert_eq!(buf.len(), encode_len_u64(value));
        }
    }
}
