//! Logical sequence numbers ([`Seq`]) and their width-prefixed wire encoding
//! ([`SeqNum`]).
//!
//! Grounded on `original_source`'s `lib/overnet/seq_num.h` / `seq_num.cc`: a
//! sender picks the narrowest of four wire widths based on how large its
//! outstanding window currently is, and a receiver reconstructs the full
//! 64-bit sequence from those bits plus its own running `recv_tip` as the
//! window center (spec invariant 7).

use derive_more::{Display, Error};
use octs::{BufTooShortOr, Decode, Encode, Read, Write};

/// A logical, monotonically increasing sequence number.
///
/// Sequences start at 1; `0` is reserved to mean "nothing sent/received yet"
/// (used as the initial `recv_tip`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("{_0}")]
pub struct Seq(pub u64);

impl Seq {
    /// The first sequence number ever sent on a connection.
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Largest wire width, in bytes, a [`SeqNum`] can occupy.
pub const MAX_WIRE_LEN: usize = 4;

/// Number of low bits of the sequence value carried by each wire width.
const BITS_FOR_WIDTH: [u32; 4] = [6, 14, 22, 30];

/// The sequence number was too large to encode given how large the sender's
/// outstanding window has grown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
#[display("outstanding window of {outstanding} packets is too large to encode a sequence number")]
pub struct WindowTooLarge {
    pub outstanding: u64,
}

/// Truncated or otherwise malformed wire bytes for a [`SeqNum`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
#[display("invalid sequence number encoding")]
pub struct SeqNumError;

impl octs::BufError for SeqNumError {}

/// Wire representation of a [`Seq`]: a self-describing 1-4 byte encoding of
/// its low bits, reconstructed relative to a receiver-maintained window base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqNum {
    width: u8,
    low_bits: u32,
}

impl SeqNum {
    /// Chooses the narrowest width that can unambiguously encode `seq` given
    /// the sender's current outstanding-window size, and packs its low bits.
    ///
    /// # Errors
    ///
    /// Errors if `outstanding` is so large that no width can safely encode
    /// any sequence within that window (more than `2^28` outstanding
    /// packets).
    pub fn new(seq: Seq, outstanding: u64) -> Result<Self, WindowTooLarge> {
        let width = if outstanding < (1 << 4) {
            1
        } else if outstanding < (1 << 12) {
            2
        } else if outstanding < (1 << 20) {
            3
        } else if outstanding < (1 << 28) {
            4
        } else {
            return Err(WindowTooLarge { outstanding });
        };
        let bits = BITS_FOR_WIDTH[usize::from(width - 1)];
        let mask = (1u64 << bits) - 1;
        Ok(Self {
            width,
            low_bits: (seq.0 & mask) as u32,
        })
    }

    /// Number of bytes this value occupies on the wire.
    #[must_use]
    pub const fn wire_len(&self) -> usize {
        self.width as usize
    }

    /// Reconstructs the full logical sequence given the receiver's window
    /// base, choosing the unique value within `[base - 2^(n-1) + 1, base +
    /// 2^(n-1)]` (where `n` is this value's bit width) whose low bits match.
    #[must_use]
    pub fn reconstruct(&self, base: Seq) -> Seq {
        let bits = BITS_FOR_WIDTH[usize::from(self.width - 1)];
        let modulus: i128 = 1 << bits;
        let half = modulus / 2;

        let base_low = (base.0 as i128) & (modulus - 1);
        let mut delta = i128::from(self.low_bits) - base_low;
        if delta > half {
            delta -= modulus;
        } else if delta <= -half {
            delta += modulus;
        }

        let candidate = i128::from(base.0) + delta;
        Seq(u64::try_from(candidate.max(0)).unwrap_or(u64::MAX))
    }
}

impl Decode for SeqNum {
    type Error = SeqNumError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let first: u8 = src.read()?;
        let width = (first >> 6) + 1;
        let extra = usize::from(width) - 1;
        let mut low_bits = u32::from(first & 0x3f);
        for i in 0..extra {
            let byte: u8 = src.read()?;
            low_bits |= u32::from(byte) << (6 + 8 * i);
        }
        Ok(Self { width, low_bits })
    }
}

impl Encode for SeqNum {
    type Error = core::convert::Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        let extra = usize::from(self.width) - 1;
        let tag = (self.width - 1) << 6;
        let first = tag | ((self.low_bits & 0x3f) as u8);
        dst.write(first)?;
        for i in 0..extra {
            let byte = ((self.low_bits >> (6 + 8 * i)) & 0xff) as u8;
            dst.write(byte)?;
        }
        Ok(())
    }
}

impl octs::EncodeLen for SeqNum {
    fn encode_len(&self) -> usize {
        self.wire_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconstruct_exact() {
        let base = Seq(1000);
        let wire = SeqNum::new(Seq(1000), 1).unwrap();
        assert_eq!(Seq(1000), wire.reconstruct(base));
    }

    #[test]
    fn reconstruct_within_window_forward_and_backward() {
        let base = Seq(1_000_000);
        for outstanding in [1u64, 100, 5000, 200_000] {
            for offset in [-3i64, -1, 0, 1, 7] {
                let seq = Seq((base.0 as i64 + offset) as u64);
                let wire = SeqNum::new(seq, outstanding).unwrap();
                assert_eq!(seq, wire.reconstruct(base), "outstanding={outstanding} offset={offset}");
            }
        }
    }

    #[test]
    fn width_grows_with_outstanding_window() {
        assert_eq!(1, SeqNum::new(Seq(5), 1).unwrap().wire_len());
        assert_eq!(2, SeqNum::new(Seq(5), 1000).unwrap().wire_len());
        assert_eq!(3, SeqNum::new(Seq(5), 500_000).unwrap().wire_len());
        assert_eq!(4, SeqNum::new(Seq(5), 50_000_000).unwrap().wire_len());
    }

    #[test]
    fn window_too_large_is_rejected() {
        assert!(SeqNum::new(Seq(5), 1 << 28).is_err());
    }

    #[test]
    fn wire_round_trip() {
        let wire = SeqNum::new(Seq(123_456), 900).unwrap();
        let mut buf = Vec::new();
        wire.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), wire.wire_len());
        let mut src = buf.as_slice();
        let decoded = src.read::<SeqNum>().unwrap();
        assert_eq!(wire, decoded);
        assert!(src.is_empty());
    }
}
