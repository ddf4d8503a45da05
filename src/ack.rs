//! Ack frame encoding, decoding, and MSS-fitting ([`AckFrame`]).
//!
//! Grounded on `original_source`'s `garnet/lib/overnet/protocol/ack_frame.h`:
//! the wire layout and the strictly-descending nack invariant enforced by
//! `AddNack` are ported near verbatim from that header's C++ `AckFrame`
//! class. `AdjustForMSS`'s trim loop is adapted rather than ported
//! verbatim -- see `adjust_for_mss`'s doc comment -- since this port's nack
//! invariant is strictly less-than where the original's is less-than-or-equal.

use core::time::Duration;

use derive_more::{Display, Error};
use octs::{Buf, BufTooShortOr, Decode, Encode, EncodeLen, Read, Write};

use crate::{seq::Seq, varint};

/// A received or to-be-sent selective acknowledgement.
///
/// `nack_seqs` is always kept strictly descending and every entry is `< ack_to_seq`,
/// matching the wire invariant (§6.2 of the protocol's wire format).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    ack_to_seq: Seq,
    ack_delay: Duration,
    partial: bool,
    nack_seqs: Vec<Seq>,
}

/// The frame failed to parse, or would have encoded an ill-formed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum AckFrameError {
    #[display("ack_to_seq must be at least 1")]
    ZeroAckToSeq,
    #[display("nack {nack} is not less than ack_to_seq {ack_to_seq}")]
    NackNotLessThanAckToSeq { nack: u64, ack_to_seq: u64 },
    #[display("nack sequence {nack} is not strictly less than the previous nack {prev}")]
    NacksNotDescending { prev: u64, nack: u64 },
    #[display("truncated or malformed varint in ack frame")]
    Truncated,
}

impl octs::BufError for AckFrameError {}

impl AckFrame {
    /// Creates a new frame acknowledging everything up to and including
    /// `ack_to_seq`, with no nacks yet.
    ///
    /// # Errors
    ///
    /// Errors if `ack_to_seq` is zero: sequence numbers start at 1, so an ack
    /// horizon of zero means "nothing has been received".
    pub fn new(ack_to_seq: Seq, ack_delay: Duration) -> Result<Self, AckFrameError> {
        if ack_to_seq.0 == 0 {
            return Err(AckFrameError::ZeroAckToSeq);
        }
        Ok(Self {
            ack_to_seq,
            ack_delay,
            partial: false,
            nack_seqs: Vec::new(),
        })
    }

    #[must_use]
    pub const fn ack_to_seq(&self) -> Seq {
        self.ack_to_seq
    }

    #[must_use]
    pub const fn ack_delay(&self) -> Duration {
        self.ack_delay
    }

    #[must_use]
    pub const fn partial(&self) -> bool {
        self.partial
    }

    #[must_use]
    pub fn nack_seqs(&self) -> &[Seq] {
        &self.nack_seqs
    }

    /// Appends a nack. Nacks must be added in strictly descending order and
    /// must be less than `ack_to_seq`.
    ///
    /// # Errors
    ///
    /// Errors if `nack >= ack_to_seq`, or if `nack` is not strictly less than
    /// the previously added nack.
    pub fn add_nack(&mut self, nack: Seq) -> Result<(), AckFrameError> {
        if nack.0 >= self.ack_to_seq.0 {
            return Err(AckFrameError::NackNotLessThanAckToSeq {
                nack: nack.0,
                ack_to_seq: self.ack_to_seq.0,
            });
        }
        if let Some(&prev) = self.nack_seqs.last() {
            if nack.0 >= prev.0 {
                return Err(AckFrameError::NacksNotDescending {
                    prev: prev.0,
                    nack: nack.0,
                });
            }
        }
        self.nack_seqs.push(nack);
        Ok(())
    }

    /// Shrinks this frame so its encoded length fits within `mss`, dropping
    /// the highest-sequence (most recently added) nacks first and setting
    /// [`AckFrame::partial`] if anything was dropped.
    ///
    /// Each trimmed nack is folded into `ack_to_seq` (its sequence becomes
    /// the new horizon) and removed from `nack_seqs` in the same step, so
    /// the first remaining nack -- if any -- stays strictly less than
    /// `ack_to_seq`. The original allows a trimmed frame to land with its
    /// first nack equal to `ack_to_seq` (a zero first delta); this port
    /// can't produce that, since `add_nack`/`decode` both reject it.
    ///
    /// `delay_fn` recomputes `ack_delay` for the new `ack_to_seq` after a
    /// trim point is chosen (the original horizon's delay no longer applies
    /// once `ack_to_seq` moves). If it returns `None` (unspecified / +inf in
    /// the original), the delay is treated as zero.
    pub fn adjust_for_mss(&mut self, mss: usize, mut delay_fn: impl FnMut(Seq) -> Option<Duration>) {
        while !self.nack_seqs.is_empty() && self.encode_len() > mss {
            self.partial = true;
            self.ack_to_seq = self.nack_seqs.remove(0);
            self.ack_delay = delay_fn(self.ack_to_seq).unwrap_or(Duration::ZERO);
        }
    }
}

impl EncodeLen for AckFrame {
    fn encode_len(&self) -> usize {
        let delay_and_flags = (self.ack_delay.as_micros() as u64).saturating_mul(2) | u64::from(self.partial);
        let mut len = varint::encode_len_u64(delay_and_flags) + varint::encode_len_u64(self.ack_to_seq.0);
        let mut prev = self.ack_to_seq.0;
        for nack in &self.nack_seqs {
            len += varint::encode_len_u64(prev - nack.0);
            prev = nack.0;
        }
        len
    }
}

impl Encode for AckFrame {
    type Error = core::convert::Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        let delay_and_flags = (self.ack_delay.as_micros() as u64).saturating_mul(2) | u64::from(self.partial);
        varint::write_u64(&mut dst, delay_and_flags)?;
        varint::write_u64(&mut dst, self.ack_to_seq.0)?;
        let mut prev = self.ack_to_seq.0;
        for nack in &self.nack_seqs {
            varint::write_u64(&mut dst, prev - nack.0)?;
            prev = nack.0;
        }
        Ok(())
    }
}

/// Reads a varint, collapsing the distinction between "not enough bytes" and
/// "value too large to fit a u64" into this module's own error type.
fn read_varint(src: &mut impl Read) -> Result<u64, BufTooShortOr<AckFrameError>> {
    varint::read_u64(src).map_err(|err| match err {
        BufTooShortOr::TooShort => BufTooShortOr::TooShort,
        BufTooShortOr::Or(_) => BufTooShortOr::Or(AckFrameError::Truncated),
    })
}

impl Decode for AckFrame {
    type Error = AckFrameError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let delay_and_flags = read_varint(&mut src)?;
        let partial = (delay_and_flags & 1) != 0;
        let ack_delay = Duration::from_micros(delay_and_flags >> 1);

        let ack_to_seq = read_varint(&mut src)?;
        if ack_to_seq == 0 {
            return Err(BufTooShortOr::Or(AckFrameError::ZeroAckToSeq));
        }
        let ack_to_seq = Seq(ack_to_seq);

        let mut nack_seqs = Vec::new();
        let mut prev = ack_to_seq.0;
        while src.has_remaining() {
            let delta = read_varint(&mut src)?;
            if delta == 0 {
                return Err(BufTooShortOr::Or(AckFrameError::NacksNotDescending { prev, nack: prev }));
            }
            let nack = prev
                .checked_sub(delta)
                .ok_or(BufTooShortOr::Or(AckFrameError::NackNotLessThanAckToSeq {
                    nack: 0,
                    ack_to_seq: ack_to_seq.0,
                }))?;
            nack_seqs.push(Seq(nack));
            prev = nack;
        }

        Ok(Self {
            ack_to_seq,
            ack_delay,
            partial,
            nack_seqs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_no_nacks() {
        let frame = AckFrame::new(Seq(1), Duration::from_micros(100)).unwrap();
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        let decoded = (&mut buf.as_slice()).read::<AckFrame>().unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn round_trip_with_nacks() {
        let mut frame = AckFrame::new(Seq(10), Duration::from_micros(250)).unwrap();
        frame.add_nack(Seq(8)).unwrap();
        frame.add_nack(Seq(5)).unwrap();
        frame.add_nack(Seq(4)).unwrap();
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        let decoded = (&mut buf.as_slice()).read::<AckFrame>().unwrap();
        assert_eq!(frame, decoded);
        assert_eq!(&[Seq(8), Seq(5), Seq(4)], decoded.nack_seqs());
    }

    #[test]
    fn add_nack_rejects_non_descending() {
        let mut frame = AckFrame::new(Seq(10), Duration::ZERO).unwrap();
        frame.add_nack(Seq(5)).unwrap();
        assert!(frame.add_nack(Seq(5)).is_err());
        assert!(frame.add_nack(Seq(6)).is_err());
    }

    #[test]
    fn add_nack_rejects_at_or_above_ack_to_seq() {
        let mut frame = AckFrame::new(Seq(10), Duration::ZERO).unwrap();
        assert!(frame.add_nack(Seq(10)).is_err());
        assert!(frame.add_nack(Seq(11)).is_err());
    }

    #[test]
    fn adjust_for_mss_trims_and_marks_partial() {
        let mut frame = AckFrame::new(Seq(1000), Duration::ZERO).unwrap();
        for seq in (900..1000).rev() {
            frame.add_nack(Seq(seq)).unwrap();
        }
        let original_len = frame.encode_len();
        frame.adjust_for_mss(16, |_| Some(Duration::ZERO));
        assert!(frame.encode_len() <= 16);
        assert!(frame.encode_len() < original_len);
        assert!(frame.partial());

        // The strict `nack < ack_to_seq` invariant must survive trimming:
        // any surviving first nack is strictly below the new horizon, never
        // equal to it.
        if let Some(&first_nack) = frame.nack_seqs().first() {
            assert!(first_nack < frame.ack_to_seq());
        }

        // A trimmed frame must still be a well-formed wire frame -- this is
        // the exact property that regresses if trimming ever leaves
        // `ack_to_seq` sitting on top of a nack.
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        let decoded = (&mut buf.as_slice()).read::<AckFrame>().unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn adjust_for_mss_never_leaves_ack_to_seq_on_a_nack() {
        // A contiguous run of nacks is the case that used to trip the
        // two-branch version of this trim: moving ack_to_seq onto the first
        // nack without also removing it left them equal.
        let mut frame = AckFrame::new(Seq(20), Duration::ZERO).unwrap();
        for seq in (10..20).rev() {
            frame.add_nack(Seq(seq)).unwrap();
        }
        frame.adjust_for_mss(8, |_| Some(Duration::ZERO));
        if let Some(&first_nack) = frame.nack_seqs().first() {
            assert!(first_nack < frame.ack_to_seq());
        }
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        assert!((&mut buf.as_slice()).read::<AckFrame>().is_ok());
    }

    #[test]
    fn adjust_for_mss_is_noop_when_already_small() {
        let mut frame = AckFrame::new(Seq(5), Duration::ZERO).unwrap();
        frame.add_nack(Seq(3)).unwrap();
        let before = frame.clone();
        frame.adjust_for_mss(1024, |_| Some(Duration::ZERO));
        assert_eq!(before, frame);
    }
}
