//! Pluggable payload codec (§4.5).

use derive_more::{Display, Error};

use crate::seq::Seq;

/// Fixed byte expansion a [`Codec`] adds around a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Border {
    pub prefix: usize,
    pub suffix: usize,
}

impl Border {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.prefix + self.suffix
    }
}

/// A decode or encode failure from a [`Codec`].
#[derive(Debug, Display, Error)]
#[display("codec error")]
pub struct CodecError(pub Box<dyn core::error::Error + Send + Sync>);

/// Encodes and decodes the bytes carried inside a single outgoing/incoming
/// packet, keyed by the logical sequence number of that packet.
///
/// Implementations typically layer encryption or compression here; the
/// protocol core treats this purely as an opaque transform with a known
/// maximum expansion.
pub trait Codec {
    /// Fixed expansion this codec adds. Never varies with input.
    fn border(&self) -> Border;

    /// Encodes `plaintext`, which was produced for packet `seq`.
    ///
    /// # Errors
    ///
    /// Errors if the codec cannot encode this payload.
    fn encode(&mut self, seq: Seq, plaintext: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decodes `ciphertext`, which arrived carrying packet `seq`.
    ///
    /// # Errors
    ///
    /// Errors if the payload is malformed or fails authentication.
    fn decode(&mut self, seq: Seq, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Identity codec: adds no expansion, passes bytes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCodec;

impl Codec for NullCodec {
    fn border(&self) -> Border {
        Border::default()
    }

    fn encode(&mut self, _seq: Seq, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(plaintext.to_vec())
    }

    fn decode(&mut self, _seq: Seq, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(ciphertext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_codec_is_identity() {
        let mut codec = NullCodec;
        let data = b"hello".to_vec();
        let encoded = codec.encode(Seq(1), &data).unwrap();
        assert_eq!(data, encoded);
        let decoded = codec.decode(Seq(1), &encoded).unwrap();
        assert_eq!(data, decoded);
        assert_eq!(Border::default(), codec.border());
    }
}
