//! The protocol-level outcome taxonomy delivered to applications (§7).

/// Outcome of a protocol-level operation, delivered to [`crate::send_request::SendRequest::ack`]
/// and carried in [`crate::recv::ProcessedPacket`].
///
/// Unlike the narrow per-module decode errors (e.g. [`crate::ack::AckFrameError`],
/// [`crate::seq::SeqNumError`]), this is not a `std::error::Error` type: `Ok` is
/// a first-class outcome here, not an absence of error, and call sites match
/// on it far more often than they display it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation completed successfully (e.g. the peer acknowledged a send).
    Ok,
    /// The protocol was closed; no further effect will occur.
    Cancelled,
    /// A transient failure; the caller may retry (e.g. a nacked send).
    Unavailable,
    /// The peer violated the protocol (malformed frame, out-of-range ack,
    /// etc). The offending frame is rejected; the connection is not torn
    /// down by the core.
    InvalidArgument,
}

impl Status {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}
