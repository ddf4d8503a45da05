//! Sender-side bookkeeping: the outstanding and queued-send containers (§3.2, §3.5).

use web_time::Instant;

use crate::{bbr::SentPacket, seq::Seq, send_request::SendRequestHdl};

/// Lifecycle state of a packet the sender has handed (or is about to hand)
/// to the wire.
///
/// Transitions are monotonic: `PENDING -> SENT -> (ACKED | NACKED)`, with the
/// single exception that a still-`PENDING` packet can be synthetically
/// `NACKED` before it is ever sent (used by [`crate::rto`]'s close/RTO
/// pathway). `ACKED` and `NACKED` are terminal; an `ACKED` entry must never
/// become `NACKED` or vice versa (§3.2 invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutstandingPacketState {
    Pending,
    Sent,
    Acked,
    Nacked,
}

/// An entry in the sender's outstanding list, indexed contiguously from
/// `send_tip` (see `crate::Sender`).
pub struct OutstandingPacket {
    pub scheduled_at: Instant,
    pub state: OutstandingPacketState,
    pub has_ack: bool,
    pub is_pure_ack: bool,
    /// The ack horizon this packet carried when sent, used to advance the
    /// peer's receive tip once this packet is itself acked.
    pub ack_to_seq_at_send: Option<Seq>,
    pub bbr_sent_packet: Option<SentPacket>,
    pub request: Option<SendRequestHdl>,
}

impl OutstandingPacket {
    #[must_use]
    pub fn new(scheduled_at: Instant, request: SendRequestHdl) -> Self {
        Self {
            scheduled_at,
            state: OutstandingPacketState::Pending,
            has_ack: false,
            is_pure_ack: false,
            ack_to_seq_at_send: None,
            bbr_sent_packet: None,
            request: Some(request),
        }
    }
}

/// A send that has not yet been granted a BBR transmission slot (§3.5).
/// Processed strictly FIFO.
pub struct QueuedPacket {
    pub request: SendRequestHdl,
}
