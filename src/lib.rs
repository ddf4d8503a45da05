//! A reliable, ordered, stream-oriented packet transport: per-packet
//! sequencing with selective ack/nack, pluggable congestion control,
//! retransmission-timeout detection, and graceful close with
//! outstanding-operation draining.
//!
//! This crate implements the transport core only. Message framing,
//! fragmentation/reassembly, multi-stream multiplexing, connection
//! establishment, and routing are layered on top by the host; see the
//! [`Timer`], [`PacketSender`], and [`Codec`] traits for the seams this
//! crate expects its host to fill in.

pub mod ack;
pub mod bbr;
pub mod codec;
pub mod recv;
pub mod rtt;
pub mod send;
pub mod send_request;
pub mod seq;
pub mod status;
pub mod timer;
pub mod varint;

mod outstanding;
mod rto;

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use web_time::Instant;

use bbr::CongestionController;
use codec::Codec;
use outstanding::{OutstandingPacket, QueuedPacket};
use seq::Seq;
use send_request::{PacketSender, SendRequestHdl};
use status::Status;
use timer::{Timeout, Timer};

/// `kMaxUnackedReceives` from `original_source`: once this many packets have
/// arrived since the last ack we've actually sent, the next one forces an
/// immediate ack (§4.2 step 7).
pub const DEFAULT_MAX_UNACKED_RECEIVES: u64 = 3;

/// Bounds used by the RTO and ack-pacing clamp (§4.3, §4.4).
pub const MIN_CLAMPED_RTT: Duration = Duration::from_millis(1);
pub const MAX_CLAMPED_RTT: Duration = Duration::from_millis(250);

/// Construction-time tuning for a [`PacketProtocol`] (see `SPEC_FULL.md` §10.3).
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum size, in bytes, of one outgoing packet (pre-codec-expansion).
    pub mss: usize,
    /// Initial RTT estimate before any samples are available.
    pub initial_rtt: Duration,
    /// Override for `kMaxUnackedReceives` (§4.2).
    pub max_unacked_receives: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mss: 1200,
            initial_rtt: rtt::DEFAULT_INITIAL_RTT,
            max_unacked_receives: DEFAULT_MAX_UNACKED_RECEIVES,
        }
    }
}

/// `state` from §3.6: `READY -> CLOSING -> CLOSED`, monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Ready,
    Closing,
    Closed,
}

/// `receive_state` from §3.3.
///
/// `Pending` is this crate's name for the spec's `UNKNOWN`: a
/// [`crate::recv::ProcessedPacket`] is currently outstanding for this
/// sequence and hasn't committed a final state yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReceiveState {
    Pending,
    NotReceived,
    Received,
    ReceivedAndSuppressedAck,
}

pub(crate) struct ReceivedPacket {
    pub state: ReceiveState,
    pub received_at: Instant,
}

/// All of a [`PacketProtocol`]'s mutable state, shared behind an `Rc<RefCell<_>>`
/// so that callbacks handed to [`Timer`], [`PacketSender`], and
/// [`CongestionController`] can each hold a cheap, reference-counted handle
/// back into the protocol (§9 "cyclic & self-referential lifetimes").
pub(crate) struct Inner {
    pub timer: Option<Box<dyn Timer>>,
    pub packet_sender: Option<Box<dyn PacketSender>>,
    pub codec: Option<Box<dyn Codec>>,
    pub congestion: Option<Box<dyn CongestionController>>,
    pub config: Config,

    pub lifecycle: Lifecycle,
    pub outstanding_ops: usize,
    pub quiesced: Option<Box<dyn FnOnce()>>,

    // --- sender state (§3.2, §3.5, §4.1) ---
    pub send_tip: Seq,
    pub outstanding: VecDeque<OutstandingPacket>,
    pub queued: VecDeque<QueuedPacket>,
    /// Popped off `queued`, waiting on a BBR transmission grant or currently
    /// being handed to the `PacketSender` (`sending_` in `original_source`).
    pub sending: Option<QueuedPacket>,
    pub transmitting: bool,
    /// Largest outstanding-window size ever reached, used to pick the
    /// narrowest [`seq::SeqNum`] wire width that remains unambiguous (§3.1).
    pub max_outstanding_size: u64,
    pub last_sent_ack: Option<Seq>,
    /// Set when `ContinueSending` found nothing queued to send but an ack was
    /// pending; the ack is sent once the in-flight transmit completes.
    pub ack_after_sending: bool,
    /// Whether a standalone ack-only [`send_request::SendRequestHdl`] is
    /// currently queued/outstanding, to avoid queuing a second one.
    pub ack_only_message_outstanding: bool,

    // --- receiver state (§3.3, §4.2, §4.3) ---
    pub recv_tip: Seq,
    pub max_seen: Seq,
    /// Highest sequence for which a force-ack decision has fired. Mirrors
    /// `max_acked_` in `original_source`'s `packet_protocol.h`, which that
    /// reference never advances past its zero default; this port keeps that
    /// behaviour rather than silently "fixing" it (see DESIGN.md).
    pub max_acked: u64,
    pub received_packets: BTreeMap<u64, ReceivedPacket>,
    pub last_ack_send: Option<Instant>,
    pub sent_first_ack: bool,
    pub ack_scheduler: Option<Box<dyn Timeout>>,

    // --- RTO/keepalive (§4.4) ---
    pub last_keepalive_event: Instant,
    pub rto_scheduler: Option<Box<dyn Timeout>>,
}

/// The reliable, ordered packet transport core (§2).
///
/// Cheap to clone: it is a handle (`Rc`) to shared interior-mutable state, the
/// same way callbacks captured by [`Timer`]/[`PacketSender`]/[`CongestionController`]
/// hold their own handle back into the protocol.
#[derive(Clone)]
pub struct PacketProtocol {
    pub(crate) inner: Rc<RefCell<Inner>>,
}

/// Holds the protocol alive and marks one callback as "in flight" for the
/// duration of its scope (§5: every entry into a callback increments an
/// outstanding-op reference). On drop, if the protocol is `CLOSING` and this
/// was the last outstanding op, it transitions to `CLOSED` and fires the
/// stored `quiesced` continuation exactly once.
pub(crate) struct OpToken {
    protocol: PacketProtocol,
}

impl OpToken {
    fn enter(protocol: &PacketProtocol) -> Self {
        protocol.inner.borrow_mut().outstanding_ops += 1;
        Self {
            protocol: protocol.clone(),
        }
    }
}

impl Drop for OpToken {
    fn drop(&mut self) {
        let quiesced = {
            let mut inner = self.protocol.inner.borrow_mut();
            inner.outstanding_ops -= 1;
            if inner.lifecycle == Lifecycle::Closing && inner.outstanding_ops == 0 {
                inner.lifecycle = Lifecycle::Closed;
                inner.quiesced.take()
            } else {
                None
            }
        };
        if let Some(quiesced) = quiesced {
            quiesced();
        }
    }
}

impl PacketProtocol {
    /// Constructs a new protocol instance, in state `READY`.
    pub fn new(
        timer: Box<dyn Timer>,
        packet_sender: Box<dyn PacketSender>,
        codec: Box<dyn Codec>,
        congestion: Box<dyn CongestionController>,
        config: Config,
    ) -> Self {
        let now = timer.now();
        let inner = Inner {
            timer: Some(timer),
            packet_sender: Some(packet_sender),
            codec: Some(codec),
            congestion: Some(congestion),
            config,

            lifecycle: Lifecycle::Ready,
            outstanding_ops: 0,
            quiesced: None,

            send_tip: Seq::FIRST,
            outstanding: VecDeque::new(),
            queued: VecDeque::new(),
            sending: None,
            transmitting: false,
            max_outstanding_size: 0,
            last_sent_ack: None,
            ack_after_sending: false,
            ack_only_message_outstanding: false,

            recv_tip: Seq(0),
            max_seen: Seq(0),
            max_acked: 0,
            received_packets: BTreeMap::new(),
            last_ack_send: None,
            sent_first_ack: false,
            ack_scheduler: None,

            last_keepalive_event: now,
            rto_scheduler: None,
        };
        let protocol = Self {
            inner: Rc::new(RefCell::new(inner)),
        };
        rto::keepalive(&protocol);
        protocol
    }

    pub(crate) fn op_token(&self) -> OpToken {
        OpToken::enter(self)
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.inner.borrow().lifecycle == Lifecycle::Ready
    }

    pub(crate) fn now(&self) -> Instant {
        self.with_timer(|timer, _| timer.now())
    }

    /// Runs `f` with the timer temporarily moved out of `inner`, so `f` may
    /// freely call back into `self` (e.g. a just-fired timeout) without
    /// re-entering a `RefCell` borrow that's already in progress.
    pub(crate) fn with_timer<R>(&self, f: impl FnOnce(&mut dyn Timer, &Self) -> R) -> R {
        let mut timer = self.inner.borrow_mut().timer.take().expect("timer taken reentrantly");
        let result = f(&mut *timer, self);
        self.inner.borrow_mut().timer = Some(timer);
        result
    }

    pub(crate) fn with_packet_sender<R>(&self, f: impl FnOnce(&mut dyn PacketSender, &Self) -> R) -> R {
        let mut sender = self
            .inner
            .borrow_mut()
            .packet_sender
            .take()
            .expect("packet sender taken reentrantly");
        let result = f(&mut *sender, self);
        self.inner.borrow_mut().packet_sender = Some(sender);
        result
    }

    pub(crate) fn with_codec<R>(&self, f: impl FnOnce(&mut dyn Codec) -> R) -> R {
        let mut codec = self.inner.borrow_mut().codec.take().expect("codec taken reentrantly");
        let result = f(&mut *codec);
        self.inner.borrow_mut().codec = Some(codec);
        result
    }

    pub(crate) fn with_congestion<R>(&self, f: impl FnOnce(&mut dyn CongestionController, &Self) -> R) -> R {
        let mut congestion = self
            .inner
            .borrow_mut()
            .congestion
            .take()
            .expect("congestion controller taken reentrantly");
        let result = f(&mut *congestion, self);
        self.inner.borrow_mut().congestion = Some(congestion);
        result
    }

    /// Payload budget for one outgoing packet: the configured MSS minus the
    /// codec's fixed expansion.
    #[must_use]
    pub fn mss(&self) -> usize {
        let border = self.with_codec(|codec| codec.border().total());
        self.inner.borrow().config.mss.saturating_sub(border)
    }

    /// Current bottleneck-bandwidth estimate, in bytes/sec (§4.1, §4.6).
    #[must_use]
    pub fn bottleneck_bandwidth(&self) -> f64 {
        self.with_congestion(|congestion, _| congestion.bottleneck_bandwidth())
    }

    /// Current round-trip-time estimate (§4.1, §4.6).
    #[must_use]
    pub fn round_trip_time(&self) -> Duration {
        self.with_congestion(|congestion, _| congestion.rtt())
    }

    /// Enqueues `request` for reliable delivery (§4.1 `Send`).
    ///
    /// `request`'s `ack` will be called exactly once: with [`Status::Ok`]
    /// once the peer acknowledges it, [`Status::Unavailable`] if nacked, or
    /// [`Status::Cancelled`] if the protocol closes first.
    pub fn send(&self, request: SendRequestHdl) {
        let _token = self.op_token();
        send::send(self, request);
    }

    /// Hints that a standalone ack should be produced soon (§4.1 `RequestSendAck`).
    pub fn request_send_ack(&self) {
        let _token = self.op_token();
        recv::force_ack_soon(self);
    }

    /// Processes one incoming packet, returning a handle whose effects
    /// commit when it is dropped (§4.2 `Process`).
    ///
    /// Unlike [`PacketProtocol::send`]/[`PacketProtocol::request_send_ack`],
    /// this does not wrap the call in its own short-lived [`OpToken`]: the
    /// returned [`recv::ProcessedPacket`] carries one for as long as the
    /// caller holds it, since its effects (ledger update, ack scheduling,
    /// queued callbacks) only commit on drop (§4.2).
    #[must_use]
    pub fn process(&self, received_at: Instant, seq_num: seq::SeqNum, payload: &[u8]) -> recv::ProcessedPacket {
        recv::process(self, received_at, seq_num, payload)
    }

    /// Closes the protocol: every outstanding and queued send is resolved
    /// (nacked sends as [`Status::Unavailable`], never-sent sends as
    /// [`Status::Cancelled`]), and `quiesced` runs once every in-flight
    /// callback has returned (§3.6, §5).
    pub fn close(&self, status: Status, quiesced: Box<dyn FnOnce()>) {
        let _token = self.op_token();
        {
            let mut inner = self.inner.borrow_mut();
            assert!(
                inner.lifecycle == Lifecycle::Ready,
                "PacketProtocol::close called while not READY"
            );
            inner.lifecycle = Lifecycle::Closing;
            inner.quiesced = Some(quiesced);
            if let Some(mut ack_scheduler) = inner.ack_scheduler.take() {
                ack_scheduler.cancel();
            }
            if let Some(mut rto_scheduler) = inner.rto_scheduler.take() {
                rto_scheduler.cancel();
            }
        }
        self.with_congestion(|congestion, _| congestion.cancel_request_transmit());
        rto::nack_all_outstanding(self, status);

        let sending: Option<QueuedPacket> = {
            let mut inner = self.inner.borrow_mut();
            inner.sending.take()
        };
        if let Some(sending) = sending {
            sending.request.ack(Status::Cancelled);
        }

        let queued: VecDeque<QueuedPacket> = {
            let mut inner = self.inner.borrow_mut();
            std::mem::take(&mut inner.queued)
        };
        for queued in queued {
            queued.request.ack(Status::Cancelled);
        }
    }
}
