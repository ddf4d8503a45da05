//! Outgoing pipeline: queued sends, BBR transmission scheduling, packet
//! assembly, and ack classification (§4.1).
//!
//! Grounded on `original_source`'s `packet_protocol.cc` `Sender` nested class:
//! `queued_` → `sending_` → `outstanding_` mirrors its `SendSlice` /
//! `ContinueSending` split, and `HandleAck` here ports its ascending-nack,
//! then-ack-to-horizon two-phase walk.

use std::cell::Cell;
use std::rc::Rc;

use crate::{
    ack::AckFrame,
    bbr::{CongestionController, SentPacket},
    outstanding::{OutstandingPacket, OutstandingPacketState, QueuedPacket},
    recv, rto,
    seq::{Seq, SeqNum},
    send_request::{
        FnSendRequest, LazySliceArgs, PacketSender, PayloadGenerator, SendRequest, SendRequestHdl, SentCallback,
    },
    status::Status,
    varint, Inner, PacketProtocol,
};

/// Index into `inner.outstanding` for `seq`, or `None` if `seq` is no longer
/// (or not yet) part of the contiguous outstanding window.
fn entry_index(inner: &Inner, seq: Seq) -> Option<usize> {
    if seq.0 < inner.send_tip.0 {
        return None;
    }
    let idx = usize::try_from(seq.0 - inner.send_tip.0).ok()?;
    (idx < inner.outstanding.len()).then_some(idx)
}

/// Enqueues `request` (§4.1 `Send`, pipeline step 1).
pub(crate) fn send(protocol: &PacketProtocol, request: SendRequestHdl) {
    if !protocol.is_ready() {
        request.ack(Status::Cancelled);
        return;
    }
    {
        let mut inner = protocol.inner.borrow_mut();
        inner.queued.push_back(QueuedPacket { request });
    }
    continue_sending(protocol);
}

/// Pops the next queued send into `sending` and asks BBR for a transmission
/// slot, if the sender is currently idle (§4.1 pipeline step 2).
pub(crate) fn continue_sending(protocol: &PacketProtocol) {
    if !protocol.is_ready() {
        return;
    }
    let idle = {
        let inner = protocol.inner.borrow();
        inner.sending.is_none() && !inner.transmitting
    };
    if !idle {
        return;
    }

    let popped = {
        let mut inner = protocol.inner.borrow_mut();
        match inner.queued.pop_front() {
            Some(queued) => {
                inner.sending = Some(queued);
                true
            }
            None => {
                inner.ack_after_sending = false;
                false
            }
        }
    };
    if !popped {
        return;
    }

    let cb_protocol = protocol.clone();
    // `request_transmit` may invoke this callback synchronously, still nested
    // inside `with_congestion`'s borrow of the congestion controller --
    // `on_transmit_granted` must not touch congestion itself (see its doc
    // comment).
    protocol.with_congestion(|congestion, _| {
        congestion.request_transmit(Box::new(move |status| on_transmit_granted(&cb_protocol, status)));
    });
}

/// Hints that a standalone ack should be produced soon (§4.1 `RequestSendAck`).
///
/// If a send is already queued or in flight, the next outgoing packet will
/// pick up whatever ack is due on its own (`generate_packet_bytes` always
/// asks the receive ledger); otherwise this queues a zero-payload send
/// request purely to get a packet onto the wire to carry the ack.
///
/// A standalone ack-only request already outstanding blocks a second one
/// from being queued here (one in flight at a time), but the ack this call
/// was asked to force can't just be dropped on the floor: it's re-armed as
/// a quarter-RTT paced retry, so it goes out as soon as the in-flight one
/// resolves instead of being silently lost if nothing else ever sends.
pub(crate) fn force_ack_soon(protocol: &PacketProtocol) {
    if !protocol.is_ready() {
        return;
    }
    let (idle, ack_only_outstanding) = {
        let inner = protocol.inner.borrow();
        (
            inner.queued.is_empty() && inner.sending.is_none() && !inner.transmitting,
            inner.ack_only_message_outstanding,
        )
    };
    if !idle {
        return;
    }
    if ack_only_outstanding {
        recv::schedule_ack(protocol);
    } else {
        standalone_ack_request(protocol);
    }
}

fn standalone_ack_request(protocol: &PacketProtocol) {
    {
        let mut inner = protocol.inner.borrow_mut();
        inner.ack_only_message_outstanding = true;
    }
    let cb_protocol = protocol.clone();
    let request = FnSendRequest::new(
        |_args: LazySliceArgs| Vec::new(),
        move |_status| {
            cb_protocol.inner.borrow_mut().ack_only_message_outstanding = false;
        },
    );
    send(protocol, SendRequestHdl::new(Box::new(request)));
}

/// Bookkeeping a packet's `generate` closure hands to its paired `on_sent`
/// closure once assembly is complete, since both run in separate host
/// callback invocations that may be arbitrarily far apart.
#[derive(Debug, Clone, Copy)]
struct PendingSendMeta {
    ack_to_seq_at_send: Option<Seq>,
    has_ack: bool,
    is_pure_ack: bool,
    size: usize,
}

/// Runs once BBR grants a transmission slot for the packet currently in
/// `sending` (§4.1 pipeline step 3).
///
/// This always executes nested inside the congestion controller's own
/// `request_transmit`/`on_ack` call (synchronous grant, or a deferred grant
/// fired from `maybe_grant_pending`): the controller is taken out of `inner`
/// for the whole duration. Calling back into [`PacketProtocol::with_congestion`]
/// (directly, or via [`rto::rearm`]/[`rto::note_keepalive`], which need the
/// RTT estimate) would panic on the reentrant `.take()`. Keepalive/RTO
/// rearming for this transmission is deferred to [`on_sent`], which runs from
/// the `PacketSender`'s own callback instead.
fn on_transmit_granted(protocol: &PacketProtocol, status: Status) {
    let _token = protocol.op_token();
    if !status.is_ok() || !protocol.is_ready() {
        return;
    }

    let now = protocol.now();
    let queued = {
        let mut inner = protocol.inner.borrow_mut();
        inner.sending.take()
    };
    let Some(queued) = queued else {
        return;
    };

    let (seq, seq_num) = {
        let mut inner = protocol.inner.borrow_mut();
        inner.last_keepalive_event = now;
        let seq = Seq(inner.send_tip.0 + inner.outstanding.len() as u64);
        inner.outstanding.push_back(OutstandingPacket::new(now, queued.request));
        inner.max_outstanding_size = inner.max_outstanding_size.max(inner.outstanding.len() as u64);
        let seq_num =
            SeqNum::new(seq, inner.max_outstanding_size).expect("outstanding window exceeds encodable sequence range");
        inner.transmitting = true;
        (seq, seq_num)
    };

    let meta: Rc<Cell<Option<PendingSendMeta>>> = Rc::new(Cell::new(None));

    let gen_protocol = protocol.clone();
    let gen_meta = meta.clone();
    let generate: PayloadGenerator = Box::new(move |args| generate_packet_bytes(&gen_protocol, seq, args, &gen_meta));

    let sent_protocol = protocol.clone();
    let sent_meta = meta;
    let on_sent_cb: SentCallback = Box::new(move || on_sent(&sent_protocol, seq, &sent_meta));

    protocol.with_packet_sender(|sender, _| sender.send_packet(seq_num, generate, on_sent_cb));
}

/// Assembles one outgoing packet's bytes (§4.1 pipeline step 4, §6.1): an
/// ack-length varint, the ack frame bytes (if any), the request's payload,
/// all handed to the codec.
fn generate_packet_bytes(
    protocol: &PacketProtocol,
    seq: Seq,
    args: LazySliceArgs,
    meta: &Rc<Cell<Option<PendingSendMeta>>>,
) -> Vec<u8> {
    if !protocol.is_ready() {
        return Vec::new();
    }

    let ack_frame = recv::generate_ack(protocol, args.max_length);
    let mut ack_bytes = Vec::new();
    if let Some(frame) = &ack_frame {
        frame.encode(&mut ack_bytes).expect("ack frame encoding is infallible");
    }

    let mut buf = Vec::with_capacity(varint::MAX_ENCODE_LEN + ack_bytes.len());
    if ack_bytes.is_empty() {
        buf.push(0);
    } else {
        varint::write_u64(&mut buf, ack_bytes.len() as u64).expect("writing into a Vec is infallible");
        buf.extend_from_slice(&ack_bytes);
    }

    let reserved = buf.len();
    let inner_args = LazySliceArgs {
        desired_border: args.desired_border + reserved,
        max_length: args.max_length.saturating_sub(reserved),
        has_other_content: !ack_bytes.is_empty(),
    };
    let payload = {
        let mut inner = protocol.inner.borrow_mut();
        match entry_index(&inner, seq).and_then(|idx| inner.outstanding.get_mut(idx)) {
            Some(entry) => entry
                .request
                .as_mut()
                .map(|request| request.generate_bytes(inner_args))
                .unwrap_or_default(),
            None => Vec::new(),
        }
    };
    let is_pure_ack = !ack_bytes.is_empty() && payload.is_empty();
    buf.extend_from_slice(&payload);

    let encoded = match protocol.with_codec(|codec| codec.encode(seq, &buf)) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(%seq, %err, "codec failed to encode outgoing packet");
            Vec::new()
        }
    };

    meta.set(Some(PendingSendMeta {
        ack_to_seq_at_send: ack_frame.as_ref().map(AckFrame::ack_to_seq),
        has_ack: !ack_bytes.is_empty(),
        is_pure_ack,
        size: encoded.len(),
    }));
    encoded
}

/// Runs once the `PacketSender` has accepted the assembled bytes (§4.1
/// pipeline step 5): commits `PENDING -> SENT`, records BBR bookkeeping, and
/// lets the next queued send proceed.
fn on_sent(protocol: &PacketProtocol, seq: Seq, meta: &Rc<Cell<Option<PendingSendMeta>>>) {
    let _token = protocol.op_token();
    let meta = meta.take();
    let now = protocol.now();

    if let Some(meta) = meta {
        if protocol.is_ready() {
            let bbr_sent = protocol.with_congestion(|congestion, _| congestion.schedule_transmit(seq, meta.size, now));
            let mut inner = protocol.inner.borrow_mut();
            if meta.has_ack {
                inner.last_sent_ack = Some(seq);
            }
            if let Some(idx) = entry_index(&inner, seq) {
                let entry = &mut inner.outstanding[idx];
                if entry.state == OutstandingPacketState::Pending {
                    entry.state = OutstandingPacketState::Sent;
                    entry.has_ack = meta.has_ack;
                    entry.is_pure_ack = meta.is_pure_ack;
                    entry.ack_to_seq_at_send = meta.ack_to_seq_at_send;
                    entry.bbr_sent_packet = Some(bbr_sent);
                }
            }
        }
    }

    let fire_ack_after_sending = {
        let mut inner = protocol.inner.borrow_mut();
        inner.transmitting = false;
        let fire = inner.ack_after_sending;
        inner.ack_after_sending = false;
        fire
    };

    rto::rearm(protocol);
    if fire_ack_after_sending {
        force_ack_soon(protocol);
    }
    continue_sending(protocol);
}

/// Classifies an incoming `AckFrame` against the outstanding window (§4.1
/// `HandleAck`). Real peer acks flow through here; the RTO/close pathway
/// uses [`synthetic_nack`] instead, since its synthetic frame can't be
/// expressed as a valid [`AckFrame`] (see that function's doc comment).
pub(crate) fn handle_ack(protocol: &PacketProtocol, frame: &AckFrame) -> Result<(), Status> {
    if !protocol.is_ready() {
        return Ok(());
    }

    let now = protocol.now();
    let ack_to_seq = frame.ack_to_seq();
    let ack_delay = frame.ack_delay();

    let in_range = {
        let inner = protocol.inner.borrow();
        if ack_to_seq.0 < inner.send_tip.0 {
            return Ok(());
        }
        ack_to_seq.0 < inner.send_tip.0 + inner.outstanding.len() as u64
    };
    if !in_range {
        return Err(Status::InvalidArgument);
    }

    let mut nacks_ascending: Vec<Seq> = frame.nack_seqs().to_vec();
    nacks_ascending.reverse();

    let mut nacked_requests: Vec<SendRequestHdl> = Vec::new();
    let mut acked_requests: Vec<SendRequestHdl> = Vec::new();
    let mut bbr_nacked: Vec<SentPacket> = Vec::new();
    let mut bbr_acked: Vec<SentPacket> = Vec::new();
    let mut force_ack_after = false;
    let mut new_recv_tip: Option<Seq> = None;
    let mut result: Result<(), Status> = Ok(());

    {
        let mut inner = protocol.inner.borrow_mut();
        'nacks: for seq in nacks_ascending {
            let last_sent_ack = inner.last_sent_ack;
            let Some(idx) = entry_index(&inner, seq) else {
                continue 'nacks;
            };
            let entry = &mut inner.outstanding[idx];
            match entry.state {
                OutstandingPacketState::Acked => {
                    result = Err(Status::InvalidArgument);
                    break 'nacks;
                }
                OutstandingPacketState::Nacked => {}
                OutstandingPacketState::Pending | OutstandingPacketState::Sent => {
                    entry.state = OutstandingPacketState::Nacked;
                    if let Some(request) = entry.request.take() {
                        nacked_requests.push(request);
                    }
                    let sent = entry.bbr_sent_packet.unwrap_or(SentPacket { seq, size: 0, send_time: now });
                    bbr_nacked.push(sent);
                    if last_sent_ack == Some(seq) {
                        force_ack_after = true;
                    }
                }
            }
        }
    }

    if result.is_ok() {
        let mut inner = protocol.inner.borrow_mut();
        while inner.send_tip.0 <= ack_to_seq.0 {
            let Some(mut entry) = inner.outstanding.pop_front() else {
                break;
            };
            let this_seq = inner.send_tip;
            inner.send_tip = inner.send_tip.next();
            if let Some(horizon) = entry.ack_to_seq_at_send {
                new_recv_tip = Some(match new_recv_tip {
                    Some(current) if current.0 >= horizon.0 => current,
                    _ => horizon,
                });
            }
            let newly_acked = entry.state != OutstandingPacketState::Nacked;
            if newly_acked {
                entry.state = OutstandingPacketState::Acked;
                if let Some(request) = entry.request.take() {
                    acked_requests.push(request);
                }
                let sent = entry.bbr_sent_packet.unwrap_or(SentPacket {
                    seq: this_seq,
                    size: 0,
                    send_time: now,
                });
                bbr_acked.push(sent);
            }
        }
    }

    if let Some(horizon) = new_recv_tip {
        let mut inner = protocol.inner.borrow_mut();
        if horizon.0 > inner.recv_tip.0 {
            inner.recv_tip = horizon;
        }
    }

    let offset = |packet: SentPacket| SentPacket {
        send_time: packet.send_time + ack_delay,
        ..packet
    };
    let bbr_nacked: Vec<SentPacket> = bbr_nacked.into_iter().map(offset).collect();
    let bbr_acked: Vec<SentPacket> = bbr_acked.into_iter().map(offset).collect();
    if !bbr_acked.is_empty() || !bbr_nacked.is_empty() {
        protocol.with_congestion(|congestion, _| congestion.on_ack(now, &bbr_acked, &bbr_nacked));
    }

    for request in nacked_requests {
        request.ack(Status::Unavailable);
    }
    for request in acked_requests {
        request.ack(Status::Ok);
    }

    if force_ack_after {
        force_ack_soon(protocol);
    }
    continue_sending(protocol);

    result
}

/// RTO/close-driven nack path that bypasses [`AckFrame`] entirely (§4.4).
///
/// The spec's literal synthetic frame (`ack_to_seq = last_rto-able_seq`,
/// nacking everything from `recv_tip+1` through it) can't actually be built
/// as a well-formed [`AckFrame`]: `AckFrame::add_nack` requires every nack to
/// be strictly less than `ack_to_seq`, so the entry at `last_rto-able_seq`
/// can't be both the ack horizon and one of its own nacks. What matters
/// functionally is that `HandleAck`'s nack-classification runs for those
/// sequences, so this calls it directly rather than round-tripping through
/// the wire type (see `DESIGN.md`).
pub(crate) fn synthetic_nack(protocol: &PacketProtocol, seqs_ascending: &[Seq]) {
    if !protocol.is_ready() || seqs_ascending.is_empty() {
        return;
    }

    let now = protocol.now();
    let mut nacked_requests: Vec<SendRequestHdl> = Vec::new();
    let mut bbr_nacked: Vec<SentPacket> = Vec::new();
    let mut force_ack_after = false;

    {
        let mut inner = protocol.inner.borrow_mut();
        for &seq in seqs_ascending {
            let last_sent_ack = inner.last_sent_ack;
            let Some(idx) = entry_index(&inner, seq) else {
                continue;
            };
            let entry = &mut inner.outstanding[idx];
            if matches!(entry.state, OutstandingPacketState::Acked | OutstandingPacketState::Nacked) {
                continue;
            }
            entry.state = OutstandingPacketState::Nacked;
            if let Some(request) = entry.request.take() {
                nacked_requests.push(request);
            }
            let sent = entry.bbr_sent_packet.unwrap_or(SentPacket { seq, size: 0, send_time: now });
            bbr_nacked.push(sent);
            if last_sent_ack == Some(seq) {
                force_ack_after = true;
            }
        }
    }

    if !bbr_nacked.is_empty() {
        protocol.with_congestion(|congestion, _| congestion.on_ack(now, &[], &bbr_nacked));
    }
    for request in nacked_requests {
        request.ack(Status::Unavailable);
    }
    if force_ack_after {
        force_ack_soon(protocol);
    }
    continue_sending(protocol);
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use web_time::Instant;

    use super::*;
    use crate::bbr::BbrCongestionController;
    use crate::codec::NullCodec;
    use crate::timer::{Timeout, Timer};
    use crate::{Config, PacketProtocol};

    struct NoopTimeout;
    impl Timeout for NoopTimeout {
        fn cancel(&mut self) {}
    }

    struct FakeTimer {
        now: Instant,
    }
    impl Timer for FakeTimer {
        fn now(&self) -> Instant {
            self.now
        }
        fn schedule(&mut self, _deadline: Instant, _callback: Box<dyn FnOnce()>) -> Box<dyn Timeout> {
            Box::new(NoopTimeout)
        }
    }

    /// Immediately invokes `generate`/`on_sent` synchronously, as a loopback
    /// test double would.
    #[derive(Default)]
    struct ImmediateSender {
        sent: Rc<RefCell<Vec<(SeqNum, Vec<u8>)>>>,
    }
    impl PacketSender for ImmediateSender {
        fn send_packet(&mut self, seq: SeqNum, generate: PayloadGenerator, on_sent: SentCallback) {
            let bytes = generate(LazySliceArgs {
                desired_border: 0,
                max_length: 1200,
                has_other_content: false,
            });
            self.sent.borrow_mut().push((seq, bytes));
            on_sent();
        }
    }

    fn new_protocol(sent: Rc<RefCell<Vec<(SeqNum, Vec<u8>)>>>) -> PacketProtocol {
        PacketProtocol::new(
            Box::new(FakeTimer { now: Instant::now() }),
            Box::new(ImmediateSender { sent }),
            Box::new(NullCodec),
            Box::new(BbrCongestionController::new(Duration::from_millis(50))),
            Config::default(),
        )
    }

    #[test]
    fn send_assembles_a_pure_payload_packet_with_no_ack_due() {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let protocol = new_protocol(sent.clone());

        let acked = Rc::new(RefCell::new(None));
        let acked_clone = acked.clone();
        let request = FnSendRequest::new(
            |_args: LazySliceArgs| b"hello".to_vec(),
            move |status| *acked_clone.borrow_mut() = Some(status),
        );
        protocol.send(SendRequestHdl::new(Box::new(request)));

        let sent = sent.borrow();
        assert_eq!(1, sent.len());
        let (_, bytes) = &sent[0];
        // ack_length byte (0, no ack due yet) followed by the payload.
        assert_eq!(0, bytes[0]);
        assert_eq!(b"hello", &bytes[1..]);
    }

    #[test]
    fn handle_ack_resolves_simple_ack() {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let protocol = new_protocol(sent);

        let acked = Rc::new(RefCell::new(None));
        let acked_clone = acked.clone();
        let request = FnSendRequest::new(
            |_args: LazySliceArgs| Vec::new(),
            move |status| *acked_clone.borrow_mut() = Some(status),
        );
        protocol.send(SendRequestHdl::new(Box::new(request)));

        let frame = AckFrame::new(Seq(1), Duration::from_micros(100)).unwrap();
        handle_ack(&protocol, &frame).unwrap();

        assert_eq!(Some(Status::Ok), *acked.borrow());
        assert_eq!(Seq(2), protocol.inner.borrow().send_tip);
        assert!(protocol.inner.borrow().outstanding.is_empty());
    }

    #[test]
    fn handle_ack_delivers_nack_before_ack() {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let protocol = new_protocol(sent);

        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 1..=3u64 {
            let order_clone = order.clone();
            let request = FnSendRequest::new(
                move |_args: LazySliceArgs| Vec::new(),
                move |status| order_clone.borrow_mut().push((i, status)),
            );
            protocol.send(SendRequestHdl::new(Box::new(request)));
        }

        let mut frame = AckFrame::new(Seq(3), Duration::ZERO).unwrap();
        frame.add_nack(Seq(2)).unwrap();
        handle_ack(&protocol, &frame).unwrap();

        let order = order.borrow();
        assert_eq!(
            vec![(2, Status::Unavailable), (1, Status::Ok), (3, Status::Ok)],
            *order
        );
    }

    #[test]
    fn synthetic_nack_marks_requests_unavailable() {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let protocol = new_protocol(sent);

        let acked = Rc::new(RefCell::new(None));
        let acked_clone = acked.clone();
        let request = FnSendRequest::new(
            |_args: LazySliceArgs| Vec::new(),
            move |status| *acked_clone.borrow_mut() = Some(status),
        );
        protocol.send(SendRequestHdl::new(Box::new(request)));

        synthetic_nack(&protocol, &[Seq(1)]);
        assert_eq!(Some(Status::Unavailable), *acked.borrow());
    }
}
