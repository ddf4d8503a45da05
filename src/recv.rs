//! Incoming pipeline: duplicate/reordering handling, the receive ledger, and
//! ack-pacing/suppression (§4.2, §4.3).
//!
//! Grounded on `original_source`'s `packet_protocol.cc` `Process` /
//! `MaybeSendAck`: a [`ProcessedPacket`] is this crate's name for that
//! function's deferred continuation -- the caller (the host's socket read
//! loop) gets to inspect the payload and optionally call
//! [`ProcessedPacket::nack`] before the ledger entry and any due ack are
//! actually committed on drop.

use std::time::Duration;

use web_time::Instant;

use crate::{
    ack::AckFrame,
    rto,
    seq::{Seq, SeqNum},
    send,
    status::Status,
    timer, varint, OpToken, PacketProtocol, ReceiveState, ReceivedPacket, MAX_CLAMPED_RTT, MIN_CLAMPED_RTT,
};

/// What a just-finalized received packet should trigger (§4.2 step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendAckDecision {
    /// Suppressed: a contiguous run of pure-ack packets needs no reply.
    None,
    /// Send an ack now, bypassing pacing.
    Force,
    /// Arm the ack-pacing timer if it isn't already armed.
    Schedule,
}

/// Work deferred until a [`ProcessedPacket`] is dropped: the ledger
/// finalization and ack decision computed while the packet's payload was
/// still being inspected by the caller.
struct PendingCommit {
    protocol: PacketProtocol,
    seq: Seq,
    suppress: bool,
    decision: SendAckDecision,
    ack_frame: Option<AckFrame>,
}

/// A single incoming packet, handed back from [`PacketProtocol::process`].
///
/// The payload is available immediately; the protocol's side effects (ledger
/// update, queued/forced ack, delivering any piggybacked [`AckFrame`] to the
/// sender side) are deferred until this value is dropped, so the caller has a
/// chance to call [`ProcessedPacket::nack`] first if it decides this packet
/// cannot actually be used (§4.2: "the caller may reject a structurally valid
/// packet for reasons the transport core can't see, e.g. a higher-layer
/// integrity check").
pub struct ProcessedPacket {
    status: Result<Option<Vec<u8>>, Status>,
    nacked: bool,
    commit: Option<PendingCommit>,
    _token: Option<OpToken>,
}

impl ProcessedPacket {
    fn empty(status: Result<Option<Vec<u8>>, Status>, token: OpToken) -> Self {
        Self {
            status,
            nacked: false,
            commit: None,
            _token: Some(token),
        }
    }

    /// The outcome of processing this packet, before it's consumed.
    #[must_use]
    pub fn status(&self) -> &Result<Option<Vec<u8>>, Status> {
        &self.status
    }

    /// Consumes this handle, returning its payload (or the failure reason).
    ///
    /// The deferred ledger/ack commit described on [`ProcessedPacket`] still
    /// runs once the returned value (and this handle) finish dropping.
    #[must_use]
    pub fn into_payload(mut self) -> Result<Option<Vec<u8>>, Status> {
        std::mem::replace(&mut self.status, Ok(None))
    }

    /// Marks this packet as rejected: its ledger entry commits as
    /// `NOT_RECEIVED` instead of `RECEIVED`, and an ack is forced soon so the
    /// peer learns about the rejection without waiting on pacing.
    pub fn nack(&mut self) {
        self.nacked = true;
    }
}

impl Drop for ProcessedPacket {
    fn drop(&mut self) {
        let Some(commit) = self.commit.take() else {
            return;
        };
        let PendingCommit {
            protocol,
            seq,
            suppress,
            mut decision,
            ack_frame,
        } = commit;

        {
            let mut inner = protocol.inner.borrow_mut();
            let final_state = if self.nacked {
                ReceiveState::NotReceived
            } else if suppress {
                ReceiveState::ReceivedAndSuppressedAck
            } else {
                ReceiveState::Received
            };
            if let Some(entry) = inner.received_packets.get_mut(&seq.0) {
                entry.state = final_state;
            }
            if self.nacked {
                // A rejected packet can never have legitimately suppressed an
                // ack, and the peer needs to learn about it promptly.
                inner.last_ack_send = None;
                decision = SendAckDecision::Force;
            }
            let recv_tip = inner.recv_tip.0;
            inner.received_packets.retain(|&s, _| s >= recv_tip);
        }

        // Deferred actions from any ack frame this packet carried: BBR
        // update, queued send-request callbacks, and letting the next queued
        // send proceed, all handled inside `handle_ack` itself.
        if let Some(frame) = &ack_frame {
            let _ = send::handle_ack(&protocol, frame);
        }

        match decision {
            SendAckDecision::Force => send::force_ack_soon(&protocol),
            SendAckDecision::Schedule => schedule_ack(&protocol),
            SendAckDecision::None => {}
        }
    }
}

/// Processes one incoming, still-encoded packet (§4.2 `Process`).
pub(crate) fn process(protocol: &PacketProtocol, received_at: Instant, seq_num: SeqNum, payload: &[u8]) -> ProcessedPacket {
    let token = protocol.op_token();

    if !protocol.is_ready() {
        return ProcessedPacket::empty(Ok(None), token);
    }

    let recv_tip = protocol.inner.borrow().recv_tip;
    let seq = seq_num.reconstruct(recv_tip);
    if seq.0 < recv_tip.0 {
        // Already compacted out of the ledger: too old to matter.
        return ProcessedPacket::empty(Ok(None), token);
    }

    {
        let mut inner = protocol.inner.borrow_mut();
        if seq.0 > inner.max_seen.0 {
            inner.max_seen = seq;
        }
    }
    rto::note_keepalive(protocol);

    let decoded = protocol.with_codec(|codec| codec.decode(seq, payload));
    let plaintext = match decoded {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::debug!(%seq, %err, "failed to decode incoming packet");
            return ProcessedPacket::empty(Err(Status::InvalidArgument), token);
        }
    };

    let mut src: &[u8] = plaintext.as_slice();
    let Ok(ack_length) = varint::read_u64(&mut src) else {
        return ProcessedPacket::empty(Err(Status::InvalidArgument), token);
    };
    let ack_length = match usize::try_from(ack_length) {
        Ok(len) if len <= src.len() => len,
        _ => return ProcessedPacket::empty(Err(Status::InvalidArgument), token),
    };
    let (ack_bytes, rest) = src.split_at(ack_length);
    let user_payload = rest.to_vec();

    let ack_frame = if ack_bytes.is_empty() {
        None
    } else {
        let mut ack_src = ack_bytes;
        match octs::Read::read::<AckFrame>(&mut ack_src) {
            Ok(frame) => Some(frame),
            Err(err) => {
                tracing::debug!(%seq, %err, "failed to decode piggybacked ack frame");
                return ProcessedPacket::empty(Err(Status::InvalidArgument), token);
            }
        }
    };

    let is_duplicate = protocol.inner.borrow().received_packets.contains_key(&seq.0);
    if is_duplicate {
        return ProcessedPacket::empty(Ok(None), token);
    }

    {
        let mut inner = protocol.inner.borrow_mut();
        inner.received_packets.insert(
            seq.0,
            ReceivedPacket {
                state: ReceiveState::Pending,
                received_at,
            },
        );
    }

    let is_pure_ack = ack_frame.is_some() && user_payload.is_empty();
    let (suppress, decision) = {
        let mut inner = protocol.inner.borrow_mut();
        let predecessor_received = seq.0 > 0
            && inner
                .received_packets
                .get(&(seq.0 - 1))
                .is_some_and(|p| p.state == ReceiveState::Received);
        let is_highest_seen = seq == inner.max_seen;

        if is_pure_ack && predecessor_received && is_highest_seen {
            (true, SendAckDecision::None)
        } else if !inner.sent_first_ack {
            inner.sent_first_ack = true;
            (false, SendAckDecision::Force)
        } else if seq.0 >= inner.config.max_unacked_receives
            && inner.max_acked <= seq.0.saturating_sub(inner.config.max_unacked_receives)
        {
            (false, SendAckDecision::Force)
        } else {
            (false, SendAckDecision::Schedule)
        }
    };

    ProcessedPacket {
        status: Ok(if user_payload.is_empty() { None } else { Some(user_payload) }),
        nacked: false,
        commit: Some(PendingCommit {
            protocol: protocol.clone(),
            seq,
            suppress,
            decision,
            ack_frame,
        }),
        _token: Some(token),
    }
}

/// Hints that a standalone ack should be produced soon, bypassing pacing
/// (§4.2 `RequestSendAck`; also used internally when a rejected/nacked
/// packet needs to be reported promptly).
pub(crate) fn force_ack_soon(protocol: &PacketProtocol) {
    send::force_ack_soon(protocol);
}

fn quarter_rtt(protocol: &PacketProtocol) -> Duration {
    timer::clamp_rtt(protocol.round_trip_time(), MIN_CLAMPED_RTT, MAX_CLAMPED_RTT) / 4
}

/// Arms the ack-pacing timer if it isn't already armed (§4.3).
pub(crate) fn schedule_ack(protocol: &PacketProtocol) {
    if !protocol.is_ready() {
        return;
    }
    let already_armed = protocol.inner.borrow().ack_scheduler.is_some();
    if already_armed {
        return;
    }

    let deadline = protocol.now() + quarter_rtt(protocol);
    let cb_protocol = protocol.clone();
    let timeout = protocol.with_timer(|timer, _| timer.schedule(deadline, Box::new(move || on_ack_timer_fire(&cb_protocol))));
    protocol.inner.borrow_mut().ack_scheduler = Some(timeout);
}

fn on_ack_timer_fire(protocol: &PacketProtocol) {
    let _token = protocol.op_token();
    protocol.inner.borrow_mut().ack_scheduler = None;
    if !protocol.is_ready() {
        return;
    }
    send::force_ack_soon(protocol);
}

/// Builds the next ack frame due, if any, fitting within `max_length` bytes
/// (§4.2 step 8, §4.3 ack pacing). Called from [`send::generate_packet_bytes`]
/// while assembling every outgoing packet, piggybacking on whatever is ready
/// to send next rather than needing a dedicated ack-only packet in the
/// common case.
pub(crate) fn generate_ack(protocol: &PacketProtocol, max_length: usize) -> Option<AckFrame> {
    if !protocol.is_ready() {
        return None;
    }

    let now = protocol.now();
    let quarter = quarter_rtt(protocol);

    let mut inner = protocol.inner.borrow_mut();
    if inner.max_seen.0 <= inner.recv_tip.0 {
        return None;
    }
    if let Some(last) = inner.last_ack_send {
        if now.saturating_duration_since(last) < quarter {
            drop(inner);
            schedule_ack(protocol);
            return None;
        }
    }

    let recv_tip = inner.recv_tip;
    let original_max_seen = inner.max_seen;

    // A still-`Pending` entry (its `ProcessedPacket` hasn't committed yet)
    // can't be the ack horizon, or be silently skipped over by a higher one:
    // shrink the horizon to just below the lowest pending sequence in range
    // and try again once it resolves.
    let mut effective_max_seen = original_max_seen;
    let mut truncated = false;
    for candidate in (recv_tip.0 + 1)..=original_max_seen.0 {
        if matches!(
            inner.received_packets.get(&candidate).map(|p| p.state),
            Some(ReceiveState::Pending)
        ) {
            effective_max_seen = Seq(candidate - 1);
            truncated = true;
            break;
        }
    }
    if effective_max_seen.0 <= recv_tip.0 {
        drop(inner);
        schedule_ack(protocol);
        return None;
    }

    let received_at = inner
        .received_packets
        .get(&effective_max_seen.0)
        .map_or(now, |p| p.received_at);
    let ack_delay = now.saturating_duration_since(received_at);

    let Ok(mut frame) = AckFrame::new(effective_max_seen, ack_delay) else {
        return None;
    };

    let mut seq = effective_max_seen.0;
    while seq > recv_tip.0 + 1 {
        seq -= 1;
        match inner.received_packets.get(&seq).map(|p| p.state) {
            None => {
                inner
                    .received_packets
                    .insert(seq, ReceivedPacket { state: ReceiveState::NotReceived, received_at: now });
                frame.add_nack(Seq(seq)).expect("nacks are added in strictly descending order");
            }
            Some(ReceiveState::NotReceived) => {
                frame.add_nack(Seq(seq)).expect("nacks are added in strictly descending order");
            }
            Some(ReceiveState::Received | ReceiveState::ReceivedAndSuppressedAck) => {}
            Some(ReceiveState::Pending) => {
                unreachable!("effective_max_seen excludes any pending entry in this range")
            }
        }
    }

    inner.last_ack_send = Some(now);
    drop(inner);

    let delay_protocol = protocol.clone();
    frame.adjust_for_mss(max_length, move |seq| {
        delay_protocol
            .inner
            .borrow()
            .received_packets
            .get(&seq.0)
            .map(|p| now.saturating_duration_since(p.received_at))
    });

    if truncated || frame.partial() {
        schedule_ack(protocol);
    }

    Some(frame)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use web_time::Instant as WebInstant;

    use super::*;
    use crate::bbr::BbrCongestionController;
    use crate::codec::NullCodec;
    use crate::send_request::{FnSendRequest, LazySliceArgs, PayloadGenerator, PacketSender, SendRequestHdl, SentCallback};
    use crate::timer::{Timeout, Timer};
    use crate::{Config, PacketProtocol};

    struct NoopTimeout;
    impl Timeout for NoopTimeout {
        fn cancel(&mut self) {}
    }

    struct FakeTimer {
        now: WebInstant,
    }
    impl Timer for FakeTimer {
        fn now(&self) -> WebInstant {
            self.now
        }
        fn schedule(&mut self, _deadline: WebInstant, _callback: Box<dyn FnOnce()>) -> Box<dyn Timeout> {
            Box::new(NoopTimeout)
        }
    }

    #[derive(Default)]
    struct ImmediateSender;
    impl PacketSender for ImmediateSender {
        fn send_packet(&mut self, _seq: SeqNum, generate: PayloadGenerator, on_sent: SentCallback) {
            let _ = generate(LazySliceArgs {
                desired_border: 0,
                max_length: 1200,
                has_other_content: false,
            });
            on_sent();
        }
    }

    fn new_protocol() -> PacketProtocol {
        PacketProtocol::new(
            Box::new(FakeTimer { now: WebInstant::now() }),
            Box::new(ImmediateSender),
            Box::new(NullCodec),
            Box::new(BbrCongestionController::new(Duration::from_millis(50))),
            Config::default(),
        )
    }

    fn wire(seq: u64, outstanding: u64) -> SeqNum {
        SeqNum::new(Seq(seq), outstanding).unwrap()
    }

    fn encode_packet(ack: Option<&AckFrame>, payload: &[u8]) -> Vec<u8> {
        let mut ack_bytes = Vec::new();
        if let Some(frame) = ack {
            octs::Encode::encode(frame, &mut ack_bytes).unwrap();
        }
        let mut buf = Vec::new();
        varint::write_u64(&mut buf, ack_bytes.len() as u64).unwrap();
        buf.extend_from_slice(&ack_bytes);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn process_delivers_payload_and_commits_received() {
        let protocol = new_protocol();
        let bytes = encode_packet(None, b"hello");
        let processed = protocol.process(protocol.inner.borrow().last_keepalive_event, wire(1, 1), &bytes);
        assert_eq!(Ok(Some(b"hello".to_vec())), processed.status);
        drop(processed);

        let inner = protocol.inner.borrow();
        let entry = inner.received_packets.get(&1).expect("ledger entry for seq 1");
        assert_eq!(ReceiveState::Received, entry.state);
    }

    #[test]
    fn duplicate_packet_is_dropped_silently() {
        let protocol = new_protocol();
        let bytes = encode_packet(None, b"hi");
        drop(protocol.process(protocol.inner.borrow().last_keepalive_event, wire(1, 1), &bytes));

        let second = protocol.process(protocol.inner.borrow().last_keepalive_event, wire(1, 1), &bytes);
        assert_eq!(Ok(None), second.status);
    }

    #[test]
    fn first_packet_always_forces_an_ack() {
        let protocol = new_protocol();
        let bytes = encode_packet(None, b"hi");
        let processed = protocol.process(protocol.inner.borrow().last_keepalive_event, wire(1, 1), &bytes);
        drop(processed);

        assert!(protocol.inner.borrow().last_ack_send.is_some());
    }

    #[test]
    fn nack_commits_not_received_and_forces_reack() {
        let protocol = new_protocol();
        let bytes = encode_packet(None, b"hi");
        let mut processed = protocol.process(protocol.inner.borrow().last_keepalive_event, wire(1, 1), &bytes);
        processed.nack();
        drop(processed);

        let inner = protocol.inner.borrow();
        let entry = inner.received_packets.get(&1).expect("ledger entry for seq 1");
        assert_eq!(ReceiveState::NotReceived, entry.state);
    }

    #[test]
    fn generate_ack_reports_nothing_due_when_ledger_is_empty() {
        let protocol = new_protocol();
        assert!(generate_ack(&protocol, 512).is_none());
    }

    #[test]
    fn generate_ack_reports_gap_as_nack() {
        let protocol = new_protocol();
        let bytes = encode_packet(None, b"hi");
        // Seq 1 is skipped; seq 2 arrives first, leaving a gap.
        drop(protocol.process(protocol.inner.borrow().last_keepalive_event, wire(2, 1), &bytes));

        let frame = generate_ack(&protocol, 512).expect("an ack is due");
        assert_eq!(Seq(2), frame.ack_to_seq());
        assert_eq!(&[Seq(1)], frame.nack_seqs());
    }
}

