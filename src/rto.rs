//! Retransmission-timeout detection and the keepalive deadline that arms it
//! (§4.4).
//!
//! Grounded on the RTO pathway described in `original_source`'s
//! `packet_protocol.cc` (`CheckForRetransmit` / `StartKeepaliveTimer`): a
//! single deadline tracks the last proof of life from the peer, and firing it
//! synthesizes nacks for whatever is still outstanding rather than waiting
//! indefinitely for an ack that may never come.

use core::time::Duration;

use crate::{
    outstanding::OutstandingPacketState, seq::Seq, send, send_request::SendRequestHdl, status::Status, timer,
    PacketProtocol, MAX_CLAMPED_RTT, MIN_CLAMPED_RTT,
};

fn clamped_rtt(protocol: &PacketProtocol) -> Duration {
    timer::clamp_rtt(protocol.round_trip_time(), MIN_CLAMPED_RTT, MAX_CLAMPED_RTT)
}

/// Arms the RTO/keepalive timer for the first time, called from
/// [`PacketProtocol::new`].
pub(crate) fn keepalive(protocol: &PacketProtocol) {
    rearm(protocol);
}

/// Arms (or re-arms) the RTO timer, called on construction and whenever
/// outstanding/keepalive state changes (§4.4: "the RTO timer is armed
/// whenever there exists at least one outstanding packet that is (a) not
/// pure-ack and (b) scheduled at or before some epoch").
pub(crate) fn rearm(protocol: &PacketProtocol) {
    if !protocol.is_ready() {
        return;
    }
    let clamped = clamped_rtt(protocol);
    let (deadline, qualifies) = {
        let inner = protocol.inner.borrow();
        let qualifies = inner
            .outstanding
            .iter()
            .any(|p| !p.is_pure_ack && p.scheduled_at <= inner.last_keepalive_event);
        (inner.last_keepalive_event + 4 * clamped, qualifies)
    };

    {
        let mut inner = protocol.inner.borrow_mut();
        if let Some(mut existing) = inner.rto_scheduler.take() {
            existing.cancel();
        }
    }
    if !qualifies {
        return;
    }

    let cb_protocol = protocol.clone();
    let timeout = protocol.with_timer(|timer, _| timer.schedule(deadline, Box::new(move || on_rto_fire(&cb_protocol))));
    protocol.inner.borrow_mut().rto_scheduler = Some(timeout);
}

/// Any activity that proves the peer is alive resets the RTO deadline's base
/// (§4.4: "a new transmission granted by BBR, or any `Process` call").
pub(crate) fn note_keepalive(protocol: &PacketProtocol) {
    let now = protocol.now();
    {
        let mut inner = protocol.inner.borrow_mut();
        inner.last_keepalive_event = now;
    }
    rearm(protocol);
}

fn on_rto_fire(protocol: &PacketProtocol) {
    let _token = protocol.op_token();
    {
        let mut inner = protocol.inner.borrow_mut();
        inner.rto_scheduler = None;
    }
    if !protocol.is_ready() {
        return;
    }

    let clamped = clamped_rtt(protocol);
    let now = protocol.now();
    let deadline = {
        let inner = protocol.inner.borrow();
        inner.last_keepalive_event + 4 * clamped
    };
    if now < deadline {
        // Clock skew or timer coalescing: the deadline moved since this fire
        // was scheduled. Just re-arm against the current deadline.
        rearm(protocol);
        return;
    }

    // Find the highest outstanding, non-pure-ack sequence that predates the
    // last keepalive event -- everything from `send_tip` through it is
    // considered timed out.
    let (send_tip, last_rtoable_seq) = {
        let inner = protocol.inner.borrow();
        let mut last = None;
        for (i, packet) in inner.outstanding.iter().enumerate() {
            if !packet.is_pure_ack && packet.scheduled_at <= inner.last_keepalive_event {
                last = Some(inner.send_tip.0 + i as u64);
            }
        }
        (inner.send_tip, last)
    };

    if let Some(last) = last_rtoable_seq {
        let seqs: Vec<Seq> = (send_tip.0..=last).map(Seq).collect();
        send::synthetic_nack(protocol, &seqs);
    }

    let still_qualifies = {
        let inner = protocol.inner.borrow();
        inner.outstanding.iter().any(|p| !p.is_pure_ack)
    };
    if still_qualifies {
        rearm(protocol);
    }
}

/// Used by [`PacketProtocol::close`]: resolves every still-outstanding send
/// request with `status` (`Cancelled` on an error close, `Unavailable` on a
/// clean one), without going through the wire-level `AckFrame` machinery
/// that [`send::synthetic_nack`] and real peer acks use (there is no MSS or
/// strictly-descending-nack constraint to respect during teardown).
pub(crate) fn nack_all_outstanding(protocol: &PacketProtocol, status: Status) {
    let requests: Vec<SendRequestHdl> = {
        let mut inner = protocol.inner.borrow_mut();
        inner
            .outstanding
            .drain(..)
            .filter_map(|mut entry| {
                entry.state = OutstandingPacketState::Nacked;
                entry.request.take()
            })
            .collect()
    };
    for request in requests {
        request.ack(status);
    }
}
