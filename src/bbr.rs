//! Congestion control collaborator contract (§4.6) plus a concrete default
//! implementation.
//!
//! The exact BBR tuning is left an Open Question (§9) that this crate
//! deliberately doesn't fully resolve. [`BbrCongestionController`] answers it
//! with a bandwidth-delay-product pacer built on [`crate::rtt::RttEstimator`],
//! rather than a full BBRv1/v2 STARTUP/DRAIN/PROBE_BW/PROBE_RTT state machine
//! -- see `SPEC_FULL.md` §10.5.

use core::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use web_time::Instant;

use crate::{rtt::RttEstimator, seq::Seq, status::Status};

/// Bookkeeping about one packet handed to the wire, as returned by
/// [`CongestionController::schedule_transmit`] and consumed by
/// [`CongestionController::on_ack`].
#[derive(Debug, Clone, Copy)]
pub struct SentPacket {
    pub seq: Seq,
    pub size: usize,
    pub send_time: Instant,
}

/// The congestion-control collaborator (§4.6).
///
/// Implementations gate how many bytes the sender may have in flight and
/// estimate bandwidth/RTT from ack feedback. The protocol core treats this
/// purely through the trait; [`BbrCongestionController`] is the bundled
/// default.
pub trait CongestionController {
    /// Requests permission to transmit one packet. `callback` fires with
    /// [`Status::Ok`] once a window slot is available, or [`Status::Cancelled`]
    /// if the protocol closes first.
    fn request_transmit(&mut self, callback: Box<dyn FnOnce(Status)>);

    /// Releases any transmit request registered via `request_transmit`
    /// without firing its callback. Used during `Close()`.
    fn cancel_request_transmit(&mut self);

    /// Records that `seq` (of `size` bytes) was just sent at `now`.
    fn schedule_transmit(&mut self, seq: Seq, size: usize, now: Instant) -> SentPacket;

    /// Reports that `acked` packets were acknowledged and `nacked` packets
    /// were lost, observed at `now`. Send times in both lists are expected to
    /// already be offset by the peer's reported ack delay (§4.1).
    fn on_ack(&mut self, now: Instant, acked: &[SentPacket], nacked: &[SentPacket]);

    /// Current estimate of the path's bottleneck bandwidth, in bytes/sec.
    fn bottleneck_bandwidth(&self) -> f64;

    /// Current round-trip time estimate.
    fn rtt(&self) -> Duration;
}

/// Smallest congestion window this controller will ever report, regardless
/// of how small its bandwidth estimate is -- otherwise a connection that has
/// not yet measured any bandwidth could never send a first packet.
const MIN_CWND_BYTES: usize = 2 * 1200;

/// A bandwidth-delay-product pacer: keeps roughly `bandwidth * rtt` bytes in
/// flight, jittering the window the way BBR's pacing-gain cycle would, without
/// implementing BBR's full mode state machine.
pub struct BbrCongestionController {
    rtt: RttEstimator,
    max_bandwidth_bps: f64,
    bytes_in_flight: usize,
    pending_transmit: Option<Box<dyn FnOnce(Status)>>,
    rng: StdRng,
    closed: bool,
}

impl BbrCongestionController {
    #[must_use]
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            rtt: RttEstimator::new(initial_rtt),
            max_bandwidth_bps: 0.0,
            bytes_in_flight: 0,
            pending_transmit: None,
            rng: StdRng::from_entropy(),
            closed: false,
        }
    }

    /// Closes the controller: any pending transmit request is cancelled with
    /// [`Status::Cancelled`], and future requests fail immediately.
    pub fn close(&mut self) {
        self.closed = true;
        if let Some(callback) = self.pending_transmit.take() {
            callback(Status::Cancelled);
        }
    }

    fn cwnd(&mut self) -> usize {
        if self.max_bandwidth_bps <= 0.0 {
            return MIN_CWND_BYTES;
        }
        let bdp = self.max_bandwidth_bps * self.rtt.get().as_secs_f64();
        let gain: f64 = self.rng.gen_range(0.9..1.15);
        ((bdp * gain) as usize).max(MIN_CWND_BYTES)
    }

    fn maybe_grant_pending(&mut self) {
        if self.pending_transmit.is_some() && self.bytes_in_flight < self.cwnd() {
            if let Some(callback) = self.pending_transmit.take() {
                callback(Status::Ok);
            }
        }
    }
}

impl Default for BbrCongestionController {
    fn default() -> Self {
        Self::new(crate::rtt::DEFAULT_INITIAL_RTT)
    }
}

impl CongestionController for BbrCongestionController {
    fn request_transmit(&mut self, callback: Box<dyn FnOnce(Status)>) {
        if self.closed {
            callback(Status::Cancelled);
            return;
        }
        if self.bytes_in_flight < self.cwnd() {
            callback(Status::Ok);
        } else {
            self.pending_transmit = Some(callback);
        }
    }

    fn cancel_request_transmit(&mut self) {
        self.pending_transmit = None;
    }

    fn schedule_transmit(&mut self, seq: Seq, size: usize, now: Instant) -> SentPacket {
        self.bytes_in_flight += size;
        SentPacket {
            seq,
            size,
            send_time: now,
        }
    }

    fn on_ack(&mut self, now: Instant, acked: &[SentPacket], nacked: &[SentPacket]) {
        for packet in acked.iter().chain(nacked.iter()) {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size);
        }
        for packet in acked {
            let sample = now.saturating_duration_since(packet.send_time);
            if sample > Duration::ZERO {
                self.rtt.update(sample);
                let bw = packet.size as f64 / sample.as_secs_f64().max(1e-6);
                self.max_bandwidth_bps = self.max_bandwidth_bps.max(bw);
            }
        }
        self.maybe_grant_pending();
    }

    fn bottleneck_bandwidth(&self) -> f64 {
        self.max_bandwidth_bps
    }

    fn rtt(&self) -> Duration {
        self.rtt.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_immediately_with_no_bandwidth_estimate_yet() {
        let mut bbr = BbrCongestionController::new(Duration::from_millis(100));
        let granted = std::cell::Cell::new(None);
        bbr.request_transmit(Box::new(|status| granted.set(Some(status))));
        assert_eq!(Some(Status::Ok), granted.get());
    }

    #[test]
    fn close_cancels_pending_request() {
        let mut bbr = BbrCongestionController::new(Duration::from_millis(100));
        bbr.bytes_in_flight = usize::MAX - 1;
        let granted = std::cell::Cell::new(None);
        bbr.request_transmit(Box::new(|status| granted.set(Some(status))));
        assert_eq!(None, granted.get());
        bbr.close();
        assert_eq!(Some(Status::Cancelled), granted.get());
    }

    #[test]
    fn on_ack_updates_rtt_and_bandwidth() {
        let mut bbr = BbrCongestionController::new(Duration::from_millis(100));
        let now = Instant::now();
        let sent = bbr.schedule_transmit(Seq(1), 1000, now);
        let later = now + Duration::from_millis(50);
        bbr.on_ack(later, &[sent], &[]);
        assert!(bbr.bottleneck_bandwidth() > 0.0);
        assert_eq!(0, bbr.bytes_in_flight);
    }
}
