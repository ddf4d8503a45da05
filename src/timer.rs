//! Time source and deadline scheduling, external to the protocol core (§1).

use core::time::Duration;
use web_time::Instant;

/// A handle to a scheduled, cancellable timer callback.
///
/// Dropping a live handle without calling [`Timeout::cancel`] leaves the
/// timer armed; [`Timer`] implementations decide whether that still fires.
/// The protocol core always calls `cancel` explicitly when it reschedules or
/// tears down, so this crate never relies on drop-cancellation semantics.
pub trait Timeout {
    /// Cancels this timeout. A no-op if it already fired or was cancelled.
    fn cancel(&mut self);
}

/// Provides the current time and the ability to schedule deadline callbacks.
///
/// All callbacks scheduled through a single `Timer` are assumed to run on the
/// same logical task the protocol itself runs on (§5): the protocol performs
/// no internal synchronization.
pub trait Timer {
    /// The current time, as observed by this timer.
    fn now(&self) -> Instant;

    /// Schedules `callback` to run at or after `deadline`.
    fn schedule(&mut self, deadline: Instant, callback: Box<dyn FnOnce()>) -> Box<dyn Timeout>;
}

/// Clamps `rtt` into `[min, max]`, as used throughout the RTO and ack-pacing
/// calculations (§4.3, §4.4).
#[must_use]
pub fn clamp_rtt(rtt: Duration, min: Duration, max: Duration) -> Duration {
    rtt.clamp(min, max)
}
