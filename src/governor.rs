//! Closed-loop send rate governor.
//!
//! The governor decides, per new source frame, whether a publisher may send
//! now. It keeps an integrator `delta` that shortens or lengthens the
//! admission window so that the long-run send rate converges on the target
//! even when encoding and dispatch take a noticeable share of the interval.
//!
//! Time is always passed in, so tests can drive the governor with a
//! synthetic clock.

use std::time::{Duration, Instant};

/// A publisher that has not sent for this many target intervals is
/// considered stalled, and its accumulated correction is discarded.
pub const STALL_FACTOR: f64 = 2.0;

/// Integrator-controlled rate limiter for one published stream.
#[derive(Debug, Clone)]
pub struct RateGovernor {
    /// Target seconds between sends.
    target_interval: f64,
    gain: f64,
    /// Accumulated correction, seconds.
    delta: f64,
    last_send: Instant,
    last_check: Instant,
}

impl RateGovernor {
    /// Create a governor for `target_fps` sends per second.
    ///
    /// A non-positive or non-finite target disables limiting.
    pub fn new(target_fps: f64, gain: f64, now: Instant) -> Self {
        let target_interval =
            if target_fps.is_finite() && target_fps > 0.0 { 1.0 / target_fps } else { 0.0 };
        Self { target_interval, gain, delta: 0.0, last_send: now, last_check: now }
    }

    /// Whether a frame may be sent at `now`.
    ///
    /// A rejection leaves the state untouched; an admission records `now` as
    /// the last check.
    pub fn admit(&mut self, now: Instant) -> bool {
        let since_check = seconds_between(self.last_check, now);
        if since_check < self.target_interval - self.delta {
            return false;
        }
        self.last_check = now;
        true
    }

    /// Feed the time of a completed send back into the integrator.
    pub fn record_send(&mut self, now: Instant) {
        let since_send = seconds_between(self.last_send, now);
        self.delta += self.gain * (since_send - self.target_interval);
        self.last_send = now;
    }

    /// Reset the integrator after an idle period.
    ///
    /// Returns whether the governor was considered stalled.
    pub fn relax_if_stalled(&mut self, now: Instant) -> bool {
        let stall = STALL_FACTOR * self.target_interval;
        if seconds_between(self.last_send, now) <= stall {
            return false;
        }
        self.delta = 0.0;
        self.last_send = now.checked_sub(Duration::from_secs_f64(stall)).unwrap_or(now);
        true
    }

    pub fn target_interval(&self) -> Duration {
        Duration::from_secs_f64(self.target_interval)
    }

    /// Current integrator correction in seconds.
    pub fn delta(&self) -> f64 {
        self.delta
    }
}

fn seconds_between(earlier: Instant, later: Instant) -> f64 {
    later.saturating_duration_since(earlier).as_secs_f64()
}
