//! Smoothed round-trip-time estimation (EWMA), driven by the ping/pong
//! keep-alive on each connection.
//!
//! `smooth_rtt = (1-a)*smooth_rtt + a*sample`
//! `rtt_deviation = (1-b)*rtt_deviation + b*|sample - smooth_rtt|`
//!
//! with `a` = [`RttEstimator::smoothing_factor`] (default 0.125) and `b` =
//! [`RttEstimator::deviation_factor`] (default 0.25). Before the first
//! sample, both statistics are unmeasured; callers must treat a negative
//! `base_delay` as "no estimate yet" rather than clamping it.

use std::time::Duration;

/// Default EWMA weight for the smoothed-RTT update (`SmoothingFactor`).
pub const DEFAULT_SMOOTHING_FACTOR: f64 = 0.125;
/// Default EWMA weight for the RTT-deviation update (`DeviationFactor`).
pub const DEFAULT_DEVIATION_FACTOR: f64 = 0.25;

/// EWMA smoothed round-trip-time estimator.
///
/// `smooth_rtt`/`rtt_deviation` are held in milliseconds as `f64` and start
/// at `-1.0`, a sentinel meaning "no sample observed yet" -- mirrored by
/// [`RttEstimator::base_delay`] returning a negative duration in that state
/// rather than `Option`, since the retransmit engine needs to distinguish
/// "no estimate" from "estimate of zero" with simple arithmetic.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    smooth_rtt_ms: f64,
    rtt_deviation_ms: f64,
    smoothing_factor: f64,
    deviation_factor: f64,
    samples: u64,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::with_factors(DEFAULT_SMOOTHING_FACTOR, DEFAULT_DEVIATION_FACTOR)
    }

    pub fn with_factors(smoothing_factor: f64, deviation_factor: f64) -> Self {
        Self {
            smooth_rtt_ms: -1.0,
            rtt_deviation_ms: -1.0,
            smoothing_factor,
            deviation_factor,
            samples: 0,
        }
    }

    /// Fold in a new RTT sample (the elapsed time between a Ping and its Pong).
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        if self.samples == 0 {
            self.smooth_rtt_ms = sample_ms;
            self.rtt_deviation_ms = sample_ms / 2.0;
        } else {
            let a = self.smoothing_factor;
            let b = self.deviation_factor;
            self.rtt_deviation_ms = (1.0 - b) * self.rtt_deviation_ms
                + b * (sample_ms - self.smooth_rtt_ms).abs();
            self.smooth_rtt_ms = (1.0 - a) * self.smooth_rtt_ms + a * sample_ms;
        }
        self.samples += 1;
    }

    /// Number of samples folded in so far.
    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    /// `true` once at least one sample has been observed.
    pub fn has_estimate(&self) -> bool {
        self.samples > 0
    }

    pub fn smooth_rtt(&self) -> Option<Duration> {
        self.has_estimate()
            .then(|| Duration::from_secs_f64((self.smooth_rtt_ms.max(0.0)) / 1000.0))
    }

    pub fn rtt_deviation(&self) -> Option<Duration> {
        self.has_estimate()
            .then(|| Duration::from_secs_f64((self.rtt_deviation_ms.max(0.0)) / 1000.0))
    }

    /// `smooth_rtt + 4 * rtt_deviation`, in milliseconds. Negative iff no
    /// sample has ever been observed -- the retransmit engine's signal to
    /// defer a resend without consuming an attempt.
    pub fn base_delay_ms(&self) -> f64 {
        if self.samples == 0 {
            -1.0
        } else {
            self.smooth_rtt_ms + 4.0 * self.rtt_deviation_ms
        }
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}
