//! Smoothed round-trip estimation.
//!
//! Stage timeouts derive from this estimate. It is a pacing hint only;
//! safety never depends on it.

use std::time::Duration;

/// EWMA weight on the previous estimate.
const SMOOTHING: f64 = 0.875;

/// Samples outside this range are clamped before smoothing.
const MIN_SAMPLE: Duration = Duration::from_millis(1);
const MAX_SAMPLE: Duration = Duration::from_secs(60);

/// Exponentially weighted moving average of observed round-trip times.
#[derive(Debug, Clone)]
pub struct LatencyEstimator {
    estimate: Duration,
}

impl LatencyEstimator {
    pub fn new(initial: Duration) -> Self {
        LatencyEstimator { estimate: initial }
    }

    /// Fold a new observation into the estimate.
    pub fn observe(&mut self, sample: Duration) {
        let sample = sample.clamp(MIN_SAMPLE, MAX_SAMPLE);
        let blended = SMOOTHING * self.estimate.as_secs_f64()
            + (1.0 - SMOOTHING) * sample.as_secs_f64();
        self.estimate = Duration::from_secs_f64(blended);
    }

    /// Force the estimate to a known value.
    pub fn set(&mut self, latency: Duration) {
        self.estimate = latency;
    }

    /// The current estimate.
    pub fn get(&self) -> Duration {
        self.estimate
    }
}
