//! Rising-edge step detection over the vertical motion signal.

use std::time::Duration;

/// A detected footfall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepEvent {
    /// Monotonic timestamp in nanoseconds.
    pub timestamp_ns: i64,
}

/// Thresholds a smoothed vertical signal with a refractory interval.
///
/// The smoothed value is the sum of the last `velocity_ring_size` vertical samples.
/// A step fires when it crosses above the threshold on this sample after being at
/// or below it on the previous one, and the refractory interval has elapsed since
/// the last step. Both conditions together reject jitter and double-counted impacts.
#[derive(Debug, Clone)]
pub struct StepDetector {
    ring: Vec<f32>,
    pushed: usize,
    threshold: f32,
    refractory_ns: i64,
    previous_estimate: f32,
    last_step_ns: Option<i64>,
}

impl StepDetector {
    pub fn new(velocity_ring_size: usize, threshold: f32, refractory: Duration) -> Self {
        Self {
            ring: vec![0.0; velocity_ring_size.max(1)],
            pushed: 0,
            threshold,
            refractory_ns: i64::try_from(refractory.as_nanos()).unwrap_or(i64::MAX),
            previous_estimate: 0.0,
            last_step_ns: None,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Feed one vertical sample; returns a step when one is detected.
    pub fn process(&mut self, vertical: f32, timestamp_ns: i64) -> Option<StepEvent> {
        let slot = self.pushed % self.ring.len();
        self.ring[slot] = vertical;
        self.pushed = self.pushed.saturating_add(1);

        let estimate: f32 = self.ring.iter().sum();
        let rising = estimate > self.threshold && self.previous_estimate <= self.threshold;
        let rested = self
            .last_step_ns
            .map(|last| timestamp_ns.saturating_sub(last) >= self.refractory_ns)
            .unwrap_or(true);
        self.previous_estimate = estimate;

        if rising && rested {
            self.last_step_ns = Some(timestamp_ns);
            Some(StepEvent { timestamp_ns })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;

    fn detector() -> StepDetector {
        StepDetector::new(1, 10.0, Duration::from_millis(250))
    }

    #[test]
    fn emits_on_rising_edge_only() {
        let mut d = detector();
        assert_eq!(d.process(5.0, 0), None);
        assert_eq!(d.process(11.0, 10 * MS), Some(StepEvent { timestamp_ns: 10 * MS }));
        // Still above threshold: no new edge.
        assert_eq!(d.process(12.0, 400 * MS), None);
    }

    #[test]
    fn refractory_interval_suppresses_double_counts() {
        let mut d = detector();
        assert!(d.process(11.0, 0).is_some());
        assert!(d.process(0.0, 50 * MS).is_none());
        assert!(d.process(11.0, 100 * MS).is_none());
        assert!(d.process(0.0, 200 * MS).is_none());
        assert!(d.process(11.0, 400 * MS).is_some());
    }

    #[test]
    fn exactly_at_threshold_is_not_a_step() {
        let mut d = detector();
        assert!(d.process(10.0, 0).is_none());
        assert!(d.process(10.5, MS).is_some());
    }

    #[test]
    fn smoothing_sums_the_velocity_ring() {
        let mut d = StepDetector::new(3, 10.0, Duration::from_millis(250));
        assert!(d.process(4.0, 0).is_none());
        assert!(d.process(4.0, MS).is_none());
        // 4 + 4 + 4 = 12 crosses 10.
        assert!(d.process(4.0, 2 * MS).is_some());
    }
}
