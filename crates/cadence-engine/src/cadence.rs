//! Steps-per-minute estimation from step timestamps.
//!
//! Inter-step deltas go into a fixed ring. A delta that is more than twice or
//! less than half the previously accepted delta is treated as a misdetection and
//! dropped, but the step still advances the reference time. Cadence is only
//! defined once every ring slot has been written.

use cadence_types::CadenceUpdate;
use crossbeam_channel::{Receiver, Sender};

use crate::config::{CadenceConfig, CadenceFormula};
use crate::step::StepEvent;

/// Nanoseconds in one minute.
pub const NS_PER_MINUTE: f64 = 60_000_000_000.0;

/// Fixed-capacity ring of inter-step deltas in nanoseconds.
#[derive(Debug, Clone)]
pub struct DeltaRing {
    slots: Vec<Option<i64>>,
    cursor: usize,
}

impl DeltaRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot the next insert overwrites.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Overwrite the slot under the cursor and advance it.
    pub fn push(&mut self, delta_ns: i64) {
        self.slots[self.cursor] = Some(delta_ns);
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    /// `true` once no slot is unset.
    pub fn is_warm(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Written deltas in slot order.
    pub fn values(&self) -> Vec<i64> {
        self.slots.iter().flatten().copied().collect()
    }

    /// Mean of the ring; `None` until warm.
    pub fn mean(&self) -> Option<f64> {
        if !self.is_warm() {
            return None;
        }
        let values = self.values();
        Some(values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64)
    }

    /// Median of the ring (average of the two middle values for even sizes); `None` until warm.
    pub fn median(&self) -> Option<f64> {
        if !self.is_warm() {
            return None;
        }
        let mut sorted = self.values();
        sorted.sort_unstable();
        let n = sorted.len();
        Some((sorted[(n - 1) / 2] as f64 + sorted[n / 2] as f64) / 2.0)
    }
}

/// Outcome of feeding one step to the estimator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepOutcome {
    /// Delta inserted; carries the new cadence once the ring is warm.
    Accepted(Option<f64>),
    /// Delta discarded by the outlier rule.
    Rejected { delta_ns: i64, previous_ns: i64 },
}

/// Maintains the delta ring and publishes cadence updates.
pub struct CadenceEstimator {
    ring: DeltaRing,
    config: CadenceConfig,
    last_step_ns: Option<i64>,
    last_accepted_delta: Option<i64>,
    total_steps: u64,
    subscribers: Vec<Sender<CadenceUpdate>>,
}

impl CadenceEstimator {
    pub fn new(config: CadenceConfig) -> Self {
        Self {
            ring: DeltaRing::new(config.ring_size),
            config,
            last_step_ns: None,
            last_accepted_delta: None,
            total_steps: 0,
            subscribers: Vec::new(),
        }
    }

    pub fn ring(&self) -> &DeltaRing {
        &self.ring
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    /// Receive a [`CadenceUpdate`] for every accepted step on a warm ring.
    pub fn subscribe(&mut self) -> Receiver<CadenceUpdate> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Record a step, apply the outlier rule and publish the new cadence.
    pub fn on_step(&mut self, event: StepEvent) -> StepOutcome {
        self.total_steps = self.total_steps.saturating_add(1);
        let delta = match self.last_step_ns {
            Some(last) => event.timestamp_ns.saturating_sub(last),
            None => 0,
        };
        self.last_step_ns = Some(event.timestamp_ns);

        if let Some(previous) = self.last_accepted_delta.filter(|&d| d > 0) {
            let ratio = delta as f64 / previous as f64;
            if ratio > self.config.outlier_high_ratio || ratio < self.config.outlier_low_ratio {
                tracing::debug!(delta_ns = delta, previous_ns = previous, "step delta rejected");
                return StepOutcome::Rejected {
                    delta_ns: delta,
                    previous_ns: previous,
                };
            }
        }

        self.ring.push(delta);
        self.last_accepted_delta = Some(delta);

        let spm = self.steps_per_minute();
        if let Some(steps_per_minute) = spm {
            self.publish(CadenceUpdate {
                steps_per_minute,
                total_steps: self.total_steps,
            });
        }
        StepOutcome::Accepted(spm)
    }

    /// Cadence using the configured formula; `None` until the ring is warm.
    pub fn steps_per_minute(&self) -> Option<f64> {
        match self.config.formula {
            CadenceFormula::Mean => self.mean_steps_per_minute(),
            CadenceFormula::Median => self.median_steps_per_minute(),
            CadenceFormula::Blend => {
                let blended = (self.ring.mean()? + self.ring.median()?) / 2.0;
                spm_from_delta(blended)
            }
        }
    }

    pub fn mean_steps_per_minute(&self) -> Option<f64> {
        spm_from_delta(self.ring.mean()?)
    }

    pub fn median_steps_per_minute(&self) -> Option<f64> {
        spm_from_delta(self.ring.median()?)
    }

    /// Current estimate, if any, for on-demand requests.
    pub fn current(&self) -> Option<CadenceUpdate> {
        self.steps_per_minute().map(|steps_per_minute| CadenceUpdate {
            steps_per_minute,
            total_steps: self.total_steps,
        })
    }

    fn publish(&mut self, update: CadenceUpdate) {
        self.subscribers.retain(|tx| tx.send(update).is_ok());
    }
}

fn spm_from_delta(delta_ns: f64) -> Option<f64> {
    if delta_ns > 0.0 {
        Some(NS_PER_MINUTE / delta_ns)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;

    fn estimator(ring_size: usize) -> CadenceEstimator {
        CadenceEstimator::new(CadenceConfig {
            ring_size,
            ..CadenceConfig::default()
        })
    }

    fn feed_train(est: &mut CadenceEstimator, start_ns: i64, period_ns: i64, steps: usize) -> i64 {
        let mut t = start_ns;
        for _ in 0..steps {
            est.on_step(StepEvent { timestamp_ns: t });
            t += period_ns;
        }
        t - period_ns
    }

    #[test]
    fn cadence_undefined_until_ring_is_warm() {
        let mut est = estimator(4);
        for i in 0..4 {
            assert!(est.steps_per_minute().is_none(), "step {i}");
            est.on_step(StepEvent { timestamp_ns: 1_000 * MS + i * 500 * MS });
        }
        assert!(est.ring().is_warm());
        assert!(est.steps_per_minute().is_some());
    }

    #[test]
    fn clean_train_reports_one_hundred_spm_and_ignores_misdetection() {
        let mut est = estimator(10);
        let last = feed_train(&mut est, 5_000 * MS, 600 * MS, 11);
        let spm = est.steps_per_minute().unwrap();
        assert!((spm - 100.0).abs() < 1e-9, "{spm}");

        let outcome = est.on_step(StepEvent { timestamp_ns: last + 150 * MS });
        assert_eq!(
            outcome,
            StepOutcome::Rejected {
                delta_ns: 150 * MS,
                previous_ns: 600 * MS
            }
        );
        assert_eq!(est.steps_per_minute().unwrap(), spm);
    }

    #[test]
    fn rejected_step_still_advances_reference_time() {
        let mut est = estimator(3);
        let last = feed_train(&mut est, 0, 500 * MS, 4);
        // 1.5 s gap: ratio 3.0 is rejected.
        let t = last + 1_500 * MS;
        assert!(matches!(est.on_step(StepEvent { timestamp_ns: t }), StepOutcome::Rejected { .. }));
        // Measured from the rejected step, not from `last`.
        let outcome = est.on_step(StepEvent { timestamp_ns: t + 500 * MS });
        assert!(matches!(outcome, StepOutcome::Accepted(Some(_))));
        assert_eq!(est.total_steps(), 6);
    }

    #[test]
    fn outlier_bounds_are_exclusive() {
        let mut est = estimator(4);
        let last = feed_train(&mut est, 0, 400 * MS, 2);
        // Exactly 2.0x is kept.
        assert!(matches!(
            est.on_step(StepEvent { timestamp_ns: last + 800 * MS }),
            StepOutcome::Accepted(_)
        ));
        // Exactly 0.5x of 800 ms is kept.
        assert!(matches!(
            est.on_step(StepEvent { timestamp_ns: last + 1_200 * MS }),
            StepOutcome::Accepted(_)
        ));
    }

    #[test]
    fn first_step_inserts_zero_delta_and_is_never_an_outlier_reference() {
        let mut est = estimator(2);
        est.on_step(StepEvent { timestamp_ns: 10 * MS });
        assert_eq!(est.ring().values(), vec![0]);
        // Previous delta is 0, so any delta is accepted.
        assert!(matches!(
            est.on_step(StepEvent { timestamp_ns: 5_000 * MS }),
            StepOutcome::Accepted(_)
        ));
    }

    #[test]
    fn ring_cursor_wraps_after_capacity_inserts() {
        let mut ring = DeltaRing::new(3);
        let start = ring.cursor();
        for v in [10, 20, 30] {
            ring.push(v);
        }
        assert_eq!(ring.cursor(), start);
        ring.push(40);
        assert_eq!(ring.values(), vec![40, 20, 30]);
    }

    #[test]
    fn cadence_changes_only_on_accepted_steps() {
        let mut est = estimator(4);
        let mut t = feed_train(&mut est, 0, 500 * MS, 5);
        let before = est.steps_per_minute().unwrap();
        t += 2_000 * MS;
        est.on_step(StepEvent { timestamp_ns: t });
        assert_eq!(est.steps_per_minute().unwrap(), before);
        t += 600 * MS;
        est.on_step(StepEvent { timestamp_ns: t });
        assert_ne!(est.steps_per_minute().unwrap(), before);
    }

    #[test]
    fn formulas_mean_median_and_blend() {
        let mut ring = DeltaRing::new(4);
        for v in [400, 500, 500, 1_000] {
            ring.push(v * MS);
        }
        assert_eq!(ring.mean().unwrap(), 600.0 * MS as f64);
        assert_eq!(ring.median().unwrap(), 500.0 * MS as f64);

        let mut est = CadenceEstimator::new(CadenceConfig {
            ring_size: 4,
            formula: CadenceFormula::Blend,
            ..CadenceConfig::default()
        });
        est.ring = ring;
        let blend = est.steps_per_minute().unwrap();
        assert!((blend - NS_PER_MINUTE / (550.0 * MS as f64)).abs() < 1e-9);
        assert!((est.mean_steps_per_minute().unwrap() - 100.0).abs() < 1e-9);
        assert!((est.median_steps_per_minute().unwrap() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn subscribers_receive_updates_with_total_steps() {
        let mut est = estimator(2);
        let rx = est.subscribe();
        feed_train(&mut est, 0, 500 * MS, 3);
        let updates: Vec<CadenceUpdate> = rx.try_iter().collect();
        // Ring warms on step 2; step 3 publishes again.
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].total_steps, 3);
        assert!((updates[1].steps_per_minute - 120.0).abs() < 1e-9);
    }
}
