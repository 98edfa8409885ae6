//! Gravity removal for raw accelerometer samples.
//!
//! The gravity (orientation) vector is estimated as the running mean of the last
//! `accel_ring_size` samples on each axis. Each new sample is projected onto the
//! normalised gravity vector and the gravity magnitude is subtracted, leaving a
//! scalar "vertical motion" signal that is independent of how the device is held.
//!
//! The mean is recomputed from the rings on every sample. That is O(ring size),
//! which is negligible at sensor rates and keeps the filter free of drift.

/// One raw 3-axis acceleration sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AccelSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Monotonic timestamp in nanoseconds.
    pub timestamp_ns: i64,
}

impl AccelSample {
    pub fn new(x: f32, y: f32, z: f32, timestamp_ns: i64) -> Self {
        Self { x, y, z, timestamp_ns }
    }

    fn as_array(&self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

/// Fixed-memory gravity-removal filter.
#[derive(Debug, Clone)]
pub struct MotionSignalFilter {
    rings: [Vec<f32>; 3],
    pushed: usize,
}

impl MotionSignalFilter {
    pub fn new(ring_size: usize) -> Self {
        let size = ring_size.max(1);
        Self {
            rings: [vec![0.0; size], vec![0.0; size], vec![0.0; size]],
            pushed: 0,
        }
    }

    fn ring_size(&self) -> usize {
        self.rings[0].len()
    }

    /// Push a sample and return its gravity-removed vertical acceleration.
    ///
    /// Returns `0.0` while the gravity estimate has zero magnitude.
    pub fn process(&mut self, sample: &AccelSample) -> f32 {
        let size = self.ring_size();
        let slot = self.pushed % size;
        self.pushed = self.pushed.saturating_add(1);

        let current = sample.as_array();
        for (ring, value) in self.rings.iter_mut().zip(current) {
            ring[slot] = value;
        }

        // Unwritten slots are still zero, so summing the whole ring is exact.
        let filled = self.pushed.min(size) as f32;
        let mut gravity = [0.0f32; 3];
        for (axis, ring) in gravity.iter_mut().zip(&self.rings) {
            *axis = ring.iter().sum::<f32>() / filled;
        }

        let magnitude = norm(&gravity);
        if magnitude <= f32::EPSILON || !magnitude.is_finite() {
            return 0.0;
        }
        for axis in &mut gravity {
            *axis /= magnitude;
        }
        dot(&gravity, &current) - magnitude
    }
}

fn norm(v: &[f32; 3]) -> f32 {
    dot(v, v).sqrt()
}

fn dot(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
