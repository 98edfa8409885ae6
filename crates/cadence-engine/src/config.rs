use std::time::Duration;

/// Bytes in one interleaved stereo 16-bit frame.
pub const BYTES_PER_FRAME: usize = 4;

/// Output channel count of every decoded variant.
pub const OUTPUT_CHANNELS: usize = 2;

/// Motion filter and step detector tuning.
#[derive(Clone, Debug)]
pub struct MotionConfig {
    /// Samples per axis used to estimate the gravity vector.
    pub accel_ring_size: usize,
    /// Vertical-signal samples summed into the velocity estimate.
    pub velocity_ring_size: usize,
    /// Rising-edge threshold; `None` uses the step source's own default.
    pub step_threshold: Option<f32>,
    /// Minimum time between two emitted steps.
    pub refractory: Duration,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            accel_ring_size: 50,
            velocity_ring_size: 10,
            step_threshold: None,
            refractory: Duration::from_millis(250),
        }
    }
}

/// How steps-per-minute is derived from the delta ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CadenceFormula {
    /// `NS_PER_MINUTE / mean(ring)`.
    #[default]
    Mean,
    /// `NS_PER_MINUTE / median(ring)`.
    Median,
    /// `NS_PER_MINUTE / ((mean + median) / 2)`.
    Blend,
}

impl CadenceFormula {
    /// Parse a formula name as written in config files and flags.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mean" => Some(CadenceFormula::Mean),
            "median" => Some(CadenceFormula::Median),
            "blend" => Some(CadenceFormula::Blend),
            _ => None,
        }
    }
}

/// Cadence estimator tuning.
#[derive(Clone, Debug)]
pub struct CadenceConfig {
    /// Inter-step deltas kept in the ring.
    pub ring_size: usize,
    pub formula: CadenceFormula,
    /// A new delta above `previous * outlier_high_ratio` is discarded.
    pub outlier_high_ratio: f64,
    /// A new delta below `previous * outlier_low_ratio` is discarded.
    pub outlier_low_ratio: f64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            ring_size: 10,
            formula: CadenceFormula::Mean,
            outlier_high_ratio: 2.0,
            outlier_low_ratio: 0.5,
        }
    }
}

/// Switch-or-continue policy tuning for the playback controller.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Cadence updates arriving closer together than this are ignored.
    pub min_cadence_interval: Duration,
    /// Minimum time between two variant-set reloads driven by cadence.
    pub min_set_change_interval: Duration,
    /// A set reload needs a mismatch above `average gap * factor`.
    pub set_change_threshold_factor: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_cadence_interval: Duration::from_millis(1000),
            min_set_change_interval: Duration::from_millis(5000),
            set_change_threshold_factor: 1.5,
        }
    }
}

/// Playback tuning parameters shared by decode/resample/sink stages.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Sample rate every variant is rendered to.
    pub sample_rate: u32,
    /// Duration of one scheduler chunk.
    pub buffer_seconds: f32,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
    /// Periodic notification interval as a fraction of one chunk.
    pub notification_fraction: f32,
    /// Resampler chunk size in frames.
    pub resample_chunk_frames: usize,
}

impl Default for PlaybackConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            buffer_seconds: 2.0,
            refill_max_frames: 4096,
            notification_fraction: 0.9,
            resample_chunk_frames: 1024,
        }
    }
}

impl PlaybackConfig {
    /// Bytes in one scheduler chunk, rounded down to whole frames.
    pub fn buffer_bytes(&self) -> usize {
        buffer_frames(self.sample_rate, self.buffer_seconds) * BYTES_PER_FRAME
    }

    /// Output frames between two periodic notifications.
    pub fn notification_period_frames(&self) -> usize {
        let frames = buffer_frames(self.sample_rate, self.buffer_seconds) as f32;
        let fraction = if self.notification_fraction.is_finite() && self.notification_fraction > 0.0 {
            self.notification_fraction
        } else {
            0.9
        };
        ((frames * fraction).round() as usize).max(1)
    }
}

/// Frames covered by `buffer_seconds` at `rate_hz`, with a 2 s fallback for bad input.
pub fn buffer_frames(rate_hz: u32, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };
    ((rate_hz as f32 * secs).ceil() as usize).max(1)
}

/// Full engine configuration.
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub motion: MotionConfig,
    pub cadence: CadenceConfig,
    pub controller: ControllerConfig,
    pub playback: PlaybackConfig,
}
