//! Step sources selected at startup.
//!
//! Every source exposes the same capability: listeners register for
//! [`SensorEvent`]s, can unregister, and are told when the source stops.
//! - [`InbuiltStepSource`] forwards timestamps from a hardware step detector.
//! - [`ExternalStepSource`] runs the motion pipeline over an external (earable)
//!   accelerometer that reports g and milliseconds.
//! - [`AccelerometerStepSource`] runs the motion pipeline over the device
//!   accelerometer (m/s², nanoseconds).

use std::str::FromStr;

use anyhow::anyhow;
use crossbeam_channel::{Receiver, Sender};

use crate::config::MotionConfig;
use crate::motion::{AccelSample, MotionSignalFilter};
use crate::step::{StepDetector, StepEvent};

const STANDARD_GRAVITY: f32 = 9.81;
const NS_PER_MS: i64 = 1_000_000;

/// Events delivered to step listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorEvent {
    Step(StepEvent),
    /// The source stopped; no further events follow.
    Stopped,
}

/// Raw input a source can be fed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SensorInput {
    /// A step reported by a hardware detector.
    Step { timestamp: i64 },
    /// A raw acceleration reading in the source's native units.
    Accel { timestamp: i64, x: f32, y: f32, z: f32 },
}

/// Handle returned by [`StepSource::register_listener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Common capability of all step sources.
pub trait StepSource: Send {
    fn kind(&self) -> StepSourceKind;

    /// Register a listener; events arrive on the returned receiver.
    fn register_listener(&mut self) -> (ListenerId, Receiver<SensorEvent>);

    fn unregister_listener(&mut self, id: ListenerId);

    /// Notify listeners with [`SensorEvent::Stopped`] and drop them.
    fn stop(&mut self);

    /// Feed raw input; returns the step it produced, if any.
    fn feed(&mut self, input: SensorInput) -> Option<StepEvent>;
}

/// Which [`StepSource`] to build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepSourceKind {
    Inbuilt,
    External,
    Accelerometer,
}

impl StepSourceKind {
    /// Rising-edge threshold used when the config does not override it.
    pub fn default_threshold(self) -> f32 {
        match self {
            StepSourceKind::External => 20.0,
            StepSourceKind::Inbuilt | StepSourceKind::Accelerometer => 50.0,
        }
    }
}

impl FromStr for StepSourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbuilt" | "builtin" => Ok(StepSourceKind::Inbuilt),
            "external" | "esense" => Ok(StepSourceKind::External),
            "accelerometer" | "accel" => Ok(StepSourceKind::Accelerometer),
            other => Err(anyhow!("unknown step source: {other}")),
        }
    }
}

/// Build the step source for `kind`.
pub fn build_step_source(kind: StepSourceKind, motion: &MotionConfig) -> Box<dyn StepSource> {
    match kind {
        StepSourceKind::Inbuilt => Box::new(InbuiltStepSource::default()),
        StepSourceKind::External => Box::new(ExternalStepSource::new(motion)),
        StepSourceKind::Accelerometer => Box::new(AccelerometerStepSource::new(motion)),
    }
}

/// Registered listeners shared by every source.
#[derive(Default)]
struct Listeners {
    next_id: u64,
    senders: Vec<(ListenerId, Sender<SensorEvent>)>,
}

impl Listeners {
    fn register(&mut self) -> (ListenerId, Receiver<SensorEvent>) {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = crossbeam_channel::unbounded();
        self.senders.push((id, tx));
        (id, rx)
    }

    fn unregister(&mut self, id: ListenerId) {
        self.senders.retain(|(existing, _)| *existing != id);
    }

    fn emit(&mut self, event: SensorEvent) {
        self.senders.retain(|(_, tx)| tx.send(event).is_ok());
    }

    fn stop(&mut self) {
        self.emit(SensorEvent::Stopped);
        self.senders.clear();
    }
}

/// Motion filter + step detector pair.
struct MotionPipeline {
    filter: MotionSignalFilter,
    detector: StepDetector,
}

impl MotionPipeline {
    fn new(kind: StepSourceKind, motion: &MotionConfig) -> Self {
        let threshold = motion.step_threshold.unwrap_or_else(|| kind.default_threshold());
        Self {
            filter: MotionSignalFilter::new(motion.accel_ring_size),
            detector: StepDetector::new(motion.velocity_ring_size, threshold, motion.refractory),
        }
    }

    fn process(&mut self, sample: AccelSample) -> Option<StepEvent> {
        let vertical = self.filter.process(&sample);
        self.detector.process(vertical, sample.timestamp_ns)
    }
}

/// Hardware step detector passthrough.
#[derive(Default)]
pub struct InbuiltStepSource {
    listeners: Listeners,
}

impl StepSource for InbuiltStepSource {
    fn kind(&self) -> StepSourceKind {
        StepSourceKind::Inbuilt
    }

    fn register_listener(&mut self) -> (ListenerId, Receiver<SensorEvent>) {
        self.listeners.register()
    }

    fn unregister_listener(&mut self, id: ListenerId) {
        self.listeners.unregister(id);
    }

    fn stop(&mut self) {
        self.listeners.stop();
    }

    fn feed(&mut self, input: SensorInput) -> Option<StepEvent> {
        match input {
            SensorInput::Step { timestamp } => {
                let step = StepEvent { timestamp_ns: timestamp };
                self.listeners.emit(SensorEvent::Step(step));
                Some(step)
            }
            SensorInput::Accel { .. } => {
                tracing::trace!("inbuilt step source ignores acceleration input");
                None
            }
        }
    }
}

/// External earable accelerometer (g, milliseconds).
pub struct ExternalStepSource {
    listeners: Listeners,
    pipeline: MotionPipeline,
}

impl ExternalStepSource {
    pub fn new(motion: &MotionConfig) -> Self {
        Self {
            listeners: Listeners::default(),
            pipeline: MotionPipeline::new(StepSourceKind::External, motion),
        }
    }
}

impl StepSource for ExternalStepSource {
    fn kind(&self) -> StepSourceKind {
        StepSourceKind::External
    }

    fn register_listener(&mut self) -> (ListenerId, Receiver<SensorEvent>) {
        self.listeners.register()
    }

    fn unregister_listener(&mut self, id: ListenerId) {
        self.listeners.unregister(id);
    }

    fn stop(&mut self) {
        self.listeners.stop();
    }

    fn feed(&mut self, input: SensorInput) -> Option<StepEvent> {
        let SensorInput::Accel { timestamp, x, y, z } = input else {
            tracing::trace!("external step source ignores step input");
            return None;
        };
        let sample = AccelSample::new(
            x * STANDARD_GRAVITY,
            y * STANDARD_GRAVITY,
            z * STANDARD_GRAVITY,
            timestamp.saturating_mul(NS_PER_MS),
        );
        let step = self.pipeline.process(sample)?;
        self.listeners.emit(SensorEvent::Step(step));
        Some(step)
    }
}

/// Device accelerometer (m/s², nanoseconds).
pub struct AccelerometerStepSource {
    listeners: Listeners,
    pipeline: MotionPipeline,
}

impl AccelerometerStepSource {
    pub fn new(motion: &MotionConfig) -> Self {
        Self {
            listeners: Listeners::default(),
            pipeline: MotionPipeline::new(StepSourceKind::Accelerometer, motion),
        }
    }
}

impl StepSource for AccelerometerStepSource {
    fn kind(&self) -> StepSourceKind {
        StepSourceKind::Accelerometer
    }

    fn register_listener(&mut self) -> (ListenerId, Receiver<SensorEvent>) {
        self.listeners.register()
    }

    fn unregister_listener(&mut self, id: ListenerId) {
        self.listeners.unregister(id);
    }

    fn stop(&mut self) {
        self.listeners.stop();
    }

    fn feed(&mut self, input: SensorInput) -> Option<StepEvent> {
        let SensorInput::Accel { timestamp, x, y, z } = input else {
            tracing::trace!("accelerometer step source ignores step input");
            return None;
        };
        let step = self.pipeline.process(AccelSample::new(x, y, z, timestamp))?;
        self.listeners.emit(SensorEvent::Step(step));
        Some(step)
    }
}
