//! Cadence-adaptive playback engine.
//!
//! Sensor readings become steps, steps become a cadence estimate, and the
//! [`controller::PlaybackController`] keeps the closest tempo variant of a
//! track streaming into a [`playback::PcmSink`].

pub mod cadence;
pub mod config;
pub mod controller;
pub mod decode;
pub mod device;
pub mod error;
pub mod library;
pub mod motion;
pub mod pipeline;
pub mod playback;
pub mod prio_lock;
pub mod queue;
pub mod resample;
pub mod scheduler;
pub mod status;
pub mod step;
pub mod step_source;
pub mod variant;

pub use controller::{CadenceDecision, PlaybackController};
pub use error::{EngineError, EngineResult};
pub use pipeline::{EngineCommand, EngineHandle, StepPipeline, spawn_engine};
