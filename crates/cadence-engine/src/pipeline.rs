//! Engine wiring: sensor input to cadence to the playback controller.
//!
//! Two worker threads drive a [`PlaybackController`]:
//! - `cadence-control` owns the [`StepPipeline`] and applies sensor input,
//!   cadence updates and control commands (priority lock path)
//! - `cadence-refill` reacts to the sink's periodic notifications (ordinary
//!   lock path)

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Result, anyhow};
use cadence_types::{CadenceUpdate, ControlCommand};
use crossbeam_channel::{Receiver, Sender};

use crate::cadence::{CadenceEstimator, StepOutcome};
use crate::config::EngineConfig;
use crate::controller::{CadenceDecision, PlaybackController};
use crate::error::EngineError;
use crate::playback::SinkNotification;
use crate::step_source::{SensorInput, StepSource, StepSourceKind, build_step_source};

/// Step source feeding a cadence estimator.
pub struct StepPipeline {
    source: Box<dyn StepSource>,
    estimator: CadenceEstimator,
}

impl StepPipeline {
    pub fn new(kind: StepSourceKind, config: &EngineConfig) -> Self {
        Self {
            source: build_step_source(kind, &config.motion),
            estimator: CadenceEstimator::new(config.cadence.clone()),
        }
    }

    pub fn kind(&self) -> StepSourceKind {
        self.source.kind()
    }

    /// Feed one raw reading; returns the new cadence when a step was accepted on a warm ring.
    pub fn push(&mut self, input: SensorInput) -> Option<CadenceUpdate> {
        let step = self.source.feed(input)?;
        match self.estimator.on_step(step) {
            StepOutcome::Accepted(Some(steps_per_minute)) => Some(CadenceUpdate {
                steps_per_minute,
                total_steps: self.estimator.total_steps(),
            }),
            StepOutcome::Accepted(None) | StepOutcome::Rejected { .. } => None,
        }
    }

    pub fn current(&self) -> Option<CadenceUpdate> {
        self.estimator.current()
    }

    pub fn total_steps(&self) -> u64 {
        self.estimator.total_steps()
    }

    pub fn stop(&mut self) {
        self.source.stop();
    }
}

/// Input accepted by the control thread.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EngineCommand {
    /// Raw reading for the step source.
    Sensor(SensorInput),
    /// Cadence computed elsewhere; bypasses the step pipeline.
    Cadence(CadenceUpdate),
    Control(ControlCommand),
    Shutdown,
}

/// Running engine threads.
pub struct EngineHandle {
    commands: Sender<EngineCommand>,
    stop_refill: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn sender(&self) -> Sender<EngineCommand> {
        self.commands.clone()
    }

    pub fn send(&self, command: EngineCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("engine control thread has exited"))
    }

    /// Stop both threads and wait for them.
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.commands.send(EngineCommand::Shutdown);
        self.stop_refill.take();
        for handle in self.threads.drain(..) {
            handle
                .join()
                .map_err(|_| anyhow!("engine thread panicked"))?;
        }
        tracing::info!("engine stopped");
        Ok(())
    }
}

/// Start the control and refill threads around `controller`.
///
/// `sink_notifications` carries the periodic callbacks of the sink the
/// controller writes to; notifications from other sessions are dropped.
pub fn spawn_engine(
    controller: Arc<PlaybackController>,
    mut pipeline: StepPipeline,
    sink_notifications: Receiver<SinkNotification>,
) -> Result<EngineHandle> {
    let (commands_tx, commands_rx) = crossbeam_channel::unbounded::<EngineCommand>();
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

    let control = {
        let controller = controller.clone();
        thread::Builder::new()
            .name("cadence-control".to_string())
            .spawn(move || {
                tracing::info!(source = ?pipeline.kind(), "control thread started");
                for command in commands_rx.iter() {
                    match command {
                        EngineCommand::Sensor(input) => {
                            if let Some(update) = pipeline.push(input) {
                                apply_cadence(&controller, update);
                            }
                        }
                        EngineCommand::Cadence(update) => apply_cadence(&controller, update),
                        EngineCommand::Control(command) => {
                            if let Err(e) = controller.handle_command(command) {
                                tracing::warn!(?command, "control command failed: {e}");
                            }
                        }
                        EngineCommand::Shutdown => break,
                    }
                }
                pipeline.stop();
                tracing::info!(total_steps = pipeline.total_steps(), "control thread stopped");
            })?
    };

    let session_id = controller.state().sink_session_id;
    let refill = thread::Builder::new()
        .name("cadence-refill".to_string())
        .spawn(move || {
            loop {
                crossbeam_channel::select! {
                    recv(sink_notifications) -> msg => {
                        let Ok(notification) = msg else { break };
                        if session_id.is_some_and(|id| id != notification.session_id) {
                            tracing::trace!(session_id = notification.session_id, "stale sink notification");
                            continue;
                        }
                        match controller.on_sink_periodic_notification() {
                            Ok(_) => {}
                            Err(EngineError::NotLoaded) => tracing::debug!("refill skipped: nothing loaded"),
                            Err(e) => tracing::error!("sink refill failed: {e}"),
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
            tracing::debug!("refill thread stopped");
        })?;

    Ok(EngineHandle {
        commands: commands_tx,
        stop_refill: Some(stop_tx),
        threads: vec![control, refill],
    })
}

fn apply_cadence(controller: &PlaybackController, update: CadenceUpdate) {
    controller.events().cadence_updated(update);
    match controller.on_cadence_updated(update.steps_per_minute) {
        Ok(CadenceDecision::Ignored) => {}
        Ok(decision) => tracing::debug!(?decision, spm = update.steps_per_minute, "cadence applied"),
        Err(e) => tracing::error!(spm = update.steps_per_minute, "cadence update failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::library::{TrackLibrary, VariantDescriptor, VariantLoader, VariantSetDescriptor};
    use crate::playback::MemorySink;
    use crate::variant::TempoVariant;
    use cadence_types::{EngineEvent, PlaybackState, VariantLabel};
    use std::path::PathBuf;
    use std::time::Duration;

    const MS: i64 = 1_000_000;

    struct SilentLoader;

    impl VariantLoader for SilentLoader {
        fn load_variant(&self, name: &str, descriptor: &VariantDescriptor) -> anyhow::Result<TempoVariant> {
            Ok(TempoVariant::new(name, descriptor.label, descriptor.bpm, vec![0u8; 4_000]))
        }
    }

    fn library() -> TrackLibrary {
        let d = |label, bpm| VariantDescriptor {
            source: PathBuf::from(format!("run_{bpm}.wav")),
            label,
            bpm,
        };
        let mut lib = TrackLibrary::new();
        lib.add_set(
            VariantSetDescriptor::new(
                "Run",
                d(VariantLabel::Slow, 80),
                d(VariantLabel::Original, 100),
                d(VariantLabel::Fast, 120),
            )
            .unwrap(),
        );
        lib
    }

    fn wait_for_state(
        events: &Receiver<EngineEvent>,
        pred: impl Fn(&PlaybackState) -> bool,
    ) -> PlaybackState {
        loop {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                EngineEvent::PlaybackStateChanged(s) if pred(&s) => return s,
                _ => {}
            }
        }
    }

    #[test]
    fn pipeline_reports_cadence_once_ring_is_warm() {
        let mut pipeline = StepPipeline::new(StepSourceKind::Inbuilt, &EngineConfig::default());
        let updates: Vec<CadenceUpdate> = (0..11)
            .filter_map(|i| pipeline.push(SensorInput::Step { timestamp: i * 600 * MS }))
            .collect();

        // Ten slots: the tenth step warms the ring, the eleventh evicts the initial zero.
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].total_steps, 10);
        assert!((updates[1].steps_per_minute - 100.0).abs() < 1e-9);
        assert_eq!(pipeline.current(), Some(updates[1]));
    }

    #[test]
    fn inbuilt_pipeline_ignores_acceleration() {
        let mut pipeline = StepPipeline::new(StepSourceKind::Inbuilt, &EngineConfig::default());
        let accel = SensorInput::Accel {
            timestamp: 0,
            x: 0.0,
            y: 0.0,
            z: 9.81,
        };
        assert_eq!(pipeline.push(accel), None);
        assert_eq!(pipeline.total_steps(), 0);
    }

    #[test]
    fn engine_threads_apply_cadence_and_commands() {
        let controller = Arc::new(PlaybackController::new(
            library(),
            Arc::new(SilentLoader),
            Box::new(MemorySink::new(1 << 16)),
            ControllerConfig::default(),
            400,
        ));
        let events = controller.subscribe();
        let (notify_tx, notify_rx) = crossbeam_channel::unbounded();
        let pipeline = StepPipeline::new(StepSourceKind::Inbuilt, &EngineConfig::default());
        let engine = spawn_engine(controller.clone(), pipeline, notify_rx).unwrap();

        engine
            .send(EngineCommand::Cadence(CadenceUpdate {
                steps_per_minute: 101.0,
                total_steps: 12,
            }))
            .unwrap();
        let started = wait_for_state(&events, |s| s.track_name.is_some() && !s.is_loading);
        assert_eq!(started.track_bpm, Some(100));

        let session_id = started.sink_session_id.unwrap();
        notify_tx.send(SinkNotification { session_id }).unwrap();

        engine.send(EngineCommand::Control(ControlCommand::Pause)).unwrap();
        wait_for_state(&events, |s| s.is_paused);

        engine.shutdown().unwrap();
        assert!(controller.state().is_paused);
    }
}
