//! Runner sessions.
//!
//! Indexes a library, opens the output sink, starts the engine and feeds it
//! sensor input in real time until the input ends or Ctrl-C is pressed.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use cadence_engine::config::{BYTES_PER_FRAME, buffer_frames};
use cadence_engine::decode::FileVariantLoader;
use cadence_engine::library::TrackLibrary;
use cadence_engine::playback::{self, CpalSink};
use cadence_engine::step_source::{SensorInput, StepSourceKind};
use cadence_engine::{EngineCommand, EngineHandle, PlaybackController, StepPipeline, spawn_engine};
use cadence_types::{EngineEvent, PlaybackState};
use crossbeam_channel::Receiver;

use crate::config::RunnerConfig;
use crate::sensor_log::{load_sensor_log, timestamp_of, timestamp_unit_ns};

const STOP_POLL: Duration = Duration::from_millis(50);

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    playback::list_output_devices()
}

/// Replay a recorded sensor log against `library`.
pub fn run_play(config: &RunnerConfig, library: &Path, input: &Path, source: StepSourceKind) -> Result<()> {
    let inputs = load_sensor_log(input, source)?;
    if inputs.is_empty() {
        bail!("sensor log {:?} has no readings", input);
    }
    tracing::info!(readings = inputs.len(), ?source, "sensor log loaded");

    let offsets = replay_offsets(&inputs, timestamp_unit_ns(source));
    let session = Session::start(config, library, source)?;
    for (reading, offset) in inputs.into_iter().zip(offsets) {
        if !session.wait_until(offset) {
            break;
        }
        session.engine.send(EngineCommand::Sensor(reading))?;
    }
    session.finish()
}

/// Drive `library` with a synthetic step train at `spm` for `seconds`.
pub fn run_simulate(config: &RunnerConfig, library: &Path, spm: f64, seconds: f64) -> Result<()> {
    let timestamps = step_train(spm, seconds)?;
    tracing::info!(spm, seconds, steps = timestamps.len(), "simulating step train");

    let session = Session::start(config, library, StepSourceKind::Inbuilt)?;
    for timestamp in timestamps {
        let offset = Duration::from_nanos(timestamp.max(0) as u64);
        if !session.wait_until(offset) {
            break;
        }
        session.engine.send(EngineCommand::Sensor(SensorInput::Step { timestamp }))?;
    }
    session.finish()
}

/// Delay of each reading from the first, in wall-clock time.
pub fn replay_offsets(inputs: &[SensorInput], unit_ns: i64) -> Vec<Duration> {
    let Some(first) = inputs.first().map(timestamp_of) else {
        return Vec::new();
    };
    inputs
        .iter()
        .map(|input| {
            let ns = timestamp_of(input).saturating_sub(first).saturating_mul(unit_ns);
            Duration::from_nanos(ns.max(0) as u64)
        })
        .collect()
}

/// Step timestamps (ns from zero) of a clean train at `spm` lasting `seconds`.
pub fn step_train(spm: f64, seconds: f64) -> Result<Vec<i64>> {
    if !spm.is_finite() || spm <= 0.0 {
        bail!("steps per minute must be positive, got {spm}");
    }
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("duration must be positive, got {seconds}");
    }
    let period_ns = 60_000_000_000.0 / spm;
    let steps = (seconds * spm / 60.0).floor() as usize + 1;
    Ok((0..steps).map(|i| (i as f64 * period_ns).round() as i64).collect())
}

/// One line of output for `event`.
pub fn format_event(event: &EngineEvent, json: bool) -> Result<String> {
    if json {
        return serde_json::to_string(event).context("serialize event");
    }
    Ok(match event {
        EngineEvent::CadenceUpdated(update) => format!(
            "cadence {:.1} spm ({} steps)",
            update.steps_per_minute, update.total_steps
        ),
        EngineEvent::PlaybackStateChanged(state) => describe_state(state),
    })
}

fn describe_state(state: &PlaybackState) -> String {
    if state.is_loading {
        return "loading next track...".to_string();
    }
    let Some(track) = state.track_name.as_deref() else {
        return "idle".to_string();
    };
    let verb = if state.is_paused { "paused" } else { "playing" };
    match (state.variant, state.track_bpm) {
        (Some(variant), Some(bpm)) => format!("{verb} {track} [{variant:?} @ {bpm} bpm]"),
        _ => format!("{verb} {track}"),
    }
}

struct Session {
    engine: EngineHandle,
    controller: Arc<PlaybackController>,
    printer: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    started: Instant,
}

impl Session {
    fn start(config: &RunnerConfig, library_path: &Path, source: StepSourceKind) -> Result<Self> {
        let library = TrackLibrary::scan_dir(library_path)?;
        if library.is_empty() {
            bail!("no complete variant sets found in {:?}", library_path);
        }
        tracing::info!(sets = library.len(), bpms = ?library.bpms().collect::<Vec<_>>(), "library indexed");

        let playback = &config.engine.playback;
        let (notify_tx, notify_rx) = crossbeam_channel::bounded(4);
        let sink = CpalSink::open(config.device.as_deref(), playback, notify_tx)?;
        let rate = sink.info().sample_rate;
        let loader = FileVariantLoader::new(rate, playback);
        let buffer_bytes = buffer_frames(rate, playback.buffer_seconds) * BYTES_PER_FRAME;

        let controller = Arc::new(PlaybackController::new(
            library,
            Arc::new(loader),
            Box::new(sink),
            config.engine.controller.clone(),
            buffer_bytes,
        ));
        let printer = spawn_event_printer(controller.subscribe(), config.json)?;
        let pipeline = StepPipeline::new(source, &config.engine);
        let engine = spawn_engine(controller.clone(), pipeline, notify_rx)?;

        let stop = Arc::new(AtomicBool::new(false));
        {
            let stop = stop.clone();
            ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
                .context("install Ctrl-C handler")?;
        }

        Ok(Self {
            engine,
            controller,
            printer,
            stop,
            started: Instant::now(),
        })
    }

    /// Sleep until `offset` after the session started. `false` once stopped.
    fn wait_until(&self, offset: Duration) -> bool {
        let deadline = self.started + offset;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(STOP_POLL));
        }
    }

    fn finish(self) -> Result<()> {
        if self.stop.load(Ordering::SeqCst) {
            tracing::info!("interrupted");
        }
        let final_state = self.controller.state();
        tracing::info!(track = ?final_state.track_name, "session finished");

        self.engine.shutdown()?;
        drop(self.controller);
        self.printer
            .join()
            .map_err(|_| anyhow!("event printer panicked"))
    }
}

fn spawn_event_printer(events: Receiver<EngineEvent>, json: bool) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("cadence-events".to_string())
        .spawn(move || {
            for event in events.iter() {
                match format_event(&event, json) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!("event output failed: {e:#}"),
                }
            }
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::{CadenceUpdate, VariantLabel};

    #[test]
    fn replay_offsets_are_relative_to_first_reading() {
        let inputs = [
            SensorInput::Step { timestamp: 5_000 },
            SensorInput::Step { timestamp: 5_600 },
            SensorInput::Step { timestamp: 4_000 },
        ];
        let offsets = replay_offsets(&inputs, 1_000_000);
        assert_eq!(
            offsets,
            vec![Duration::ZERO, Duration::from_millis(600), Duration::ZERO]
        );
        assert!(replay_offsets(&[], 1).is_empty());
    }

    #[test]
    fn step_train_covers_the_requested_duration() {
        let train = step_train(120.0, 2.0).unwrap();
        assert_eq!(train, vec![0, 500_000_000, 1_000_000_000, 1_500_000_000, 2_000_000_000]);
        assert!(step_train(0.0, 10.0).is_err());
        assert!(step_train(160.0, f64::NAN).is_err());
    }

    #[test]
    fn json_lines_carry_the_event_kind() {
        let line = format_event(
            &EngineEvent::CadenceUpdated(CadenceUpdate {
                steps_per_minute: 162.5,
                total_steps: 40,
            }),
            true,
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["kind"], "cadence_updated");
        assert_eq!(value["total_steps"], 40);
    }

    #[test]
    fn human_lines_describe_playback() {
        let mut state = PlaybackState {
            track_name: Some("Morning Run".to_string()),
            track_bpm: Some(160),
            variant: Some(VariantLabel::Fast),
            sink_session_id: Some(3),
            is_paused: false,
            is_loading: false,
        };
        let line = |s: &PlaybackState| format_event(&EngineEvent::PlaybackStateChanged(s.clone()), false).unwrap();
        assert_eq!(line(&state), "playing Morning Run [Fast @ 160 bpm]");
        state.is_paused = true;
        assert!(line(&state).starts_with("paused"));
        state.is_loading = true;
        assert_eq!(line(&state), "loading next track...");
        assert_eq!(line(&PlaybackState::default()), "idle");
    }
}
