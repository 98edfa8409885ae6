//! Playback controller: the switch-or-continue state machine.
//!
//! Owns the current variant set, the variant playing from it and the write
//! cursor. Two paths mutate that state under one [`PrioLock`]:
//! - cadence updates and pause/resume take the lock with priority
//! - the sink's periodic notification takes it with ordinary priority
//!
//! Variant-set loads run while the lock is held. An atomic mirror of
//! `is_loading` lets priority callers return early instead of queueing behind a
//! decode. Every change to the set, the variant or `is_loading` goes through
//! [`PlaybackController::commit`], which broadcasts the new [`PlaybackState`]
//! and keeps a copy that state requests answer from without taking the lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use cadence_types::{ControlCommand, EngineEvent, PlaybackState, VariantLabel};
use crossbeam_channel::Receiver;

use crate::config::ControllerConfig;
use crate::error::{EngineError, EngineResult};
use crate::library::{TrackLibrary, VariantLoader};
use crate::playback::PcmSink;
use crate::prio_lock::PrioLock;
use crate::scheduler::{PlaybackCursor, StreamingBufferScheduler, align_to_frame};
use crate::status::EventBroadcaster;
use crate::variant::{TempoVariant, TempoVariantSet};

/// Buffers written when a set starts or playback resumes.
const START_BUFFERS: usize = 2;

/// What a cadence update did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CadenceDecision {
    /// Debounced, loading, or not a usable cadence.
    Ignored,
    /// Nothing was loaded; the first set started.
    Started,
    /// The mismatch warranted a different set.
    SetChanged,
    /// The closest variant is already playing.
    Unchanged,
    /// Switched tempo variant within the current set.
    VariantSwitched { from: VariantLabel, to: VariantLabel },
}

enum StateChange {
    Loading(bool),
    Set { set: TempoVariantSet, label: VariantLabel },
    Variant(VariantLabel),
    Transport,
}

struct ControllerState {
    library: TrackLibrary,
    sink: Box<dyn PcmSink>,
    current_set: Option<TempoVariantSet>,
    current: Option<VariantLabel>,
    cursor: PlaybackCursor,
    is_loading: bool,
    last_cadence_update: Option<Instant>,
    last_set_change: Option<Instant>,
}

impl ControllerState {
    fn current_variant(&self) -> Option<&TempoVariant> {
        let set = self.current_set.as_ref()?;
        Some(set.get(self.current?))
    }

    fn snapshot(&self) -> PlaybackState {
        let variant = self.current_variant();
        PlaybackState {
            track_name: self.current_set.as_ref().map(|s| s.name().to_string()),
            track_bpm: variant.map(|v| v.bpm),
            variant: variant.map(|v| v.label),
            sink_session_id: Some(self.sink.session_id()),
            is_paused: self.sink.is_paused(),
            is_loading: self.is_loading,
        }
    }

    fn write_buffers(&mut self, scheduler: &StreamingBufferScheduler, count: usize) -> usize {
        let (Some(set), Some(label)) = (self.current_set.as_ref(), self.current) else {
            return 0;
        };
        scheduler.write_next_buffers(set.get(label), &mut self.cursor, self.sink.as_mut(), count)
    }
}

pub struct PlaybackController {
    state: PrioLock<ControllerState>,
    loader: Arc<dyn VariantLoader>,
    config: ControllerConfig,
    scheduler: StreamingBufferScheduler,
    loading: AtomicBool,
    published: Mutex<PlaybackState>,
    events: Arc<EventBroadcaster>,
}

impl PlaybackController {
    /// `buffer_bytes` is the scheduler chunk size at the sink's stream rate.
    pub fn new(
        library: TrackLibrary,
        loader: Arc<dyn VariantLoader>,
        sink: Box<dyn PcmSink>,
        config: ControllerConfig,
        buffer_bytes: usize,
    ) -> Self {
        let state = ControllerState {
            library,
            sink,
            current_set: None,
            current: None,
            cursor: PlaybackCursor::default(),
            is_loading: false,
            last_cadence_update: None,
            last_set_change: None,
        };
        let published = Mutex::new(state.snapshot());
        Self {
            state: PrioLock::new(state),
            loader,
            config,
            scheduler: StreamingBufferScheduler::new(buffer_bytes),
            loading: AtomicBool::new(false),
            published,
            events: Arc::new(EventBroadcaster::new()),
        }
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    /// Current snapshot, without broadcasting it.
    pub fn state(&self) -> PlaybackState {
        self.state.lock().snapshot()
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.state.lock().cursor
    }

    pub fn on_cadence_updated(&self, steps_per_minute: f64) -> EngineResult<CadenceDecision> {
        self.on_cadence_updated_at(steps_per_minute, Instant::now())
    }

    /// Apply a cadence update observed at `now`.
    pub fn on_cadence_updated_at(&self, steps_per_minute: f64, now: Instant) -> EngineResult<CadenceDecision> {
        if self.is_loading() {
            tracing::debug!(steps_per_minute, "cadence update ignored while loading");
            return Ok(CadenceDecision::Ignored);
        }
        if !steps_per_minute.is_finite() || steps_per_minute < 1.0 {
            tracing::debug!(steps_per_minute, "cadence update ignored: not a usable cadence");
            return Ok(CadenceDecision::Ignored);
        }

        let mut guard = self.state.lock_priority();
        let state = &mut *guard;
        if state.is_loading {
            return Ok(CadenceDecision::Ignored);
        }
        if let Some(last) = state.last_cadence_update {
            if now.saturating_duration_since(last) < self.config.min_cadence_interval {
                tracing::trace!(steps_per_minute, "cadence update debounced");
                return Ok(CadenceDecision::Ignored);
            }
        }
        state.last_cadence_update = Some(now);
        let bpm = steps_per_minute.round() as i32;

        let Some(set) = state.current_set.as_ref() else {
            self.load_set_for(state, bpm, now)?;
            return Ok(CadenceDecision::Started);
        };

        let closest = set.closest(bpm);
        let target = closest.label;
        let target_bpm = closest.bpm;
        let distance = closest.distance(bpm);
        let threshold = set.average_gap() as f64 * self.config.set_change_threshold_factor;
        let set_bpm = set.original().bpm;
        let interval_elapsed = state
            .last_set_change
            .is_none_or(|t| now.saturating_duration_since(t) >= self.config.min_set_change_interval);
        let best_fit = state.library.best_fit_bpm(bpm);
        let better_set_exists = best_fit.is_some_and(|b| b != set_bpm);

        tracing::debug!(
            bpm,
            closest = ?target,
            distance,
            threshold,
            interval_elapsed,
            best_fit = ?best_fit,
            set_bpm,
            "cadence decision"
        );

        if distance as f64 > threshold && interval_elapsed && better_set_exists {
            self.load_set_for(state, bpm, now)?;
            return Ok(CadenceDecision::SetChanged);
        }

        let Some(from) = state.current else {
            return Err(EngineError::NotLoaded);
        };
        if from == target {
            return Ok(CadenceDecision::Unchanged);
        }

        let from_bpm = set.get(from).bpm;
        state.cursor.rescale(from_bpm, target_bpm);
        self.commit(state, StateChange::Variant(target));
        tracing::info!(
            bpm,
            from = ?from,
            to = ?target,
            from_bpm,
            to_bpm = target_bpm,
            write_index = state.cursor.write_index,
            "tempo variant switched"
        );
        Ok(CadenceDecision::VariantSwitched { from, to: target })
    }

    pub fn on_sink_periodic_notification(&self) -> EngineResult<usize> {
        self.on_sink_periodic_notification_at(Instant::now())
    }

    /// Top up the sink; moves to the next set when the current variant is exhausted.
    ///
    /// Returns the bytes written.
    pub fn on_sink_periodic_notification_at(&self, now: Instant) -> EngineResult<usize> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.is_loading {
            return Ok(0);
        }
        let Some(variant) = state.current_variant() else {
            return Err(EngineError::NotLoaded);
        };

        if self.scheduler.remaining(variant, &state.cursor) == 0 {
            let bpm = variant.bpm;
            tracing::info!(track = %variant.name, bpm, "variant exhausted; loading next set");
            return self.load_set_for(state, bpm, now);
        }
        if !self.scheduler.needs_refill(&state.cursor, state.sink.as_ref()) {
            return Ok(0);
        }
        Ok(state.write_buffers(&self.scheduler, 1))
    }

    /// Pause the sink, keeping queued audio. Returns `false` when nothing changed.
    pub fn pause(&self) -> EngineResult<bool> {
        if self.is_loading() {
            return Ok(false);
        }
        let mut guard = self.state.lock_priority();
        let state = &mut *guard;
        if state.is_loading || !state.sink.is_playing() {
            return Ok(false);
        }
        state.sink.pause()?;
        self.commit(state, StateChange::Transport);
        tracing::info!(write_index = state.cursor.write_index, "playback paused");
        Ok(true)
    }

    /// Restart a paused sink from the first unplayed byte.
    ///
    /// Returns `false` when the sink was not paused.
    pub fn resume(&self) -> EngineResult<bool> {
        if self.is_loading() {
            return Ok(false);
        }
        let mut guard = self.state.lock_priority();
        let state = &mut *guard;
        if state.is_loading || !state.sink.is_paused() {
            return Ok(false);
        }
        if state.current_set.is_none() {
            return Err(EngineError::NotLoaded);
        }

        let unplayed = self.scheduler.unplayed_bytes(&state.cursor, state.sink.as_ref());
        state.cursor.write_index = align_to_frame(state.cursor.write_index.saturating_sub(unplayed));
        state.sink.flush();
        state.cursor.sink_index = 0;
        let written = state.write_buffers(&self.scheduler, START_BUFFERS);
        state.sink.play()?;
        self.commit(state, StateChange::Transport);
        tracing::info!(rewound = unplayed, written, "playback resumed");
        Ok(true)
    }

    /// Re-broadcast and return the last committed state. Answers during a load.
    pub fn request_state(&self) -> PlaybackState {
        let snapshot = self.published().clone();
        self.events.playback_state_changed(snapshot.clone());
        snapshot
    }

    fn published(&self) -> MutexGuard<'_, PlaybackState> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn handle_command(&self, command: ControlCommand) -> EngineResult<()> {
        match command {
            ControlCommand::RequestState => {
                self.request_state();
            }
            ControlCommand::Play => {
                self.resume()?;
            }
            ControlCommand::Pause => {
                self.pause()?;
            }
        }
        Ok(())
    }

    /// Select, decode and start the set for `bpm`. The lock stays held throughout.
    ///
    /// On failure nothing is committed except clearing `is_loading`.
    fn load_set_for(&self, state: &mut ControllerState, bpm: i32, now: Instant) -> EngineResult<usize> {
        let descriptor = state.library.select_variant_set(bpm)?;
        tracing::info!(
            bpm,
            track = %descriptor.name,
            set_bpm = descriptor.original_bpm(),
            "loading variant set"
        );

        self.commit(state, StateChange::Loading(true));
        let started = Instant::now();
        let set = match self.loader.load_set(&descriptor) {
            Ok(set) => set,
            Err(e) => {
                self.commit(state, StateChange::Loading(false));
                return Err(e);
            }
        };

        let label = set.closest(bpm).label;
        let was_paused = state.sink.is_paused();
        state.sink.flush();
        state.cursor.reset();
        state.last_set_change = Some(now);
        self.commit(state, StateChange::Set { set, label });
        self.commit(state, StateChange::Loading(false));

        let written = state.write_buffers(&self.scheduler, START_BUFFERS);
        if !was_paused {
            if let Err(e) = state.sink.play() {
                tracing::warn!("sink failed to start: {e}");
            }
        }
        tracing::info!(
            track = %descriptor.name,
            variant = ?label,
            elapsed_ms = started.elapsed().as_millis() as u64,
            written,
            "variant set started"
        );
        Ok(written)
    }

    fn commit(&self, state: &mut ControllerState, change: StateChange) {
        match change {
            StateChange::Loading(loading) => {
                state.is_loading = loading;
                self.loading.store(loading, Ordering::Release);
            }
            StateChange::Set { set, label } => {
                state.current_set = Some(set);
                state.current = Some(label);
            }
            StateChange::Variant(label) => state.current = Some(label),
            StateChange::Transport => {}
        }
        let snapshot = state.snapshot();
        *self.published() = snapshot.clone();
        self.events.playback_state_changed(snapshot);
    }
}
