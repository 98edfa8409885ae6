//! In-process event fan-out for observers (UI, logs, the runner).

use std::sync::{Mutex, PoisonError};

use cadence_types::{CadenceUpdate, EngineEvent, PlaybackState};
use crossbeam_channel::{Receiver, Sender};

/// Delivers every [`EngineEvent`] to all live subscribers, in publish order.
#[derive(Debug, Default)]
pub struct EventBroadcaster {
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the event stream. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Notify subscribers that playback state changed.
    pub fn playback_state_changed(&self, state: PlaybackState) {
        tracing::debug!(
            track = ?state.track_name,
            bpm = ?state.track_bpm,
            variant = ?state.variant,
            paused = state.is_paused,
            loading = state.is_loading,
            "playback state changed"
        );
        self.publish(EngineEvent::PlaybackStateChanged(state));
    }

    /// Notify subscribers about a new cadence estimate.
    pub fn cadence_updated(&self, update: CadenceUpdate) {
        self.publish(EngineEvent::CadenceUpdated(update));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_events_in_order() {
        let events = EventBroadcaster::new();
        let a = events.subscribe();
        let b = events.subscribe();
        events.cadence_updated(CadenceUpdate {
            steps_per_minute: 100.0,
            total_steps: 11,
        });
        events.playback_state_changed(PlaybackState::default());

        for rx in [a, b] {
            let got: Vec<EngineEvent> = rx.try_iter().collect();
            assert_eq!(got.len(), 2);
            assert!(matches!(got[0], EngineEvent::CadenceUpdated(_)));
            assert!(matches!(got[1], EngineEvent::PlaybackStateChanged(_)));
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let events = EventBroadcaster::new();
        let keep = events.subscribe();
        drop(events.subscribe());
        events.playback_state_changed(PlaybackState::default());
        assert_eq!(events.subscriber_count(), 1);
        assert_eq!(keep.try_iter().count(), 1);
    }
}
