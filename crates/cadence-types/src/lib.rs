use serde::{Deserialize, Serialize};

/// Which pre-rendered tempo variant of a track is meant.
///
/// Declaration order is the stable iteration order used for tie-breaks.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum VariantLabel {
    /// Rendered below the source tempo.
    Slow,
    /// The source track as recorded.
    Original,
    /// Rendered above the source tempo.
    Fast,
}

impl VariantLabel {
    /// All labels in iteration order.
    pub const ALL: [VariantLabel; 3] = [VariantLabel::Slow, VariantLabel::Original, VariantLabel::Fast];

    /// Parse the label used in library file names (`slow`, `original`, `fast`).
    pub fn from_file_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "slow" => Some(VariantLabel::Slow),
            "original" | "orig" => Some(VariantLabel::Original),
            "fast" => Some(VariantLabel::Fast),
            _ => None,
        }
    }
}

/// Playback snapshot exposed to observers (UI, logs).
///
/// Re-emitted on every state-affecting transition of the playback controller.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybackState {
    /// Display name of the track currently playing.
    pub track_name: Option<String>,
    /// Intrinsic BPM of the variant currently playing.
    pub track_bpm: Option<i32>,
    /// Which variant of the set is playing.
    pub variant: Option<VariantLabel>,
    /// Identifier of the audio sink session.
    pub sink_session_id: Option<i32>,
    /// `true` when the sink is paused (not merely idle).
    pub is_paused: bool,
    /// `true` while a variant set is being decoded.
    pub is_loading: bool,
}

/// Cadence estimate published after an accepted step.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct CadenceUpdate {
    pub steps_per_minute: f64,
    /// Every step reported by the sensor so far, including rejected ones.
    pub total_steps: u64,
}

/// Events published by the engine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    CadenceUpdated(CadenceUpdate),
    PlaybackStateChanged(PlaybackState),
}

/// Control inputs accepted by the engine.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    /// Re-emit the current [`PlaybackState`].
    RequestState,
    /// Resume from pause.
    Play,
    /// Pause without discarding queued audio.
    Pause,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_label_parses_file_tokens() {
        assert_eq!(VariantLabel::from_file_token("SLOW"), Some(VariantLabel::Slow));
        assert_eq!(VariantLabel::from_file_token("orig"), Some(VariantLabel::Original));
        assert_eq!(VariantLabel::from_file_token("fast"), Some(VariantLabel::Fast));
        assert_eq!(VariantLabel::from_file_token("medium"), None);
    }

    #[test]
    fn engine_event_is_tagged_by_kind() {
        let event = EngineEvent::PlaybackStateChanged(PlaybackState {
            track_name: Some("Morning Run".to_string()),
            track_bpm: Some(120),
            variant: Some(VariantLabel::Original),
            sink_session_id: Some(1),
            is_paused: false,
            is_loading: false,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "playback_state_changed");
        assert_eq!(json["track_bpm"], 120);
        assert_eq!(json["variant"], "original");
    }
}
