//! Decoded tempo variants and the slow/original/fast set they belong to.

use std::sync::Arc;

use cadence_types::VariantLabel;

use crate::error::{EngineError, EngineResult};

/// One decoded tempo rendering of a track.
///
/// `pcm` is interleaved stereo 16-bit little-endian audio, shared immutably.
#[derive(Clone, Debug)]
pub struct TempoVariant {
    pub name: String,
    pub label: VariantLabel,
    pub bpm: i32,
    pub pcm: Arc<[u8]>,
}

impl TempoVariant {
    pub fn new(name: impl Into<String>, label: VariantLabel, bpm: i32, pcm: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            label,
            bpm,
            pcm: pcm.into(),
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.pcm.len()
    }

    /// Tempo mismatch against a cadence, allowing half/double-time matches.
    pub fn distance(&self, bpm: i32) -> i32 {
        tempo_distance(self.bpm, bpm)
    }
}

/// `min(|variant - bpm|, |variant - 2 * bpm|)`.
pub fn tempo_distance(variant_bpm: i32, bpm: i32) -> i32 {
    let single = (variant_bpm - bpm).abs();
    let double = (variant_bpm - bpm.saturating_mul(2)).abs();
    single.min(double)
}

/// The three tempo variants of one source track.
#[derive(Clone, Debug)]
pub struct TempoVariantSet {
    slow: TempoVariant,
    original: TempoVariant,
    fast: TempoVariant,
}

impl TempoVariantSet {
    /// Build a set; BPMs must satisfy `slow < original < fast`.
    pub fn new(slow: TempoVariant, original: TempoVariant, fast: TempoVariant) -> EngineResult<Self> {
        if !(slow.bpm < original.bpm && original.bpm < fast.bpm) {
            return Err(EngineError::InvalidVariantSet {
                track: original.name.clone(),
                slow: slow.bpm,
                original: original.bpm,
                fast: fast.bpm,
            });
        }
        Ok(Self { slow, original, fast })
    }

    pub fn name(&self) -> &str {
        &self.original.name
    }

    pub fn original(&self) -> &TempoVariant {
        &self.original
    }

    pub fn get(&self, label: VariantLabel) -> &TempoVariant {
        match label {
            VariantLabel::Slow => &self.slow,
            VariantLabel::Original => &self.original,
            VariantLabel::Fast => &self.fast,
        }
    }

    /// Variants in slow, original, fast order.
    pub fn iter(&self) -> impl Iterator<Item = &TempoVariant> {
        VariantLabel::ALL.into_iter().map(move |label| self.get(label))
    }

    /// Mean BPM gap between neighbouring variants (integer division).
    pub fn average_gap(&self) -> i32 {
        (self.fast.bpm - self.slow.bpm) / 2
    }

    /// Variant closest to `bpm`; ties go to the earliest in slow/original/fast order.
    pub fn closest(&self, bpm: i32) -> &TempoVariant {
        let mut best = &self.slow;
        for variant in self.iter().skip(1) {
            if variant.distance(bpm) < best.distance(bpm) {
                best = variant;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(slow: i32, original: i32, fast: i32) -> TempoVariantSet {
        TempoVariantSet::new(
            TempoVariant::new("Song", VariantLabel::Slow, slow, vec![0u8; 4]),
            TempoVariant::new("Song", VariantLabel::Original, original, vec![0u8; 4]),
            TempoVariant::new("Song", VariantLabel::Fast, fast, vec![0u8; 4]),
        )
        .unwrap()
    }

    #[test]
    fn closest_prefers_fast_for_150() {
        let s = set(80, 120, 160);
        let closest = s.closest(150);
        assert_eq!(closest.label, VariantLabel::Fast);
        assert_eq!(closest.distance(150), 10);
        assert_eq!(s.original().distance(150), 30);
    }

    #[test]
    fn closest_uses_double_time_match() {
        let s = set(80, 90, 100);
        // 45 spm matches 90 bpm at double time.
        assert_eq!(s.closest(45).label, VariantLabel::Original);
    }

    #[test]
    fn ties_resolve_to_earliest_variant() {
        let s = set(80, 120, 160);
        // |80 - 100| == |120 - 100|
        assert_eq!(s.closest(100).label, VariantLabel::Slow);
        assert_eq!(s.closest(140).label, VariantLabel::Original);
    }

    #[test]
    fn average_gap_is_half_the_span() {
        assert_eq!(set(80, 120, 160).average_gap(), 40);
        assert_eq!(set(100, 110, 125).average_gap(), 12);
    }

    #[test]
    fn rejects_non_monotonic_bpms() {
        let err = TempoVariantSet::new(
            TempoVariant::new("Song", VariantLabel::Slow, 120, Vec::<u8>::new()),
            TempoVariant::new("Song", VariantLabel::Original, 120, Vec::<u8>::new()),
            TempoVariant::new("Song", VariantLabel::Fast, 160, Vec::<u8>::new()),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidVariantSet { .. }));
    }

    #[test]
    fn get_and_iter_follow_label_order() {
        let s = set(80, 120, 160);
        let bpms: Vec<i32> = s.iter().map(|v| v.bpm).collect();
        assert_eq!(bpms, vec![80, 120, 160]);
        assert_eq!(s.get(VariantLabel::Fast).bpm, 160);
    }
}
