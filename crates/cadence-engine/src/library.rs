//! Variant-set index keyed by tempo, plus the loader seam that decodes sets.
//!
//! Sets are bucketed by the BPM of their original rendering. Selecting for a
//! cadence picks the bucket whose BPM best fits (single or double time) and
//! rotates through the sets in that bucket on repeated selections.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cadence_types::VariantLabel;

use crate::error::{EngineError, EngineResult};
use crate::variant::{TempoVariant, TempoVariantSet, tempo_distance};

/// Where one variant of a set lives and its intrinsic BPM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariantDescriptor {
    pub source: PathBuf,
    pub label: VariantLabel,
    pub bpm: i32,
}

/// The slow/original/fast resources of one source track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariantSetDescriptor {
    pub name: String,
    slow: VariantDescriptor,
    original: VariantDescriptor,
    fast: VariantDescriptor,
}

impl VariantSetDescriptor {
    pub fn new(
        name: impl Into<String>,
        slow: VariantDescriptor,
        original: VariantDescriptor,
        fast: VariantDescriptor,
    ) -> EngineResult<Self> {
        let name = name.into();
        if !(slow.bpm < original.bpm && original.bpm < fast.bpm) {
            return Err(EngineError::InvalidVariantSet {
                track: name,
                slow: slow.bpm,
                original: original.bpm,
                fast: fast.bpm,
            });
        }
        Ok(Self {
            name,
            slow,
            original,
            fast,
        })
    }

    pub fn original_bpm(&self) -> i32 {
        self.original.bpm
    }

    pub fn get(&self, label: VariantLabel) -> &VariantDescriptor {
        match label {
            VariantLabel::Slow => &self.slow,
            VariantLabel::Original => &self.original,
            VariantLabel::Fast => &self.fast,
        }
    }
}

/// Decodes library resources into PCM.
///
/// Loading may block for hundreds of milliseconds; implementations must not
/// touch controller state.
pub trait VariantLoader: Send + Sync {
    /// Decode one variant into interleaved stereo 16-bit little-endian PCM.
    fn load_variant(&self, name: &str, descriptor: &VariantDescriptor) -> Result<TempoVariant>;

    /// Decode all three variants. Nothing is returned unless every variant decoded.
    fn load_set(&self, descriptor: &VariantSetDescriptor) -> EngineResult<TempoVariantSet> {
        let load = |label| {
            self.load_variant(&descriptor.name, descriptor.get(label))
                .map_err(|source| EngineError::LoadFailed {
                    track: descriptor.name.clone(),
                    source,
                })
        };
        let slow = load(VariantLabel::Slow)?;
        let original = load(VariantLabel::Original)?;
        let fast = load(VariantLabel::Fast)?;
        TempoVariantSet::new(slow, original, fast)
    }
}

/// Tempo-indexed collection of variant sets with rotation state.
#[derive(Debug, Default)]
pub struct TrackLibrary {
    sets: BTreeMap<i32, Vec<VariantSetDescriptor>>,
    current_bpm: Option<i32>,
    current_track: usize,
}

impl TrackLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_set(&mut self, set: VariantSetDescriptor) {
        self.sets.entry(set.original_bpm()).or_default().push(set);
    }

    pub fn len(&self) -> usize {
        self.sets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Indexed original BPMs in ascending order.
    pub fn bpms(&self) -> impl Iterator<Item = i32> + '_ {
        self.sets.keys().copied()
    }

    /// Indexed BPM closest to `bpm` at single or double time; ties go to the lower BPM.
    pub fn best_fit_bpm(&self, bpm: i32) -> Option<i32> {
        let mut best: Option<(i32, i32)> = None;
        for key in self.sets.keys().copied() {
            let distance = tempo_distance(key, bpm);
            if best.is_none_or(|(_, d)| distance < d) {
                best = Some((key, distance));
            }
        }
        best.map(|(key, _)| key)
    }

    /// Next set to play for `bpm`.
    ///
    /// Staying in the bucket that is already playing advances to its next set;
    /// moving to a different bucket starts at its first set.
    pub fn select_variant_set(&mut self, bpm: i32) -> EngineResult<VariantSetDescriptor> {
        let best = self.best_fit_bpm(bpm).ok_or(EngineError::EmptyLibrary)?;
        let bucket = self.sets.get(&best).ok_or(EngineError::EmptyLibrary)?;

        if self.current_bpm == Some(best) {
            self.current_track = (self.current_track + 1) % bucket.len();
        } else {
            self.current_bpm = Some(best);
            self.current_track = 0;
        }
        let set = bucket[self.current_track].clone();
        tracing::debug!(
            bpm,
            bucket_bpm = best,
            track_no = self.current_track,
            track = %set.name,
            "variant set selected"
        );
        Ok(set)
    }

    /// Index the files under `root` (non-recursive) named
    /// `<song words>_<slow|original|fast>_<bpm>.<ext>`.
    ///
    /// Incomplete or non-monotonic sets are skipped with a warning.
    pub fn scan_dir(root: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(root).with_context(|| format!("read_dir {:?}", root))? {
            let entry = entry.context("read_dir entry")?;
            let path = entry.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut groups: BTreeMap<String, HashMap<VariantLabel, VariantDescriptor>> = BTreeMap::new();
        for path in paths {
            let ext = path
                .extension()
                .and_then(OsStr::to_str)
                .unwrap_or("")
                .to_ascii_lowercase();
            if !is_supported_extension(&ext) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(OsStr::to_str) else {
                continue;
            };
            let Some((song, label, bpm)) = parse_variant_file_name(stem) else {
                tracing::warn!(path = %path.display(), "skipping file without <song>_<variant>_<bpm> name");
                continue;
            };
            groups.entry(song).or_default().insert(
                label,
                VariantDescriptor {
                    source: path,
                    label,
                    bpm,
                },
            );
        }

        let mut library = Self::new();
        for (song, mut variants) in groups {
            let name = display_name(&song);
            let (Some(slow), Some(original), Some(fast)) = (
                variants.remove(&VariantLabel::Slow),
                variants.remove(&VariantLabel::Original),
                variants.remove(&VariantLabel::Fast),
            ) else {
                tracing::warn!(track = %name, "skipping incomplete variant set");
                continue;
            };
            match VariantSetDescriptor::new(name, slow, original, fast) {
                Ok(set) => library.add_set(set),
                Err(e) => tracing::warn!("skipping variant set: {e}"),
            }
        }

        tracing::info!(
            root = %root.display(),
            sets = library.len(),
            buckets = library.sets.len(),
            "track library scanned"
        );
        Ok(library)
    }
}

/// Split `<song words>_<label>_<bpm>` into a lowercase song key, label and BPM.
fn parse_variant_file_name(stem: &str) -> Option<(String, VariantLabel, i32)> {
    let mut tokens: Vec<&str> = stem.split('_').collect();
    if tokens.len() < 3 {
        return None;
    }
    let bpm = tokens.pop()?.parse::<i32>().ok().filter(|bpm| *bpm > 0)?;
    let label = VariantLabel::from_file_token(tokens.pop()?)?;
    if tokens.iter().any(|t| t.is_empty()) {
        return None;
    }
    Some((tokens.join("_").to_lowercase(), label, bpm))
}

/// `morning_run` -> `Morning Run`.
fn display_name(song: &str) -> String {
    song.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_supported_extension(ext: &str) -> bool {
    matches!(
        ext,
        "flac" | "wav" | "aiff" | "aif" | "mp3" | "m4a" | "aac" | "alac" | "ogg" | "oga"
    )
}
