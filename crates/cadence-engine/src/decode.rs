//! File-backed variant loading.
//!
//! Uses Symphonia to:
//! - probe the input container/codec
//! - decode packets into interleaved `f32` samples
//!
//! then maps the channels to stereo, resamples to the sink rate and packs the
//! result as interleaved 16-bit little-endian PCM.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::config::{OUTPUT_CHANNELS, PlaybackConfig};
use crate::library::{VariantDescriptor, VariantLoader};
use crate::resample::resample_interleaved;
use crate::variant::TempoVariant;

/// Decoded audio before conversion to the sink format.
#[derive(Clone, Debug)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: usize,
    /// Interleaved samples.
    pub samples: Vec<f32>,
}

/// Decode the default track of `path` into memory.
pub fn decode_file(path: &Path) -> Result<DecodedAudio> {
    let file = File::open(path).with_context(|| format!("open {:?}", path))?;

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .with_context(|| format!("probe {:?}", path))?;
    let format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track"))?;
    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| anyhow!("Unknown channels"))?
        .count();
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let samples = decode_format_loop(format, track_id, &codec_params)?;
    Ok(DecodedAudio {
        sample_rate,
        channels,
        samples,
    })
}

/// Decode every packet of the default track into interleaved `f32`.
fn decode_format_loop(
    mut format: Box<dyn FormatReader>,
    track_id: u32,
    codec_params: &CodecParameters,
) -> Result<Vec<f32>> {
    let mut decoder = symphonia::default::get_codecs().make(codec_params, &DecoderOptions::default())?;
    let mut out = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(anyhow!("read packet: {e}")),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(anyhow!("decode packet: {e}")),
        };

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);
        out.extend_from_slice(sample_buf.samples());
    }

    Ok(out)
}

/// Map interleaved audio with `channels` channels to stereo.
///
/// Mono is duplicated; wider layouts keep their first two channels.
pub fn to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        2 => samples.to_vec(),
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        n => samples
            .chunks_exact(n)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

/// Pack interleaved `f32` samples as 16-bit little-endian PCM.
pub fn to_pcm_i16_le(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            v.to_le_bytes()
        })
        .collect()
}

/// [`VariantLoader`] over audio files on disk.
#[derive(Clone, Debug)]
pub struct FileVariantLoader {
    target_rate: u32,
    chunk_frames: usize,
}

impl FileVariantLoader {
    /// Render variants at `target_rate` (the sink's stream rate).
    pub fn new(target_rate: u32, playback: &PlaybackConfig) -> Self {
        Self {
            target_rate,
            chunk_frames: playback.resample_chunk_frames.max(1),
        }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }
}

impl VariantLoader for FileVariantLoader {
    fn load_variant(&self, name: &str, descriptor: &VariantDescriptor) -> Result<TempoVariant> {
        let decoded = decode_file(&descriptor.source)?;
        let stereo = to_stereo(&decoded.samples, decoded.channels);
        let resampled = resample_interleaved(
            &stereo,
            OUTPUT_CHANNELS,
            decoded.sample_rate,
            self.target_rate,
            self.chunk_frames,
        )
        .with_context(|| format!("resample {:?}", descriptor.source))?;
        let pcm = to_pcm_i16_le(&resampled);

        tracing::info!(
            track = name,
            variant = ?descriptor.label,
            bpm = descriptor.bpm,
            source_rate_hz = decoded.sample_rate,
            output_rate_hz = self.target_rate,
            source_channels = decoded.channels,
            bytes = pcm.len(),
            "variant decoded"
        );
        Ok(TempoVariant::new(name, descriptor.label, descriptor.bpm, pcm))
    }
}
