//! Whole-buffer resampling of decoded variants.
//!
//! Uses Rubato's sinc resampler to convert interleaved `f32` audio from the
//! source rate to the sink rate. The resampler's start-up delay is trimmed so
//! output frame `n` lines up with input frame `n / ratio`; tempo variants of
//! one track must stay aligned for cursor rescaling to land on the same beat.

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

/// Resample interleaved `input` from `src_rate` to `dst_rate`.
///
/// Returns the input unchanged when the rates match.
pub fn resample_interleaved(
    input: &[f32],
    channels: usize,
    src_rate: u32,
    dst_rate: u32,
    chunk_frames: usize,
) -> Result<Vec<f32>> {
    if channels == 0 {
        return Err(anyhow!("resample needs at least one channel"));
    }
    if src_rate == 0 || dst_rate == 0 {
        return Err(anyhow!("invalid sample rates {src_rate} -> {dst_rate}"));
    }
    if src_rate == dst_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let f_ratio = dst_rate as f64 / src_rate as f64;

    let sinc_len = 128;
    let window = WindowFunction::BlackmanHarris2;
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    };

    let chunk_in_frames = chunk_frames.max(1);
    let mut resampler = Async::<f32>::new_sinc(
        f_ratio,
        1.1,
        &params,
        chunk_in_frames,
        channels,
        FixedAsync::Input,
    )
    .map_err(|e| anyhow!("resampler init error: {e}"))?;

    let input_frames = input.len() / channels;
    let expected_frames = (input_frames as f64 * f_ratio).round() as usize;
    let delay = resampler.output_delay();
    let wanted = expected_frames + delay;

    let mut out_chunk = vec![0.0f32; resampler.output_frames_max() * channels];
    let mut padded = vec![0.0f32; chunk_in_frames * channels];
    let mut collected: Vec<f32> = Vec::with_capacity(wanted * channels);
    let mut indexing = Indexing {
        input_offset: 0,
        output_offset: 0,
        active_channels_mask: None,
        partial_len: None,
    };

    let mut offset = 0;
    // Full chunks, then the zero-padded tail, then silence until the delay is flushed.
    while collected.len() < wanted * channels {
        let available = input_frames.saturating_sub(offset);
        let take = available.min(chunk_in_frames);
        padded.fill(0.0);
        if take > 0 {
            padded[..take * channels]
                .copy_from_slice(&input[offset * channels..(offset + take) * channels]);
        }
        offset += take;
        indexing.partial_len = if take == chunk_in_frames { None } else { Some(take) };

        let input_adapter = InterleavedSlice::new(&padded, channels, chunk_in_frames)
            .map_err(|e| anyhow!("interleaved slice (input) error: {e}"))?;
        let out_capacity_frames = out_chunk.len() / channels;
        let mut output_adapter = InterleavedSlice::new_mut(&mut out_chunk, channels, out_capacity_frames)
            .map_err(|e| anyhow!("interleaved slice (output) error: {e}"))?;

        let (_nbr_in, nbr_out) = resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
            .map_err(|e| anyhow!("resampler process error: {e}"))?;
        if nbr_out == 0 && take == 0 {
            break;
        }
        collected.extend_from_slice(&out_chunk[..nbr_out * channels]);
    }

    let start = (delay * channels).min(collected.len());
    let end = (wanted * channels).min(collected.len());
    Ok(collected[start..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(rate: u32, freq: f32, frames: usize) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let v = (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin() * 0.5;
                [v, v]
            })
            .collect()
    }

    #[test]
    fn matching_rates_pass_through() {
        let input = sine(44_100, 440.0, 100);
        let out = resample_interleaved(&input, 2, 44_100, 44_100, 1024).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn output_length_follows_rate_ratio() {
        let input = sine(48_000, 440.0, 4_800);
        let out = resample_interleaved(&input, 2, 48_000, 44_100, 1024).unwrap();
        assert_eq!(out.len(), 4_410 * 2);
        assert!(out.iter().all(|s| s.is_finite() && s.abs() <= 1.0));
    }

    #[test]
    fn rejects_zero_channels_and_rates() {
        assert!(resample_interleaved(&[0.0], 0, 48_000, 44_100, 64).is_err());
        assert!(resample_interleaved(&[0.0, 0.0], 2, 0, 44_100, 64).is_err());
    }
}
