//! Output device and stream config selection for the PCM sink.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Largest fixed callback buffer requested from a device, in frames.
const MAX_CALLBACK_FRAMES: u32 = 16_384;

/// Output device whose name contains `needle` (case-insensitive), else the host default.
pub fn find_output_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let Some(needle) = needle.filter(|n| !n.trim().is_empty()) else {
        return host
            .default_output_device()
            .ok_or_else(|| anyhow!("No default output device"));
    };

    let mut seen = Vec::new();
    for device in host.output_devices().context("enumerate output devices")? {
        let Ok(description) = device.description() else {
            continue;
        };
        let name = description.name().to_string();
        if name_matches(&name, needle) {
            return Ok(device);
        }
        seen.push(name);
    }
    Err(anyhow!("No output device matched {needle:?} (available: {})", seen.join(", ")))
}

/// Sort key for a candidate stream config; the smallest key wins.
///
/// Rates at or below the target beat rates above it, then the closer rate wins,
/// then stereo layouts, then the sample format cheapest to convert to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ConfigRank {
    above_target: bool,
    rate_distance: u32,
    not_stereo: bool,
    format: u8,
}

impl ConfigRank {
    fn new(rate: u32, target_rate: u32, channels: u16, format: cpal::SampleFormat) -> Self {
        Self {
            above_target: rate > target_rate,
            rate_distance: rate.abs_diff(target_rate),
            not_stereo: channels != 2,
            format: format_rank(format),
        }
    }
}

/// Stream config for `device` closest to `target_rate`.
pub fn choose_stream_config(device: &cpal::Device, target_rate: u32) -> Result<cpal::SupportedStreamConfig> {
    device
        .supported_output_configs()
        .context("query output configs")?
        .map(|range| {
            let rate = rate_within(range.min_sample_rate(), range.max_sample_rate(), target_rate);
            let rank = ConfigRank::new(rate, target_rate, range.channels(), range.sample_format());
            (rank, range.with_sample_rate(rate))
        })
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, config)| config)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Fixed callback buffer when the device reports a range; `None` keeps the device default.
pub fn fixed_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match *config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed(callback_frames(min, max)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn callback_frames(min: u32, max: u32) -> u32 {
    max.min(MAX_CALLBACK_FRAMES).max(min)
}

fn rate_within(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::I16 => 0,
        cpal::SampleFormat::F32 => 1,
        cpal::SampleFormat::I32 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => u8::MAX,
    }
}

/// Print output devices to stdout, marking the host default.
pub fn print_output_devices(host: &cpal::Host) -> Result<()> {
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.name().to_string());

    for (i, device) in host.output_devices().context("enumerate output devices")?.enumerate() {
        let name = device.description()?.name().to_string();
        let marker = if default_name.as_deref() == Some(name.as_str()) { "*" } else { " " };
        println!("{marker} #{i}: {name}");
    }
    Ok(())
}

fn name_matches(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    !needle.is_empty() && name.to_lowercase().contains(&needle.to_lowercase())
}
