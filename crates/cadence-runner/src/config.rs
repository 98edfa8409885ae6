//! Configuration loading and parsing.
//!
//! Every field of the TOML file is optional. Values resolve in order:
//! command-line flag, config file, built-in default.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use cadence_engine::config::{CadenceFormula, EngineConfig};
use serde::Deserialize;

use crate::cli::Args;

/// Top-level runner configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    /// Output device substring match.
    pub device: Option<String>,
    /// Print events as JSON lines.
    pub json: Option<bool>,
    pub motion: Option<MotionSection>,
    pub cadence: Option<CadenceSection>,
    pub controller: Option<ControllerSection>,
    pub playback: Option<PlaybackSection>,
}

/// `[motion]` table.
#[derive(Debug, Default, Deserialize)]
pub struct MotionSection {
    pub accel_ring_size: Option<usize>,
    pub velocity_ring_size: Option<usize>,
    pub step_threshold: Option<f32>,
    pub refractory_ms: Option<u64>,
}

/// `[cadence]` table.
#[derive(Debug, Default, Deserialize)]
pub struct CadenceSection {
    pub ring_size: Option<usize>,
    /// `mean`, `median` or `blend`.
    pub formula: Option<String>,
    pub outlier_high_ratio: Option<f64>,
    pub outlier_low_ratio: Option<f64>,
}

/// `[controller]` table.
#[derive(Debug, Default, Deserialize)]
pub struct ControllerSection {
    pub min_cadence_interval_ms: Option<u64>,
    pub min_set_change_interval_ms: Option<u64>,
    pub set_change_threshold_factor: Option<f64>,
}

/// `[playback]` table.
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackSection {
    pub sample_rate: Option<u32>,
    pub buffer_seconds: Option<f32>,
    pub refill_max_frames: Option<usize>,
    pub notification_fraction: Option<f32>,
    pub resample_chunk_frames: Option<usize>,
}

impl FileConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<FileConfig>(raw)?)
    }
}

/// Fully resolved runner settings.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub engine: EngineConfig,
    pub device: Option<String>,
    pub json: bool,
}

/// Resolve CLI flags over the optional config file over defaults.
pub fn resolve(args: &Args) -> Result<RunnerConfig> {
    let file = match args.config.as_deref() {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    resolve_with(file, args)
}

pub fn resolve_with(file: FileConfig, args: &Args) -> Result<RunnerConfig> {
    let mut engine = EngineConfig::default();

    if let Some(m) = file.motion {
        let motion = &mut engine.motion;
        set(&mut motion.accel_ring_size, m.accel_ring_size);
        set(&mut motion.velocity_ring_size, m.velocity_ring_size);
        if m.step_threshold.is_some() {
            motion.step_threshold = m.step_threshold;
        }
        set(&mut motion.refractory, m.refractory_ms.map(Duration::from_millis));
    }
    if let Some(c) = file.cadence {
        let cadence = &mut engine.cadence;
        set(&mut cadence.ring_size, c.ring_size);
        if let Some(name) = c.formula.as_deref() {
            cadence.formula = parse_formula(name)?;
        }
        set(&mut cadence.outlier_high_ratio, c.outlier_high_ratio);
        set(&mut cadence.outlier_low_ratio, c.outlier_low_ratio);
    }
    if let Some(c) = file.controller {
        let controller = &mut engine.controller;
        set(
            &mut controller.min_cadence_interval,
            c.min_cadence_interval_ms.map(Duration::from_millis),
        );
        set(
            &mut controller.min_set_change_interval,
            c.min_set_change_interval_ms.map(Duration::from_millis),
        );
        set(&mut controller.set_change_threshold_factor, c.set_change_threshold_factor);
    }
    if let Some(p) = file.playback {
        let playback = &mut engine.playback;
        set(&mut playback.sample_rate, p.sample_rate);
        set(&mut playback.buffer_seconds, p.buffer_seconds);
        set(&mut playback.refill_max_frames, p.refill_max_frames);
        set(&mut playback.notification_fraction, p.notification_fraction);
        set(&mut playback.resample_chunk_frames, p.resample_chunk_frames);
    }

    if let Some(name) = args.formula.as_deref() {
        engine.cadence.formula = parse_formula(name)?;
    }
    if args.step_threshold.is_some() {
        engine.motion.step_threshold = args.step_threshold;
    }
    set(&mut engine.playback.buffer_seconds, args.buffer_seconds);
    set(&mut engine.playback.sample_rate, args.sample_rate);

    Ok(RunnerConfig {
        engine,
        device: normalize_device_name(args.device.clone().or(file.device)),
        json: args.json || file.json.unwrap_or(false),
    })
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn parse_formula(name: &str) -> Result<CadenceFormula> {
    CadenceFormula::parse(name).ok_or_else(|| anyhow!("unknown cadence formula: {name}"))
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["cadence"];
        argv.extend_from_slice(extra);
        argv.extend_from_slice(&["simulate", "music", "--spm", "160"]);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn empty_file_keeps_defaults() {
        let cfg = resolve_with(FileConfig::parse("").unwrap(), &args(&[])).unwrap();
        assert_eq!(cfg.engine.controller.min_set_change_interval, Duration::from_millis(5000));
        assert_eq!(cfg.engine.cadence.formula, CadenceFormula::Mean);
        assert_eq!(cfg.engine.motion.step_threshold, None);
        assert!(!cfg.json);
        assert_eq!(cfg.device, None);
    }

    #[test]
    fn file_values_apply_with_millisecond_durations() {
        let file = FileConfig::parse(
            r#"
            device = "USB DAC"

            [motion]
            refractory_ms = 300
            step_threshold = 35.0

            [cadence]
            formula = "blend"
            ring_size = 8

            [controller]
            min_cadence_interval_ms = 500
            set_change_threshold_factor = 2.0

            [playback]
            buffer_seconds = 1.5
            "#,
        )
        .unwrap();
        let cfg = resolve_with(file, &args(&[])).unwrap();
        assert_eq!(cfg.device.as_deref(), Some("USB DAC"));
        assert_eq!(cfg.engine.motion.refractory, Duration::from_millis(300));
        assert_eq!(cfg.engine.motion.step_threshold, Some(35.0));
        assert_eq!(cfg.engine.cadence.formula, CadenceFormula::Blend);
        assert_eq!(cfg.engine.cadence.ring_size, 8);
        assert_eq!(cfg.engine.controller.min_cadence_interval, Duration::from_millis(500));
        assert_eq!(cfg.engine.controller.set_change_threshold_factor, 2.0);
        assert_eq!(cfg.engine.playback.buffer_seconds, 1.5);
    }

    #[test]
    fn flags_override_file() {
        let file = FileConfig::parse(
            r#"
            device = "USB DAC"
            [cadence]
            formula = "blend"
            [playback]
            buffer_seconds = 1.5
            "#,
        )
        .unwrap();
        let cfg = resolve_with(
            file,
            &args(&["--device", " Speakers ", "--formula", "median", "--buffer-seconds", "3", "--json"]),
        )
        .unwrap();
        assert_eq!(cfg.device.as_deref(), Some("Speakers"));
        assert_eq!(cfg.engine.cadence.formula, CadenceFormula::Median);
        assert_eq!(cfg.engine.playback.buffer_seconds, 3.0);
        assert!(cfg.json);
    }

    #[test]
    fn unknown_formula_is_rejected() {
        let file = FileConfig::parse("[cadence]\nformula = \"mode\"\n").unwrap();
        assert!(resolve_with(file, &args(&[])).is_err());
        assert!(FileConfig::parse("[cadence]\nring_size = \"ten\"\n").is_err());
    }

    #[test]
    fn config_file_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.toml");
        std::fs::write(&path, "[controller]\nmin_set_change_interval_ms = 8000\n").unwrap();
        let file = FileConfig::load(&path).unwrap();
        let cfg = resolve_with(file, &args(&[])).unwrap();
        assert_eq!(cfg.engine.controller.min_set_change_interval, Duration::from_secs(8));
    }
}
