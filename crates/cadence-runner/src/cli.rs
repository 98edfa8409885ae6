use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "cadence", version, about = "Plays music that follows your running cadence")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long, global = true)]
    pub device: Option<String>,

    /// TOML config file (CLI flags override its values)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print every engine event as a JSON line on stdout
    #[arg(long, global = true)]
    pub json: bool,

    /// Sink buffer size in seconds
    #[arg(long, global = true)]
    pub buffer_seconds: Option<f32>,

    /// Preferred output sample rate (Hz)
    #[arg(long, global = true)]
    pub sample_rate: Option<u32>,

    /// Cadence formula: mean, median or blend
    #[arg(long, global = true)]
    pub formula: Option<String>,

    /// Step detection threshold (overrides the per-source default)
    #[arg(long, global = true)]
    pub step_threshold: Option<f32>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay a recorded sensor log against a track library
    Play {
        /// Directory of `<song words>_<slow|original|fast>_<bpm>.<ext>` files
        library: PathBuf,

        /// CSV sensor log (`timestamp_ns` per step, or `timestamp,x,y,z`)
        #[arg(long)]
        input: PathBuf,

        /// Step source the log was recorded from: inbuilt, external or accelerometer
        #[arg(long, default_value = "inbuilt")]
        source: String,
    },

    /// Drive the library with a synthetic step train
    Simulate {
        /// Directory of `<song words>_<slow|original|fast>_<bpm>.<ext>` files
        library: PathBuf,

        /// Steps per minute
        #[arg(long)]
        spm: f64,

        /// How long to run
        #[arg(long, default_value_t = 60.0)]
        seconds: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_devices_needs_no_subcommand() {
        let args = Args::try_parse_from(["cadence", "--list-devices"]).unwrap();
        assert!(args.list_devices);
        assert!(args.cmd.is_none());
    }

    #[test]
    fn play_parses_source_and_global_flags() {
        let args = Args::try_parse_from([
            "cadence",
            "play",
            "music",
            "--input",
            "run.csv",
            "--source",
            "external",
            "--json",
            "--formula",
            "median",
        ])
        .unwrap();
        assert!(args.json);
        assert_eq!(args.formula.as_deref(), Some("median"));
        match args.cmd {
            Some(Command::Play { library, input, source }) => {
                assert_eq!(library, PathBuf::from("music"));
                assert_eq!(input, PathBuf::from("run.csv"));
                assert_eq!(source, "external");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn simulate_defaults_to_one_minute() {
        let args = Args::try_parse_from(["cadence", "simulate", "music", "--spm", "165"]).unwrap();
        match args.cmd {
            Some(Command::Simulate { spm, seconds, .. }) => {
                assert_eq!(spm, 165.0);
                assert_eq!(seconds, 60.0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
