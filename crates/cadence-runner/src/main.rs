//! Cadence: plays music whose tempo follows the runner's step cadence.
//!
//! ## Pipeline
//! 1. **Steps**: sensor readings (a recorded log or a synthetic train) pass through
//!    the selected step source.
//! 2. **Cadence**: inter-step deltas feed a ring; each accepted step on a warm ring
//!    yields a steps-per-minute estimate.
//! 3. **Playback**: the controller keeps the tempo variant closest to the cadence
//!    streaming into the output device, switching variants in place or loading a
//!    better-fitting track.
//!
//! ## Modes
//! - `play`: replay a recorded sensor log against a track library.
//! - `simulate`: drive the library with a clean step train.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cadence_runner::{cli, config, runtime};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,cadence_engine=info,cadence=info")
        }))
        .with_writer(std::io::stderr)
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let config = config::resolve(&args)?;
    match &args.cmd {
        Some(cli::Command::Play { library, input, source }) => {
            let source = source.parse::<cadence_engine::step_source::StepSourceKind>()?;
            runtime::run_play(&config, library, input, source)
        }
        Some(cli::Command::Simulate { library, spm, seconds }) => {
            runtime::run_simulate(&config, library, *spm, *seconds)
        }
        None => {
            anyhow::bail!("no command given; try `cadence --help`")
        }
    }
}
