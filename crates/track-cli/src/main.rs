//! track-cli: drive the track engine from the command line.
//!
//! ## Subcommands
//! - `probe`: detect container, codec and stream format of local files.
//! - `render`: decode one file into raw PCM in the configured output format.
//! - `play`: decode one file and play it on an output device via CPAL.
//! - `list-devices`: print output devices.

mod cli;
mod config;
mod device;
mod output;
mod runtime;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,track_engine=info")),
        )
        .init();

    let engine = config::load_engine_config(&args.engine)?;
    match args.cmd {
        cli::Command::Probe { paths } => runtime::run_probe(engine, paths),
        cli::Command::Render {
            path,
            out,
            seek_ms,
            rate,
            channels,
            encoding,
        } => runtime::run_render(
            engine,
            &path,
            &out,
            seek_ms,
            runtime::RenderFormat {
                rate,
                channels,
                encoding,
            },
        ),
        cli::Command::Play {
            path,
            device,
            seek_ms,
        } => runtime::run_play(engine, &path, device.as_deref(), seek_ms),
        cli::Command::ListDevices => runtime::list_devices(),
    }
}
