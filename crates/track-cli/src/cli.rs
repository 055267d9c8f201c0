use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use track_engine::SampleEncoding;

#[derive(Parser, Debug)]
#[command(name = "track-cli", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    #[command(flatten)]
    pub engine: EngineFlags,
}

/// Overrides applied on top of the engine config file.
#[derive(ClapArgs, Debug, Default, Clone)]
pub struct EngineFlags {
    /// TOML file with engine settings
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Frame buffer duration in milliseconds
    #[arg(long, global = true)]
    pub buffer_ms: Option<u64>,

    /// Output frame duration in milliseconds
    #[arg(long, global = true)]
    pub frame_ms: Option<u64>,

    /// Drop buffered audio immediately on seek instead of playing it out
    #[arg(long, global = true)]
    pub no_ghosting: bool,

    /// Report a track as stuck after this many milliseconds without a frame
    #[arg(long, global = true)]
    pub stuck_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print container, codec, stream format and duration
    Probe {
        /// Audio files to inspect
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Decode a file to raw PCM in the output format
    Render {
        path: PathBuf,

        /// Destination for the interleaved PCM
        #[arg(long)]
        out: PathBuf,

        /// Start position in milliseconds
        #[arg(long)]
        seek_ms: Option<u64>,

        /// Output sample rate
        #[arg(long)]
        rate: Option<u32>,

        /// Output channel count
        #[arg(long)]
        channels: Option<u16>,

        /// Output sample encoding (s16le, s16be, f32le)
        #[arg(long)]
        encoding: Option<SampleEncoding>,
    },

    /// Play a file on an output device
    Play {
        path: PathBuf,

        /// Use a specific output device by substring match
        #[arg(long)]
        device: Option<String>,

        /// Start position in milliseconds
        #[arg(long)]
        seek_ms: Option<u64>,
    },

    /// List output devices and exit
    ListDevices,
}
