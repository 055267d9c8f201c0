//! Track playback engine.
//!
//! A [`TrackExecutor`] turns a byte source into fixed-size output frames:
//! container demuxing, native or software decoding, format conversion, and a
//! bounded frame buffer the consumer drains with [`TrackExecutor::provide`].
//! The [`PlaybackPool`] runs executors on dedicated threads and watches them
//! for stalls.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod demux;
pub mod error;
pub mod executor;
pub mod filter;
pub mod format;
pub mod listener;
pub mod markers;
pub mod monitor;
pub mod ordered;
pub mod pool;
pub mod router;
pub mod source;
pub mod status;

#[cfg(test)]
mod test_support;

pub use codec::{DecoderBackend, NativeCodecLibrary, PcmCodecLibrary};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use executor::TrackExecutor;
pub use format::{AudioFrame, OutputFormat, SampleEncoding};
pub use listener::{ChannelListener, NoopListener, TrackEvent, TrackListener};
pub use markers::{MarkerId, MarkerState, TrackMarker};
pub use ordered::OrderedExecutor;
pub use pool::{PlaybackPool, PoolError};
pub use source::{FileOpener, SourceOpener};
pub use track_types::{TrackDescriptor, TrackEndReason, TrackState, TrackStatus};
