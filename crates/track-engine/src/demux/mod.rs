//! Container demuxers.
//!
//! Every container kind is resolved once by [`probe::detect`] and wrapped in a
//! [`ContainerDemuxer`] variant. Callers only see the [`Demuxer`] contract:
//! ordered packets, stream parameters and seek-to-time.

pub mod probe;
pub mod software;
pub mod wav;

use symphonia::core::codecs::{CodecParameters, CodecType};

use crate::error::Result;
use crate::source::SeekableSource;

pub use probe::ContainerKind;

/// How the gap between a requested and a provided seek timecode is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekTrim {
    /// Decoded samples before the requested timecode are dropped.
    Exact,
    /// Decoding resumes at the provided timecode, which becomes the position.
    Approximate,
}

/// Stream parameters discovered while opening a container.
#[derive(Clone, Debug)]
pub struct StreamParams {
    pub container: ContainerKind,
    pub codec: CodecType,
    /// Short codec label for logs and status.
    pub codec_label: &'static str,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: Option<u32>,
    /// Decoder configuration blob (for example an AudioSpecificConfig).
    pub extra_data: Option<Box<[u8]>>,
    /// Parameters handed to the software decoder.
    pub codec_params: CodecParameters,
}

/// One encoded unit from the container.
#[derive(Clone, Debug)]
pub struct CodecPacket {
    pub track_id: u32,
    /// Timestamp in the track time base.
    pub ts: u64,
    /// Duration in the track time base.
    pub dur: u64,
    /// Presentation timecode in milliseconds.
    pub timecode_ms: u64,
    pub data: Box<[u8]>,
}

/// Result of asking a demuxer for its next packet.
#[derive(Debug)]
pub enum PacketRead {
    Packet(CodecPacket),
    /// End of the stream. Not an error.
    Exhausted,
}

/// Contract shared by every container implementation.
pub trait Demuxer: Send {
    fn params(&self) -> &StreamParams;

    /// Next packet in non-decreasing timecode order.
    fn next_packet(&mut self) -> Result<PacketRead>;

    /// Seek to `timecode_ms`. Returns the provided timecode, never past the target.
    fn seek(&mut self, timecode_ms: u64) -> Result<u64>;

    /// Track duration when the container knows it.
    fn duration_ms(&self) -> Option<u64>;

    fn can_seek(&self) -> bool;

    fn seek_trim(&self) -> SeekTrim {
        self.params().container.seek_trim()
    }
}

/// Demuxer chosen by content probing.
pub enum ContainerDemuxer {
    Wav(wav::WavDemuxer),
    Software(software::SoftwareDemuxer),
}

impl ContainerDemuxer {
    /// Probe `source` and open the matching demuxer.
    pub fn open(mut source: Box<dyn SeekableSource>) -> Result<Self> {
        let kind = probe::detect(source.as_mut())?;
        let demuxer = match kind {
            ContainerKind::Wav => Self::Wav(wav::WavDemuxer::open(source)?),
            other => Self::Software(software::SoftwareDemuxer::open(source, other)?),
        };
        let params = demuxer.params();
        tracing::info!(
            container = params.container.label(),
            codec = params.codec_label,
            rate_hz = params.sample_rate,
            channels = params.channels,
            duration_ms = ?demuxer.duration_ms(),
            "container detected"
        );
        Ok(demuxer)
    }

    fn inner(&self) -> &dyn Demuxer {
        match self {
            Self::Wav(d) => d,
            Self::Software(d) => d,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Demuxer {
        match self {
            Self::Wav(d) => d,
            Self::Software(d) => d,
        }
    }
}

impl Demuxer for ContainerDemuxer {
    fn params(&self) -> &StreamParams {
        self.inner().params()
    }

    fn next_packet(&mut self) -> Result<PacketRead> {
        self.inner_mut().next_packet()
    }

    fn seek(&mut self, timecode_ms: u64) -> Result<u64> {
        self.inner_mut().seek(timecode_ms)
    }

    fn duration_ms(&self) -> Option<u64> {
        self.inner().duration_ms()
    }

    fn can_seek(&self) -> bool {
        self.inner().can_seek()
    }
}

/// Short label for a symphonia codec type.
pub fn codec_label(codec: CodecType) -> &'static str {
    use symphonia::core::codecs::*;
    match codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => "UNKNOWN",
    }
}

/// Milliseconds covered by `frames` at `rate`.
pub(crate) fn frames_to_ms(frames: u64, rate: u32) -> u64 {
    if rate == 0 {
        return 0;
    }
    (frames as u128 * 1000 / rate as u128) as u64
}
