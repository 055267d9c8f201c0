//! PCM formats and the frame type handed to consumers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sample encoding of output frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    /// Signed 16-bit little endian.
    S16Le,
    /// Signed 16-bit big endian.
    S16Be,
    /// 32-bit float little endian.
    F32Le,
}

impl SampleEncoding {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::S16Le | Self::S16Be => 2,
            Self::F32Le => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::S16Le => "s16le",
            Self::S16Be => "s16be",
            Self::F32Le => "f32le",
        }
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SampleEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s16le" => Ok(Self::S16Le),
            "s16be" => Ok(Self::S16Be),
            "f32le" => Ok(Self::F32Le),
            other => Err(format!("unknown sample encoding: {other}")),
        }
    }
}

/// Caller-level output format. Every frame a consumer sees is in this format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub encoding: SampleEncoding,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 48_000,
            encoding: SampleEncoding::S16Le,
        }
    }
}

impl OutputFormat {
    /// Sample frames (per channel) in one output frame of `frame_ms`.
    pub fn frames_per_chunk(&self, frame_ms: u64) -> usize {
        ((self.sample_rate as u64 * frame_ms) / 1000).max(1) as usize
    }

    /// Interleaved samples in one output frame of `frame_ms`.
    pub fn samples_per_chunk(&self, frame_ms: u64) -> usize {
        self.frames_per_chunk(frame_ms) * self.channels as usize
    }

    /// Milliseconds covered by `frames` sample frames.
    pub fn frames_to_ms(&self, frames: u64) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        frames.saturating_mul(1000) / self.sample_rate as u64
    }
}

/// Stream format negotiated with the decoder.
///
/// This is what the decoder actually produces, which can differ from what the
/// container advertised (extension profiles double the rate, parametric stereo
/// adds a channel). Fixed once per track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderFormat {
    pub channels: u16,
    pub sample_rate: u32,
    /// Samples per channel in one decoded frame.
    pub frame_size: usize,
}

impl DecoderFormat {
    /// Whether the decoder output already has the rate and layout of `output`.
    pub fn matches(&self, output: &OutputFormat) -> bool {
        self.channels == output.channels && self.sample_rate == output.sample_rate
    }
}

/// A block of interleaved PCM in the output format.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    /// Presentation timecode of the first sample.
    pub timecode_ms: u64,
    /// Sample frames (per channel) held by this block.
    pub sample_frames: usize,
    pub format: OutputFormat,
    /// Encoded samples.
    pub data: Vec<u8>,
}

impl AudioFrame {
    /// Milliseconds covered by this frame.
    pub fn duration_ms(&self) -> u64 {
        self.format.frames_to_ms(self.sample_frames as u64)
    }

    /// Decode the payload back to interleaved `f32`.
    pub fn to_f32(&self) -> Vec<f32> {
        match self.format.encoding {
            SampleEncoding::S16Le => self
                .data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
                .collect(),
            SampleEncoding::S16Be => self
                .data
                .chunks_exact(2)
                .map(|b| i16::from_be_bytes([b[0], b[1]]) as f32 / 32768.0)
                .collect(),
            SampleEncoding::F32Le => self
                .data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        }
    }
}
