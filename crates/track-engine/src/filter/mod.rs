//! Audio filter pipeline: decoder PCM to fixed-size output frames.
//!
//! Stages are composed only when needed (channel remix, resampling) and the
//! encoder always runs last. Matching input and output layouts take the
//! pass-through path, which encodes decoder samples directly.

pub mod encode;
pub mod remix;
pub mod resample;

use crate::codec::DecodedSamples;
use crate::config::EngineConfig;
use crate::demux::SeekTrim;
use crate::error::Result;
use crate::format::{AudioFrame, DecoderFormat, OutputFormat};

pub use remix::ChannelRemix;
pub use resample::ResampleStage;

/// Receives finished output frames.
pub trait FrameSink {
    fn accept(&mut self, frame: AudioFrame) -> Result<()>;
}

impl FrameSink for Vec<AudioFrame> {
    fn accept(&mut self, frame: AudioFrame) -> Result<()> {
        self.push(frame);
        Ok(())
    }
}

pub struct FilterPipeline {
    input: DecoderFormat,
    output: OutputFormat,
    trim: SeekTrim,
    remix: Option<ChannelRemix>,
    resampler: Option<ResampleStage>,
    /// Sample frames per output frame.
    chunk_frames: usize,
    /// Encoded bytes not yet forming a whole frame.
    pending: Vec<u8>,
    /// Timecode of the first frame emitted since the last discontinuity.
    base_ms: u64,
    emitted_frames: u64,
    /// Input frames still to drop after an exact seek.
    skip_frames: u64,
    floats: Vec<f32>,
    mixed: Vec<f32>,
    resampled: Vec<f32>,
}

impl FilterPipeline {
    pub fn new(input: DecoderFormat, config: &EngineConfig, trim: SeekTrim) -> Result<Self> {
        let output = config.output;
        let remix = ChannelRemix::new(input.channels, output.channels);
        let resampler = if input.sample_rate != output.sample_rate {
            Some(ResampleStage::new(
                input.sample_rate,
                output.sample_rate,
                output.channels as usize,
                config.resample_chunk_frames,
            )?)
        } else {
            None
        };
        tracing::info!(
            in_rate = input.sample_rate,
            in_channels = input.channels,
            out_rate = output.sample_rate,
            out_channels = output.channels,
            encoding = %output.encoding,
            remix = remix.is_some(),
            resample = resampler.is_some(),
            "filter pipeline built"
        );
        Ok(Self {
            input,
            output,
            trim,
            remix,
            resampler,
            chunk_frames: output.frames_per_chunk(config.effective_frame_ms()),
            pending: Vec::new(),
            base_ms: 0,
            emitted_frames: 0,
            skip_frames: 0,
            floats: Vec::new(),
            mixed: Vec::new(),
            resampled: Vec::new(),
        })
    }

    pub fn input(&self) -> DecoderFormat {
        self.input
    }

    pub fn output(&self) -> OutputFormat {
        self.output
    }

    pub fn resampling(&self) -> bool {
        self.resampler.is_some()
    }

    pub fn is_pass_through(&self) -> bool {
        self.remix.is_none() && self.resampler.is_none()
    }

    /// Convert one block of decoder output and emit every completed frame.
    pub fn process(&mut self, samples: DecodedSamples<'_>, sink: &mut dyn FrameSink) -> Result<()> {
        let samples = self.apply_skip(samples);
        if samples.is_empty() {
            return Ok(());
        }

        let encoding = self.output.encoding;
        if self.is_pass_through() {
            match samples {
                DecodedSamples::I16(s) => encode::encode_i16(s, encoding, &mut self.pending),
                DecodedSamples::F32(s) => encode::encode_f32(s, encoding, &mut self.pending),
            }
            return self.emit_full(sink);
        }

        self.floats.clear();
        match samples {
            DecodedSamples::I16(s) => self.floats.extend(s.iter().map(|v| *v as f32 / 32768.0)),
            DecodedSamples::F32(s) => self.floats.extend_from_slice(s),
        }
        let mixed: &[f32] = match &self.remix {
            Some(remix) => {
                remix.apply(&self.floats, &mut self.mixed);
                &self.mixed
            }
            None => &self.floats,
        };
        match self.resampler.as_mut() {
            Some(resampler) => {
                self.resampled.clear();
                resampler.process(mixed, &mut self.resampled)?;
                encode::encode_f32(&self.resampled, encoding, &mut self.pending);
            }
            None => encode::encode_f32(mixed, encoding, &mut self.pending),
        }
        self.emit_full(sink)
    }

    /// Drain the resampler tail and emit the final, possibly short, frame.
    pub fn flush(&mut self, sink: &mut dyn FrameSink) -> Result<()> {
        if let Some(resampler) = self.resampler.as_mut() {
            self.resampled.clear();
            resampler.flush(&mut self.resampled)?;
            encode::encode_f32(&self.resampled, self.output.encoding, &mut self.pending);
        }
        self.emit_full(sink)?;
        let frame_bytes = self.frame_bytes();
        let frames = self.pending.len() / frame_bytes;
        if frames > 0 {
            let data = std::mem::take(&mut self.pending);
            self.emit(data, frames, sink)?;
        }
        self.pending.clear();
        Ok(())
    }

    /// Discontinuity in the decoded stream.
    ///
    /// Exact trimming drops input until `requested` is reached; approximate
    /// trimming restarts the timeline at `provided`.
    pub fn seek_performed(&mut self, requested_ms: u64, provided_ms: u64) -> Result<()> {
        self.pending.clear();
        self.emitted_frames = 0;
        match self.trim {
            SeekTrim::Exact => {
                self.base_ms = requested_ms;
                self.skip_frames = requested_ms.saturating_sub(provided_ms)
                    * self.input.sample_rate as u64
                    / 1000;
            }
            SeekTrim::Approximate => {
                self.base_ms = provided_ms;
                self.skip_frames = 0;
            }
        }
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset()?;
        }
        tracing::debug!(
            requested_ms,
            provided_ms,
            skip_frames = self.skip_frames,
            "filter pipeline reset for seek"
        );
        Ok(())
    }

    fn apply_skip<'a>(&mut self, samples: DecodedSamples<'a>) -> DecodedSamples<'a> {
        if self.skip_frames == 0 {
            return samples;
        }
        let channels = self.input.channels as usize;
        let frames = (samples.len() / channels) as u64;
        let drop = self.skip_frames.min(frames) as usize * channels;
        self.skip_frames -= (drop / channels) as u64;
        match samples {
            DecodedSamples::I16(s) => DecodedSamples::I16(&s[drop..]),
            DecodedSamples::F32(s) => DecodedSamples::F32(&s[drop..]),
        }
    }

    fn frame_bytes(&self) -> usize {
        self.output.channels as usize * self.output.encoding.bytes_per_sample()
    }

    fn emit_full(&mut self, sink: &mut dyn FrameSink) -> Result<()> {
        let chunk_bytes = self.chunk_frames * self.frame_bytes();
        while self.pending.len() >= chunk_bytes {
            let rest = self.pending.split_off(chunk_bytes);
            let data = std::mem::replace(&mut self.pending, rest);
            self.emit(data, self.chunk_frames, sink)?;
        }
        Ok(())
    }

    fn emit(&mut self, data: Vec<u8>, frames: usize, sink: &mut dyn FrameSink) -> Result<()> {
        let frame = AudioFrame {
            timecode_ms: self.base_ms + self.output.frames_to_ms(self.emitted_frames),
            sample_frames: frames,
            format: self.output,
            data,
        };
        self.emitted_frames += frames as u64;
        sink.accept(frame)
    }
}
