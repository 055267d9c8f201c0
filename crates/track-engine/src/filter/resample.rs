//! Sample-rate conversion stage.
//!
//! Uses Rubato's sinc resampler in fixed-input mode: input is accumulated until
//! a whole chunk is available. The filter delay is trimmed from the head of the
//! output, and flush pushes zeros until the delayed tail is out, so `n` input
//! frames always become `round(n * to / from)` output frames.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::{EngineError, Result};

pub struct ResampleStage {
    resampler: Box<dyn Resampler<f32>>,
    channels: usize,
    chunk_frames: usize,
    from_rate: u32,
    to_rate: u32,
    pending: Vec<f32>,
    out_buf: Vec<f32>,
    /// Output frames still to drop as filter delay.
    delay_frames: usize,
    input_frames: u64,
    output_frames: u64,
}

impl ResampleStage {
    pub fn new(from_rate: u32, to_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        let chunk_frames = chunk_frames.max(1);
        let resampler = build_resampler(from_rate, to_rate, channels, chunk_frames)?;
        let delay_frames = resampler.output_delay();
        let ratio = to_rate as f64 / from_rate as f64;
        let out_frames = (chunk_frames * 3).max((chunk_frames as f64 * ratio * 1.1).ceil() as usize + 64);
        tracing::debug!(
            from_hz = from_rate,
            to_hz = to_rate,
            channels,
            chunk_frames,
            delay_frames,
            "resampler created"
        );
        Ok(Self {
            resampler,
            channels,
            chunk_frames,
            from_rate,
            to_rate,
            pending: Vec::with_capacity(chunk_frames * channels * 2),
            out_buf: vec![0.0; out_frames * channels],
            delay_frames,
            input_frames: 0,
            output_frames: 0,
        })
    }

    /// Resample interleaved `input`, appending whole output chunks to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        self.pending.extend_from_slice(input);
        self.input_frames += (input.len() / self.channels) as u64;
        let chunk_samples = self.chunk_frames * self.channels;
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk_samples {
            let produced = run_chunk(
                self.resampler.as_mut(),
                &mut self.out_buf,
                self.channels,
                &self.pending[consumed..consumed + chunk_samples],
            )?;
            self.emit(produced, usize::MAX, out);
            consumed += chunk_samples;
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    /// Push the buffered input and the delayed tail through, then start over
    /// with a fresh filter.
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let expected = self.expected_output_frames();
        let chunk_samples = self.chunk_frames * self.channels;
        while self.output_frames < expected {
            self.pending.resize(chunk_samples, 0.0);
            let produced = run_chunk(
                self.resampler.as_mut(),
                &mut self.out_buf,
                self.channels,
                &self.pending,
            )?;
            self.pending.clear();
            if produced == 0 {
                break;
            }
            let missing = (expected - self.output_frames) as usize;
            self.emit(produced, missing, out);
        }
        self.reset()
    }

    /// Drop buffered input and filter history.
    pub fn reset(&mut self) -> Result<()> {
        self.resampler = build_resampler(self.from_rate, self.to_rate, self.channels, self.chunk_frames)?;
        self.delay_frames = self.resampler.output_delay();
        self.pending.clear();
        self.input_frames = 0;
        self.output_frames = 0;
        Ok(())
    }

    /// Output frames owed for the input seen since the last reset.
    fn expected_output_frames(&self) -> u64 {
        let from = self.from_rate as u64;
        (self.input_frames * self.to_rate as u64 + from / 2) / from
    }

    /// Append up to `limit` of the `produced` frames in `out_buf`, skipping
    /// what is left of the filter delay.
    fn emit(&mut self, produced: usize, limit: usize, out: &mut Vec<f32>) {
        let skip = self.delay_frames.min(produced);
        self.delay_frames -= skip;
        let frames = (produced - skip).min(limit);
        let start = skip * self.channels;
        out.extend_from_slice(&self.out_buf[start..start + frames * self.channels]);
        self.output_frames += frames as u64;
    }
}

fn build_resampler(
    from_rate: u32,
    to_rate: u32,
    channels: usize,
    chunk_frames: usize,
) -> Result<Box<dyn Resampler<f32>>> {
    let sinc_len = 128;
    let window = WindowFunction::BlackmanHarris2;
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    };
    let ratio = to_rate as f64 / from_rate as f64;
    let resampler = Async::<f32>::new_sinc(
        ratio,
        1.1,
        &params,
        chunk_frames,
        channels,
        FixedAsync::Input,
    )
    .map_err(|e| EngineError::ResourceAcquisition(format!("resampler init failed: {e}")))?;
    Ok(Box::new(resampler))
}

fn run_chunk(
    resampler: &mut dyn Resampler<f32>,
    out_buf: &mut [f32],
    channels: usize,
    input: &[f32],
) -> Result<usize> {
    let frames = input.len() / channels;
    let input_adapter = InterleavedSlice::new(input, channels, frames)
        .map_err(|e| EngineError::fatal_decode(format!("resampler input: {e}")))?;
    let out_frames = out_buf.len() / channels;
    let mut output_adapter = InterleavedSlice::new_mut(out_buf, channels, out_frames)
        .map_err(|e| EngineError::fatal_decode(format!("resampler output: {e}")))?;
    let (_consumed, produced) = resampler
        .process_into_buffer(&input_adapter, &mut output_adapter, None)
        .map_err(|e| EngineError::fatal_decode(format!("resampler process: {e}")))?;
    Ok(produced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_length_tracks_ratio() {
        let mut stage = ResampleStage::new(44_100, 48_000, 2, 1024).unwrap();
        let input = vec![0.0f32; 44_100 * 2];
        let mut out = Vec::new();
        stage.process(&input, &mut out).unwrap();
        stage.flush(&mut out).unwrap();
        assert_eq!(out.len() / 2, 48_000);
    }

    #[test]
    fn filter_delay_is_trimmed_and_tail_is_kept() {
        let mut stage = ResampleStage::new(44_100, 48_000, 1, 1024).unwrap();
        let mut out = Vec::new();
        stage.process(&[0.5; 4_410], &mut out).unwrap();
        stage.flush(&mut out).unwrap();
        assert_eq!(out.len(), 4_800);
        // Past the onset the level is already settled, not warm-up silence.
        for idx in [20, 2_400, 4_780] {
            assert!((out[idx] - 0.5).abs() < 0.05, "sample {idx} is {}", out[idx]);
        }
    }

    #[test]
    fn flush_leaves_stage_ready_for_new_input() {
        let mut stage = ResampleStage::new(48_000, 24_000, 1, 256).unwrap();
        let mut out = Vec::new();
        stage.process(&[0.25; 1_000], &mut out).unwrap();
        stage.flush(&mut out).unwrap();
        assert_eq!(out.len(), 500);

        let mut again = Vec::new();
        stage.flush(&mut again).unwrap();
        assert!(again.is_empty());
        stage.process(&[0.25; 1_000], &mut again).unwrap();
        stage.flush(&mut again).unwrap();
        assert_eq!(again, out);
    }

    #[test]
    fn reset_discards_pending_input() {
        let mut stage = ResampleStage::new(48_000, 24_000, 1, 256).unwrap();
        let mut out = Vec::new();
        stage.process(&[0.1; 100], &mut out).unwrap();
        assert!(out.is_empty());
        stage.reset().unwrap();
        stage.flush(&mut out).unwrap();
        assert!(out.is_empty());
    }
}
