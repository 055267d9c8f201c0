//! CPAL output stream fed by a track executor.
//!
//! The callback pulls frames with a zero timeout, so it never blocks. The
//! executor produces `f32` frames already at the device rate and channel
//! count; underruns are filled with silence.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;
use track_engine::TrackExecutor;

/// Counters updated by the audio callback.
#[derive(Debug, Default)]
pub struct OutputCounters {
    pub played_frames: AtomicU64,
    pub underrun_frames: AtomicU64,
    pub underrun_events: AtomicU64,
}

/// Build a CPAL output stream that plays frames provided by `executor`.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    executor: TrackExecutor,
    counters: Arc<OutputCounters>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, executor, counters),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, executor, counters),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, executor, counters),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, executor, counters),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    executor: TrackExecutor,
    counters: Arc<OutputCounters>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut pending = PendingSamples::default();
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let written = pending.fill(data, || {
                executor.provide(Duration::ZERO).map(|frame| frame.to_f32())
            });
            let frames = written / channels.max(1);
            counters.played_frames.fetch_add(frames as u64, Ordering::Relaxed);
            if written < data.len() {
                counters.underrun_events.fetch_add(1, Ordering::Relaxed);
                let missing = (data.len() - written) / channels.max(1);
                counters.underrun_frames.fetch_add(missing as u64, Ordering::Relaxed);
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Interleaved samples left over from the last frame.
#[derive(Default)]
struct PendingSamples {
    samples: Vec<f32>,
    pos: usize,
}

impl PendingSamples {
    /// Fill `out` from pending samples, refilling with `next` as needed. Returns
    /// the number of samples written; the rest of `out` is silence.
    fn fill<T>(&mut self, out: &mut [T], mut next: impl FnMut() -> Option<Vec<f32>>) -> usize
    where
        T: cpal::Sample + cpal::FromSample<f32>,
    {
        let mut written = 0;
        while written < out.len() {
            if self.pos >= self.samples.len() {
                match next() {
                    Some(samples) => {
                        self.samples = samples;
                        self.pos = 0;
                        continue;
                    }
                    None => break,
                }
            }
            let n = (self.samples.len() - self.pos).min(out.len() - written);
            for (dst, &src) in out[written..written + n]
                .iter_mut()
                .zip(&self.samples[self.pos..self.pos + n])
            {
                *dst = T::from_sample(src);
            }
            self.pos += n;
            written += n;
        }
        out[written..].fill(T::EQUILIBRIUM);
        written
    }
}
