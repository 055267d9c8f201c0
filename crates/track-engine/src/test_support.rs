//! Synthetic sources and codec libraries shared by the unit tests.

use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};

use symphonia::core::codecs::CodecType;

use crate::codec::PcmCodecLibrary;
use crate::codec::native::{InstanceId, NativeCodecLibrary, NativeConfig, STATUS_UNSUPPORTED, Status};
use crate::format::DecoderFormat;
use crate::source::SeekableSource;

const WAV_HEADER_LEN: u64 = 44;

/// Deterministic 16-bit sample for `frame` on channel `ch`.
pub fn sample_value(frame: u64, ch: usize) -> i16 {
    (((frame * 13 + ch as u64 * 7919) % 65_536) as u16) as i16
}

/// Canonical 44-byte RIFF header without any sample data.
pub fn wav_header(
    format: u16,
    channels: u16,
    rate: u32,
    bits: u16,
    block_align: u16,
    data_len: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(WAV_HEADER_LEN as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36u32.wrapping_add(data_len)).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&format.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&(rate.wrapping_mul(block_align as u32)).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out
}

/// Complete PCM WAV file. Wider samples carry [`sample_value`] in their top bytes.
pub fn wav_bytes(rate: u32, channels: u16, bits: u16, frames: u64) -> Vec<u8> {
    let bytes_per_sample = bits as usize / 8;
    let block_align = channels as usize * bytes_per_sample;
    let data_len = frames as usize * block_align;
    let mut out = wav_header(1, channels, rate, bits, block_align as u16, data_len as u32);
    out.reserve(data_len);
    for frame in 0..frames {
        for ch in 0..channels as usize {
            let value = sample_value(frame, ch).to_le_bytes();
            out.extend(std::iter::repeat_n(0u8, bytes_per_sample - 2));
            out.extend_from_slice(&value);
        }
    }
    out
}

/// 16-bit PCM WAV source synthesised on demand, for tracks too long to allocate.
pub struct LazyWavSource {
    header: Vec<u8>,
    channels: u16,
    length: u64,
    position: u64,
}

impl LazyWavSource {
    pub fn new(rate: u32, channels: u16, frames: u64) -> Self {
        let data_len = frames * channels as u64 * 2;
        Self {
            header: wav_header(1, channels, rate, 16, channels * 2, data_len as u32),
            channels,
            length: WAV_HEADER_LEN + data_len,
            position: 0,
        }
    }

    fn byte_at(&self, position: u64) -> u8 {
        if position < WAV_HEADER_LEN {
            return self.header[position as usize];
        }
        let offset = position - WAV_HEADER_LEN;
        let sample = offset / 2;
        let frame = sample / self.channels as u64;
        let ch = (sample % self.channels as u64) as usize;
        sample_value(frame, ch).to_le_bytes()[(offset % 2) as usize]
    }
}

impl Read for LazyWavSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (self.length.saturating_sub(self.position) as usize).min(buf.len());
        for (i, b) in buf[..n].iter_mut().enumerate() {
            *b = self.byte_at(self.position + i as u64);
        }
        self.position += n as u64;
        Ok(n)
    }
}

impl SeekableSource for LazyWavSource {
    fn seek_to(&mut self, position: u64) -> io::Result<()> {
        self.position = position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.length)
    }
}

/// Native library double backed by the PCM library, with failure switches and
/// call counters.
#[derive(Default)]
pub struct MockLibrary {
    inner: PcmCodecLibrary,
    reject_configure: bool,
    fail_create: bool,
    created: AtomicUsize,
    configured: AtomicUsize,
    destroyed: AtomicUsize,
}

impl MockLibrary {
    pub fn accepting() -> Self {
        Self::default()
    }

    /// Creates instances but rejects every configuration.
    pub fn rejecting() -> Self {
        Self {
            reject_configure: true,
            ..Self::default()
        }
    }

    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn configured(&self) -> usize {
        self.configured.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.inner.live_instances()
    }
}

impl NativeCodecLibrary for MockLibrary {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports(&self, _codec: CodecType) -> bool {
        true
    }

    fn create(&self) -> InstanceId {
        self.created.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return 0;
        }
        self.inner.create()
    }

    fn configure(&self, instance: InstanceId, config: &NativeConfig<'_>) -> Status {
        self.configured.fetch_add(1, Ordering::SeqCst);
        if self.reject_configure {
            return STATUS_UNSUPPORTED;
        }
        self.inner.configure(instance, config)
    }

    fn fill(&self, instance: InstanceId, data: &[u8], consumed: &mut usize) -> Status {
        self.inner.fill(instance, data, consumed)
    }

    fn decode(&self, instance: InstanceId, out: &mut [i16], written: &mut usize, flush: bool) -> Status {
        self.inner.decode(instance, out, written, flush)
    }

    fn stream_info(&self, instance: InstanceId, info: &mut DecoderFormat) -> Status {
        self.inner.stream_info(instance, info)
    }

    fn destroy(&self, instance: InstanceId) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.inner.destroy(instance);
    }
}
