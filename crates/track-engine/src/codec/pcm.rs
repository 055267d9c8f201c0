//! Built-in native library for integer PCM.
//!
//! Accepts 16, 24 and 32-bit little or big endian samples and emits 16-bit
//! frames of [`FRAME_SIZE`] sample frames. Wider samples keep their top 16 bits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use symphonia::core::codecs::{
    CODEC_TYPE_PCM_S16BE, CODEC_TYPE_PCM_S16LE, CODEC_TYPE_PCM_S24BE, CODEC_TYPE_PCM_S24LE,
    CODEC_TYPE_PCM_S32BE, CODEC_TYPE_PCM_S32LE, CodecType,
};

use crate::codec::native::{
    InstanceId, NativeCodecLibrary, NativeConfig, STATUS_INVALID_DATA, STATUS_INVALID_HANDLE,
    STATUS_NOT_CONFIGURED, STATUS_NOT_ENOUGH_BITS, STATUS_OK, STATUS_OUTPUT_TOO_SMALL,
    STATUS_UNSUPPORTED, Status,
};
use crate::format::DecoderFormat;

/// Sample frames per decoded frame.
pub const FRAME_SIZE: usize = 1024;

#[derive(Clone, Copy, Debug)]
struct PcmLayout {
    channels: u16,
    sample_rate: u32,
    bytes_per_sample: usize,
    big_endian: bool,
}

impl PcmLayout {
    fn for_codec(codec: CodecType) -> Option<(usize, bool)> {
        match codec {
            CODEC_TYPE_PCM_S16LE => Some((2, false)),
            CODEC_TYPE_PCM_S16BE => Some((2, true)),
            CODEC_TYPE_PCM_S24LE => Some((3, false)),
            CODEC_TYPE_PCM_S24BE => Some((3, true)),
            CODEC_TYPE_PCM_S32LE => Some((4, false)),
            CODEC_TYPE_PCM_S32BE => Some((4, true)),
            _ => None,
        }
    }

    fn block_bytes(&self) -> usize {
        self.channels as usize * self.bytes_per_sample
    }

    fn sample(&self, bytes: &[u8]) -> i16 {
        let n = self.bytes_per_sample;
        let (hi, lo) = if self.big_endian {
            (bytes[0], bytes[1])
        } else {
            (bytes[n - 1], bytes[n - 2])
        };
        i16::from_be_bytes([hi, lo])
    }
}

#[derive(Default)]
struct PcmInstance {
    layout: Option<PcmLayout>,
    pending: Vec<u8>,
}

/// Integer PCM "codec" exposed through the native ABI.
#[derive(Default)]
pub struct PcmCodecLibrary {
    next_id: AtomicU64,
    instances: Mutex<HashMap<InstanceId, PcmInstance>>,
}

impl PcmCodecLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instances created and not yet destroyed.
    pub fn live_instances(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InstanceId, PcmInstance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NativeCodecLibrary for PcmCodecLibrary {
    fn name(&self) -> &'static str {
        "pcm"
    }

    fn supports(&self, codec: CodecType) -> bool {
        PcmLayout::for_codec(codec).is_some()
    }

    fn create(&self) -> InstanceId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(id, PcmInstance::default());
        id
    }

    fn configure(&self, instance: InstanceId, config: &NativeConfig<'_>) -> Status {
        let mut instances = self.lock();
        let Some(state) = instances.get_mut(&instance) else {
            return STATUS_INVALID_HANDLE;
        };
        let Some((bytes_per_sample, big_endian)) = PcmLayout::for_codec(config.codec) else {
            return STATUS_UNSUPPORTED;
        };
        if config.channels == 0 || config.sample_rate == 0 {
            return STATUS_INVALID_DATA;
        }
        state.layout = Some(PcmLayout {
            channels: config.channels,
            sample_rate: config.sample_rate,
            bytes_per_sample,
            big_endian,
        });
        state.pending.clear();
        STATUS_OK
    }

    fn fill(&self, instance: InstanceId, data: &[u8], consumed: &mut usize) -> Status {
        let mut instances = self.lock();
        let Some(state) = instances.get_mut(&instance) else {
            return STATUS_INVALID_HANDLE;
        };
        if state.layout.is_none() {
            return STATUS_NOT_CONFIGURED;
        }
        state.pending.extend_from_slice(data);
        *consumed = data.len();
        STATUS_OK
    }

    fn decode(
        &self,
        instance: InstanceId,
        out: &mut [i16],
        written: &mut usize,
        flush: bool,
    ) -> Status {
        let mut instances = self.lock();
        let Some(state) = instances.get_mut(&instance) else {
            return STATUS_INVALID_HANDLE;
        };
        let Some(layout) = state.layout else {
            return STATUS_NOT_CONFIGURED;
        };

        let block = layout.block_bytes();
        let available = state.pending.len() / block;
        let frames = if available >= FRAME_SIZE {
            FRAME_SIZE
        } else if flush && available > 0 {
            available
        } else {
            *written = 0;
            return STATUS_NOT_ENOUGH_BITS;
        };

        let samples = frames * layout.channels as usize;
        if out.len() < samples {
            return STATUS_OUTPUT_TOO_SMALL;
        }
        for (dst, src) in out[..samples]
            .iter_mut()
            .zip(state.pending[..frames * block].chunks_exact(layout.bytes_per_sample))
        {
            *dst = layout.sample(src);
        }
        state.pending.drain(..frames * block);
        *written = samples;
        STATUS_OK
    }

    fn stream_info(&self, instance: InstanceId, info: &mut DecoderFormat) -> Status {
        let instances = self.lock();
        let Some(state) = instances.get(&instance) else {
            return STATUS_INVALID_HANDLE;
        };
        let Some(layout) = state.layout else {
            return STATUS_NOT_CONFIGURED;
        };
        *info = DecoderFormat {
            channels: layout.channels,
            sample_rate: layout.sample_rate,
            frame_size: FRAME_SIZE,
        };
        STATUS_OK
    }

    fn destroy(&self, instance: InstanceId) {
        self.lock().remove(&instance);
    }
}
