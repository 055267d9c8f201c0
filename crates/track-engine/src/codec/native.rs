//! Native codec libraries and the owned handle wrapping one instance.
//!
//! A [`NativeCodecLibrary`] mirrors a C codec ABI: opaque instance ids and
//! integer status codes. [`NativeDecoderHandle`] turns that into a safe
//! lifecycle: every entry point is serialized behind a mutex, calls after
//! [`NativeDecoderHandle::close`] fail with [`EngineError::UseAfterClose`], and
//! the instance is destroyed synchronously on close or drop.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use symphonia::core::codecs::CodecType;

use crate::demux::StreamParams;
use crate::error::{EngineError, Result};
use crate::format::DecoderFormat;

/// Opaque instance id. Zero is never a valid instance.
pub type InstanceId = u64;

/// Integer status code returned by native entry points.
pub type Status = i32;

pub const STATUS_OK: Status = 0;
/// More input is required before a frame can be produced.
pub const STATUS_NOT_ENOUGH_BITS: Status = 0x1002;
pub const STATUS_INVALID_HANDLE: Status = 0x2001;
pub const STATUS_UNSUPPORTED: Status = 0x2002;
pub const STATUS_NOT_CONFIGURED: Status = 0x2003;
pub const STATUS_INVALID_DATA: Status = 0x4001;
pub const STATUS_OUTPUT_TOO_SMALL: Status = 0x4002;

/// Decoder configuration passed across the native boundary.
#[derive(Clone, Copy, Debug)]
pub struct NativeConfig<'a> {
    pub codec: CodecType,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u32,
    pub extra_data: &'a [u8],
}

impl<'a> NativeConfig<'a> {
    pub fn from_params(params: &'a StreamParams) -> Self {
        Self {
            codec: params.codec,
            sample_rate: params.sample_rate,
            channels: params.channels,
            bits_per_sample: params.bits_per_sample.unwrap_or(0),
            extra_data: params.extra_data.as_deref().unwrap_or(&[]),
        }
    }
}

/// C-style codec library.
///
/// Implementations must tolerate calls on destroyed or unknown ids by returning
/// [`STATUS_INVALID_HANDLE`]; the handle type never makes such calls.
pub trait NativeCodecLibrary: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, codec: CodecType) -> bool;

    /// Allocate an instance. Returns 0 on failure.
    fn create(&self) -> InstanceId;

    fn configure(&self, instance: InstanceId, config: &NativeConfig<'_>) -> Status;

    /// Append encoded input. `consumed` receives the number of bytes taken.
    fn fill(&self, instance: InstanceId, data: &[u8], consumed: &mut usize) -> Status;

    /// Decode one frame of interleaved samples into `out`.
    ///
    /// With `flush`, a partial frame is emitted from whatever input is buffered.
    fn decode(&self, instance: InstanceId, out: &mut [i16], written: &mut usize, flush: bool)
    -> Status;

    /// Stream format as seen by the decoder. Available once configured.
    fn stream_info(&self, instance: InstanceId, info: &mut DecoderFormat) -> Status;

    fn destroy(&self, instance: InstanceId);
}

/// Lifecycle states of a native handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    Created,
    Configured,
    Decoding,
    Closed,
}

struct HandleInner {
    instance: InstanceId,
    state: HandleState,
}

/// Exclusive owner of one native codec instance.
pub struct NativeDecoderHandle {
    library: Arc<dyn NativeCodecLibrary>,
    inner: Mutex<HandleInner>,
}

impl NativeDecoderHandle {
    pub fn create(library: Arc<dyn NativeCodecLibrary>) -> Result<Self> {
        let instance = library.create();
        if instance == 0 {
            return Err(EngineError::ResourceAcquisition(format!(
                "{} could not create a decoder instance",
                library.name()
            )));
        }
        Ok(Self {
            library,
            inner: Mutex::new(HandleInner {
                instance,
                state: HandleState::Created,
            }),
        })
    }

    pub fn library_name(&self) -> &'static str {
        self.library.name()
    }

    pub fn state(&self) -> HandleState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, HandleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) -> Result<MutexGuard<'_, HandleInner>> {
        let guard = self.lock();
        if guard.state == HandleState::Closed {
            return Err(EngineError::UseAfterClose);
        }
        Ok(guard)
    }

    /// Configure the instance. A rejected configuration is reported as a status.
    pub fn configure(&self, config: &NativeConfig<'_>) -> Result<Status> {
        let mut inner = self.open()?;
        let status = self.library.configure(inner.instance, config);
        if status == STATUS_OK {
            inner.state = HandleState::Configured;
        }
        Ok(status)
    }

    /// Feed encoded bytes. Returns how many were consumed.
    pub fn fill(&self, data: &[u8]) -> Result<usize> {
        let inner = self.open()?;
        let mut consumed = 0;
        match self.library.fill(inner.instance, data, &mut consumed) {
            STATUS_OK => Ok(consumed),
            status => Err(EngineError::recoverable_decode(format!(
                "native fill failed with status {status:#06x}"
            ))),
        }
    }

    /// Decode one frame. `Ok(None)` means more input is needed.
    pub fn decode(&self, out: &mut [i16], flush: bool) -> Result<Option<usize>> {
        let mut inner = self.open()?;
        let mut written = 0;
        match self
            .library
            .decode(inner.instance, out, &mut written, flush)
        {
            STATUS_OK => {
                inner.state = HandleState::Decoding;
                Ok(Some(written))
            }
            STATUS_NOT_ENOUGH_BITS => Ok(None),
            STATUS_NOT_CONFIGURED | STATUS_INVALID_HANDLE => Err(EngineError::fatal_decode(
                "native decoder is not in a decodable state",
            )),
            status => Err(EngineError::recoverable_decode(format!(
                "native decode failed with status {status:#06x}"
            ))),
        }
    }

    /// Negotiated stream format, once the decoder knows it.
    pub fn stream_info(&self) -> Result<Option<DecoderFormat>> {
        let inner = self.open()?;
        let mut info = DecoderFormat {
            channels: 0,
            sample_rate: 0,
            frame_size: 0,
        };
        let status = self.library.stream_info(inner.instance, &mut info);
        Ok((status == STATUS_OK && info.channels > 0 && info.sample_rate > 0).then_some(info))
    }

    /// Release the native instance. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.state != HandleState::Closed {
            self.library.destroy(inner.instance);
            inner.state = HandleState::Closed;
            tracing::debug!(
                library = self.library.name(),
                instance = inner.instance,
                "native decoder closed"
            );
        }
    }
}

impl Drop for NativeDecoderHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PcmCodecLibrary;
    use crate::test_support::MockLibrary;
    use symphonia::core::codecs::{CODEC_TYPE_AAC, CODEC_TYPE_PCM_S16LE};

    fn pcm_config() -> NativeConfig<'static> {
        NativeConfig {
            codec: CODEC_TYPE_PCM_S16LE,
            sample_rate: 8_000,
            channels: 1,
            bits_per_sample: 16,
            extra_data: &[],
        }
    }

    #[test]
    fn lifecycle_moves_through_states() {
        let library = Arc::new(PcmCodecLibrary::new());
        let handle = NativeDecoderHandle::create(library.clone()).unwrap();
        assert_eq!(handle.state(), HandleState::Created);

        assert_eq!(handle.configure(&pcm_config()).unwrap(), STATUS_OK);
        assert_eq!(handle.state(), HandleState::Configured);

        let input: Vec<u8> = (0..2048u16).flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(handle.fill(&input).unwrap(), input.len());
        let mut out = vec![0i16; 4096];
        assert_eq!(handle.decode(&mut out, false).unwrap(), Some(1024));
        assert_eq!(handle.state(), HandleState::Decoding);
        assert_eq!(out[1], 1);

        handle.close();
        assert_eq!(handle.state(), HandleState::Closed);
        assert_eq!(library.live_instances(), 0);
    }

    #[test]
    fn calls_after_close_fail() {
        let handle = NativeDecoderHandle::create(Arc::new(PcmCodecLibrary::new())).unwrap();
        handle.close();
        handle.close();
        assert!(matches!(
            handle.configure(&pcm_config()),
            Err(EngineError::UseAfterClose)
        ));
        assert!(matches!(handle.fill(&[0, 0]), Err(EngineError::UseAfterClose)));
        assert!(matches!(
            handle.decode(&mut [0i16; 16], true),
            Err(EngineError::UseAfterClose)
        ));
        assert!(matches!(handle.stream_info(), Err(EngineError::UseAfterClose)));
    }

    #[test]
    fn rejected_configuration_is_a_status() {
        let handle = NativeDecoderHandle::create(Arc::new(PcmCodecLibrary::new())).unwrap();
        let config = NativeConfig {
            codec: CODEC_TYPE_AAC,
            ..pcm_config()
        };
        assert_eq!(handle.configure(&config).unwrap(), STATUS_UNSUPPORTED);
        assert_eq!(handle.state(), HandleState::Created);
    }

    #[test]
    fn insufficient_input_is_not_an_error() {
        let handle = NativeDecoderHandle::create(Arc::new(PcmCodecLibrary::new())).unwrap();
        handle.configure(&pcm_config()).unwrap();
        handle.fill(&[1, 0, 2, 0]).unwrap();
        let mut out = [0i16; 2048];
        assert_eq!(handle.decode(&mut out, false).unwrap(), None);
        assert_eq!(handle.decode(&mut out, true).unwrap(), Some(2));
        assert_eq!(&out[..2], &[1, 2]);
    }

    #[test]
    fn drop_destroys_instance() {
        let library = Arc::new(MockLibrary::accepting());
        {
            let _handle = NativeDecoderHandle::create(library.clone()).unwrap();
            assert_eq!(library.live(), 1);
        }
        assert_eq!(library.live(), 0);
        assert_eq!(library.destroyed(), 1);
    }

    #[test]
    fn failed_creation_is_resource_acquisition() {
        let library = Arc::new(MockLibrary::failing_create());
        assert!(matches!(
            NativeDecoderHandle::create(library),
            Err(EngineError::ResourceAcquisition(_))
        ));
    }
}
