//! Per-track decoder selection and packet routing.
//!
//! The first packet picks a backend: a native library when one is injected,
//! supports the codec and accepts the configuration, otherwise the embedded
//! software decoder. The choice is kept for the whole track; seeks only
//! recreate a decoder of the same backend.

use std::sync::Arc;

use crate::codec::native::STATUS_OK;
use crate::codec::{
    DecodedSamples, DecoderBackend, NativeCodecLibrary, NativeConfig, NativeDecoderHandle,
    SoftwareDecoder,
};
use crate::config::EngineConfig;
use crate::demux::{CodecPacket, SeekTrim, StreamParams};
use crate::error::{EngineError, Result};
use crate::filter::{FilterPipeline, FrameSink};
use crate::format::DecoderFormat;

/// Output buffer size for native decoders that do not report a frame size.
const DEFAULT_NATIVE_FRAME: usize = 4096;

pub struct CodecPacketRouter {
    params: StreamParams,
    config: Arc<EngineConfig>,
    native_library: Option<Arc<dyn NativeCodecLibrary>>,
    backend: Option<DecoderBackend>,
    native: Option<NativeDecoderHandle>,
    software: Option<SoftwareDecoder>,
    native_out: Vec<i16>,
    downstream: Downstream,
    consecutive_errors: usize,
}

impl CodecPacketRouter {
    pub fn new(
        params: StreamParams,
        trim: SeekTrim,
        config: Arc<EngineConfig>,
        native_library: Option<Arc<dyn NativeCodecLibrary>>,
    ) -> Self {
        Self {
            params,
            downstream: Downstream {
                config: config.clone(),
                trim,
                pipeline: None,
                format: None,
                pending_seek: None,
            },
            config,
            native_library,
            backend: None,
            native: None,
            software: None,
            native_out: Vec::new(),
            consecutive_errors: 0,
        }
    }

    /// Backend chosen for this track, once the first packet was routed.
    pub fn backend(&self) -> Option<DecoderBackend> {
        self.backend
    }

    /// Negotiated decoder format, once the first samples were decoded.
    pub fn decoder_format(&self) -> Option<DecoderFormat> {
        self.downstream.format
    }

    pub fn resampling(&self) -> Option<bool> {
        self.downstream.pipeline.as_ref().map(FilterPipeline::resampling)
    }

    pub fn native_handle(&self) -> Option<&NativeDecoderHandle> {
        self.native.as_ref()
    }

    /// Decode one packet and push the resulting frames into `sink`.
    ///
    /// Recoverable decode errors are absorbed until more than
    /// `max_decode_errors` happen in a row.
    pub fn process(&mut self, packet: &CodecPacket, sink: &mut dyn FrameSink) -> Result<()> {
        self.ensure_decoder()?;
        let result = match self.backend {
            Some(DecoderBackend::Native) => self.decode_native(&packet.data, false, sink),
            _ => self.decode_software(packet, sink),
        };
        match result {
            Ok(()) => {
                self.consecutive_errors = 0;
                Ok(())
            }
            Err(EngineError::Decode {
                message,
                recoverable: true,
            }) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors > self.config.max_decode_errors {
                    return Err(EngineError::fatal_decode(format!(
                        "{} consecutive decode errors, last: {message}",
                        self.consecutive_errors
                    )));
                }
                tracing::warn!(
                    timecode_ms = packet.timecode_ms,
                    errors = self.consecutive_errors,
                    "skipping undecodable packet: {message}"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// End of stream: drain decoder and pipeline.
    pub fn flush(&mut self, sink: &mut dyn FrameSink) -> Result<()> {
        if self.backend == Some(DecoderBackend::Native) && self.native.is_some() {
            self.decode_native(&[], true, sink)?;
        }
        self.downstream.flush(sink)
    }

    /// Drop decoder state after the demuxer moved to `provided_ms`.
    pub fn seek_performed(&mut self, requested_ms: u64, provided_ms: u64) -> Result<()> {
        if let Some(handle) = self.native.take() {
            handle.close();
        }
        self.software = None;
        self.consecutive_errors = 0;
        self.downstream.seek_performed(requested_ms, provided_ms)
    }

    /// Release decoder resources. The native handle stays in place, closed.
    pub fn close(&mut self) {
        if let Some(handle) = &self.native {
            handle.close();
        }
        self.software = None;
    }

    fn ensure_decoder(&mut self) -> Result<()> {
        match self.backend {
            None => {
                let backend = self.select_backend()?;
                self.backend = Some(backend);
            }
            Some(DecoderBackend::Native) if self.native.is_none() => {
                let handle = self.open_native().map_err(|reason| {
                    EngineError::ResourceAcquisition(format!(
                        "native decoder could not be reopened: {reason}"
                    ))
                })?;
                self.install_native(handle)?;
            }
            Some(DecoderBackend::Software) if self.software.is_none() => {
                self.software = Some(SoftwareDecoder::new(&self.params)?);
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn select_backend(&mut self) -> Result<DecoderBackend> {
        match self.open_native() {
            Ok(handle) => {
                tracing::info!(
                    backend = "native",
                    library = handle.library_name(),
                    codec = self.params.codec_label,
                    "decoder selected"
                );
                self.install_native(handle)?;
                Ok(DecoderBackend::Native)
            }
            Err(reason) => {
                if self.native_library.is_some() {
                    tracing::info!(
                        codec = self.params.codec_label,
                        reason = %reason,
                        "native decoder unavailable, falling back to software"
                    );
                }
                let decoder = SoftwareDecoder::new(&self.params).map_err(|e| {
                    EngineError::ResourceAcquisition(format!("{reason}; {e}"))
                })?;
                tracing::info!(
                    backend = "software",
                    codec = self.params.codec_label,
                    "decoder selected"
                );
                self.software = Some(decoder);
                Ok(DecoderBackend::Software)
            }
        }
    }

    /// Create and configure a native instance, or say why not.
    fn open_native(&self) -> std::result::Result<NativeDecoderHandle, String> {
        let Some(library) = &self.native_library else {
            return Err("no native library".to_string());
        };
        if !library.supports(self.params.codec) {
            return Err(format!(
                "{} does not support {}",
                library.name(),
                self.params.codec_label
            ));
        }
        let handle = NativeDecoderHandle::create(library.clone()).map_err(|e| e.to_string())?;
        match handle.configure(&NativeConfig::from_params(&self.params)) {
            Ok(STATUS_OK) => Ok(handle),
            Ok(status) => Err(format!("configuration rejected with status {status:#06x}")),
            Err(e) => Err(e.to_string()),
        }
    }

    fn install_native(&mut self, handle: NativeDecoderHandle) -> Result<()> {
        let samples = handle
            .stream_info()?
            .map(|f| f.frame_size.max(1) * f.channels as usize)
            .unwrap_or(DEFAULT_NATIVE_FRAME * self.params.channels.max(1) as usize);
        if self.native_out.len() < samples {
            self.native_out.resize(samples, 0);
        }
        self.native = Some(handle);
        Ok(())
    }

    fn decode_native(&mut self, data: &[u8], flush: bool, sink: &mut dyn FrameSink) -> Result<()> {
        let Some(handle) = self.native.as_ref() else {
            return Err(EngineError::UseAfterClose);
        };
        drain_native(
            handle,
            &mut self.native_out,
            &mut self.downstream,
            data,
            flush,
            sink,
        )
    }

    fn decode_software(&mut self, packet: &CodecPacket, sink: &mut dyn FrameSink) -> Result<()> {
        let Some(decoder) = self.software.as_mut() else {
            return Err(EngineError::ResourceAcquisition(
                "software decoder missing".to_string(),
            ));
        };
        if let Some((format, samples)) = decoder.decode(packet)? {
            self.downstream
                .emit(format, DecodedSamples::F32(samples), sink)?;
        }
        Ok(())
    }
}

fn drain_native(
    handle: &NativeDecoderHandle,
    out: &mut [i16],
    downstream: &mut Downstream,
    data: &[u8],
    flush: bool,
    sink: &mut dyn FrameSink,
) -> Result<()> {
    let mut offset = 0;
    loop {
        let consumed = if offset < data.len() {
            handle.fill(&data[offset..])?
        } else {
            0
        };
        offset += consumed;

        let mut produced = false;
        while let Some(written) = handle.decode(out, flush)? {
            if written == 0 {
                break;
            }
            produced = true;
            let format = handle.stream_info()?.ok_or_else(|| {
                EngineError::fatal_decode("native decoder reported no stream format")
            })?;
            downstream.emit(format, DecodedSamples::I16(&out[..written]), sink)?;
        }

        if offset >= data.len() {
            return Ok(());
        }
        if consumed == 0 && !produced {
            return Err(EngineError::recoverable_decode(
                "native decoder stopped accepting input",
            ));
        }
    }
}

/// Filter pipeline side of the router, built once the decoder format is known.
struct Downstream {
    config: Arc<EngineConfig>,
    trim: SeekTrim,
    pipeline: Option<FilterPipeline>,
    format: Option<DecoderFormat>,
    /// Seek that happened before the pipeline existed.
    pending_seek: Option<(u64, u64)>,
}

impl Downstream {
    fn emit(
        &mut self,
        format: DecoderFormat,
        samples: DecodedSamples<'_>,
        sink: &mut dyn FrameSink,
    ) -> Result<()> {
        match self.format {
            None => {
                let mut pipeline = FilterPipeline::new(format, &self.config, self.trim)?;
                if let Some((requested, provided)) = self.pending_seek.take() {
                    pipeline.seek_performed(requested, provided)?;
                }
                self.pipeline = Some(pipeline);
                self.format = Some(format);
            }
            Some(known)
                if known.channels != format.channels || known.sample_rate != format.sample_rate =>
            {
                return Err(EngineError::fatal_decode(format!(
                    "decoder format changed mid-stream from {}ch/{}Hz to {}ch/{}Hz",
                    known.channels, known.sample_rate, format.channels, format.sample_rate
                )));
            }
            Some(_) => {}
        }
        match self.pipeline.as_mut() {
            Some(pipeline) => pipeline.process(samples, sink),
            None => Ok(()),
        }
    }

    fn seek_performed(&mut self, requested_ms: u64, provided_ms: u64) -> Result<()> {
        match self.pipeline.as_mut() {
            Some(pipeline) => pipeline.seek_performed(requested_ms, provided_ms),
            None => {
                self.pending_seek = Some((requested_ms, provided_ms));
                Ok(())
            }
        }
    }

    fn flush(&mut self, sink: &mut dyn FrameSink) -> Result<()> {
        match self.pipeline.as_mut() {
            Some(pipeline) => pipeline.flush(sink),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HandleState;
    use crate::codec::PcmCodecLibrary;
    use crate::demux::wav::WavDemuxer;
    use crate::demux::{Demuxer, PacketRead};
    use crate::format::AudioFrame;
    use crate::source::MemorySource;
    use crate::test_support::{MockLibrary, sample_value, wav_bytes};

    fn demuxer(frames: u64) -> WavDemuxer {
        WavDemuxer::open(Box::new(MemorySource::new(wav_bytes(48_000, 2, 16, frames)))).unwrap()
    }

    fn router(demuxer: &WavDemuxer, library: Option<Arc<dyn NativeCodecLibrary>>) -> CodecPacketRouter {
        CodecPacketRouter::new(
            demuxer.params().clone(),
            SeekTrim::Exact,
            Arc::new(EngineConfig::default()),
            library,
        )
    }

    fn run(demuxer: &mut WavDemuxer, router: &mut CodecPacketRouter) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        while let PacketRead::Packet(p) = demuxer.next_packet().unwrap() {
            router.process(&p, &mut frames).unwrap();
        }
        router.flush(&mut frames).unwrap();
        frames
    }

    fn first_sample(frame: &AudioFrame) -> i16 {
        i16::from_le_bytes([frame.data[0], frame.data[1]])
    }

    #[test]
    fn native_library_is_preferred() {
        let mut demuxer = demuxer(4_800);
        let library = Arc::new(PcmCodecLibrary::new());
        let mut router = router(&demuxer, Some(library.clone()));
        let frames = run(&mut demuxer, &mut router);
        assert_eq!(router.backend(), Some(DecoderBackend::Native));
        assert_eq!(frames.iter().map(|f| f.sample_frames).sum::<usize>(), 4_800);
        assert_eq!(first_sample(&frames[1]), sample_value(960, 0));
        router.close();
        assert_eq!(library.live_instances(), 0);
    }

    #[test]
    fn software_is_used_without_native_library() {
        let mut demuxer = demuxer(4_800);
        let mut router = router(&demuxer, None);
        let frames = run(&mut demuxer, &mut router);
        assert_eq!(router.backend(), Some(DecoderBackend::Software));
        assert_eq!(frames.len(), 5);
        assert_eq!(first_sample(&frames[2]), sample_value(1_920, 0));
    }

    #[test]
    fn rejected_configuration_falls_back_once() {
        let mut demuxer = demuxer(9_600);
        let library = Arc::new(MockLibrary::rejecting());
        let mut router = router(&demuxer, Some(library.clone()));
        let mut frames = Vec::new();

        for target in [0u64, 100, 50, 150] {
            let provided = demuxer.seek(target).unwrap();
            router.seek_performed(target, provided).unwrap();
            let PacketRead::Packet(p) = demuxer.next_packet().unwrap() else {
                panic!("expected packet");
            };
            router.process(&p, &mut frames).unwrap();
            assert_eq!(router.backend(), Some(DecoderBackend::Software));
        }
        assert_eq!(library.created(), 1);
        assert_eq!(library.configured(), 1);
        assert_eq!(library.live(), 0);
    }

    #[test]
    fn seek_recreates_native_decoder() {
        let mut demuxer = demuxer(48_000);
        let library = Arc::new(MockLibrary::accepting());
        let mut router = router(&demuxer, Some(library.clone()));
        let mut frames = Vec::new();

        let PacketRead::Packet(p) = demuxer.next_packet().unwrap() else {
            panic!("expected packet");
        };
        router.process(&p, &mut frames).unwrap();
        let provided = demuxer.seek(500).unwrap();
        router.seek_performed(500, provided).unwrap();
        assert_eq!(library.live(), 0);

        frames.clear();
        let PacketRead::Packet(p) = demuxer.next_packet().unwrap() else {
            panic!("expected packet");
        };
        router.process(&p, &mut frames).unwrap();
        assert_eq!(library.created(), 2);
        assert_eq!(frames[0].timecode_ms, 500);
        assert_eq!(first_sample(&frames[0]), sample_value(24_000, 0));
    }

    #[test]
    fn closed_handle_rejects_calls() {
        let mut demuxer = demuxer(2_048);
        let library = Arc::new(MockLibrary::accepting());
        let mut router = router(&demuxer, Some(library.clone()));
        let mut frames = Vec::new();
        let PacketRead::Packet(p) = demuxer.next_packet().unwrap() else {
            panic!("expected packet");
        };
        router.process(&p, &mut frames).unwrap();

        router.close();
        let handle = router.native_handle().unwrap();
        assert_eq!(handle.state(), HandleState::Closed);
        assert!(matches!(
            handle.decode(&mut [0i16; 8], true),
            Err(EngineError::UseAfterClose)
        ));
        assert_eq!(library.live(), 0);
    }

    #[test]
    fn failed_native_creation_falls_back() {
        let mut demuxer = demuxer(960);
        let mut router = router(&demuxer, Some(Arc::new(MockLibrary::failing_create())));
        let frames = run(&mut demuxer, &mut router);
        assert_eq!(router.backend(), Some(DecoderBackend::Software));
        assert_eq!(frames.len(), 1);
    }
}
