//! Embedded software decoders.

use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::formats::Packet;

use crate::demux::{CodecPacket, StreamParams};
use crate::error::{EngineError, Result};
use crate::format::DecoderFormat;

/// One software decoder instance producing interleaved `f32`.
pub struct SoftwareDecoder {
    decoder: Box<dyn Decoder>,
    samples: Option<(SignalSpec, SampleBuffer<f32>)>,
}

impl SoftwareDecoder {
    pub fn new(params: &StreamParams) -> Result<Self> {
        let decoder = symphonia::default::get_codecs()
            .make(&params.codec_params, &DecoderOptions::default())
            .map_err(|e| {
                EngineError::ResourceAcquisition(format!(
                    "no software decoder for {}: {e}",
                    params.codec_label
                ))
            })?;
        Ok(Self {
            decoder,
            samples: None,
        })
    }

    /// Decode one packet. Returns `None` when the packet produced no audio.
    pub fn decode(&mut self, packet: &CodecPacket) -> Result<Option<(DecoderFormat, &[f32])>> {
        let packet = Packet::new_from_slice(packet.track_id, packet.ts, packet.dur, &packet.data);
        let decoded = self.decoder.decode(&packet)?;
        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            return Ok(None);
        }

        let channels = spec.channels.count();
        let reuse = matches!(
            &self.samples,
            Some((cached, buf)) if *cached == spec && buf.capacity() >= frames * channels
        );
        if !reuse {
            let capacity = decoded.capacity().max(frames) as u64;
            self.samples = Some((spec, SampleBuffer::<f32>::new(capacity, spec)));
        }
        let Some((_, buf)) = self.samples.as_mut() else {
            return Ok(None);
        };
        buf.copy_interleaved_ref(decoded);

        let format = DecoderFormat {
            channels: channels as u16,
            sample_rate: spec.rate,
            frame_size: frames,
        };
        Ok(Some((format, buf.samples())))
    }
}
