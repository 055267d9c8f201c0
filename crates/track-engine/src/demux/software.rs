//! Demuxer backed by the software container readers.

use std::io;

use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use crate::demux::{
    CodecPacket, ContainerKind, Demuxer, PacketRead, StreamParams, SeekTrim, codec_label,
    frames_to_ms,
};
use crate::error::{EngineError, Result};
use crate::source::{MediaSourceAdapter, SeekableSource};

pub struct SoftwareDemuxer {
    reader: Box<dyn FormatReader>,
    track_id: u32,
    params: StreamParams,
    time_base: Option<TimeBase>,
    duration_ms: Option<u64>,
    seekable: bool,
}

impl SoftwareDemuxer {
    pub fn open(source: Box<dyn SeekableSource>, kind: ContainerKind) -> Result<Self> {
        let seekable = source.can_seek();
        let mss = MediaSourceStream::new(
            Box::new(MediaSourceAdapter::new(source)),
            Default::default(),
        );

        let mut hint = Hint::new();
        hint.with_extension(kind.extension());

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions {
                    enable_gapless: true,
                    ..Default::default()
                },
                &MetadataOptions::default(),
            )
            .map_err(|e| match EngineError::from(e) {
                EngineError::Io(e) => EngineError::format(format!("container read failed: {e}")),
                other => other,
            })?;
        let reader = probed.format;

        let track = reader
            .default_track()
            .filter(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .or_else(|| {
                reader
                    .tracks()
                    .iter()
                    .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            })
            .ok_or_else(|| EngineError::format("no audio track"))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| EngineError::format("unknown sample rate"))?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .or_else(|| codec_params.channel_layout.map(|l| l.into_channels().count() as u16))
            .unwrap_or(0);
        let time_base = codec_params
            .time_base
            .or_else(|| (sample_rate > 0).then(|| TimeBase::new(1, sample_rate)));
        let duration_ms = match (codec_params.n_frames, time_base) {
            (Some(frames), Some(tb)) => Some(time_to_ms(tb.calc_time(frames))),
            _ => None,
        };

        let params = StreamParams {
            container: kind,
            codec: codec_params.codec,
            codec_label: codec_label(codec_params.codec),
            sample_rate,
            channels,
            bits_per_sample: codec_params.bits_per_sample,
            extra_data: codec_params.extra_data.clone(),
            codec_params,
        };

        Ok(Self {
            reader,
            track_id,
            params,
            time_base,
            duration_ms,
            seekable,
        })
    }

    fn ts_to_ms(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) => time_to_ms(tb.calc_time(ts)),
            None => frames_to_ms(ts, self.params.sample_rate),
        }
    }
}

impl Demuxer for SoftwareDemuxer {
    fn params(&self) -> &StreamParams {
        &self.params
    }

    fn next_packet(&mut self) -> Result<PacketRead> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(PacketRead::Exhausted);
                }
                Err(SymphoniaError::ResetRequired) => {
                    tracing::debug!("container reported a new stream, ending track");
                    return Ok(PacketRead::Exhausted);
                }
                Err(e) => return Err(e.into()),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            let timecode_ms = self.ts_to_ms(packet.ts());
            return Ok(PacketRead::Packet(CodecPacket {
                track_id: packet.track_id(),
                ts: packet.ts(),
                dur: packet.dur(),
                timecode_ms,
                data: packet.data,
            }));
        }
    }

    fn seek(&mut self, timecode_ms: u64) -> Result<u64> {
        if !self.seekable {
            return Err(EngineError::SeekUnsupported);
        }
        let mode = match self.seek_trim() {
            SeekTrim::Exact => SeekMode::Accurate,
            SeekTrim::Approximate => SeekMode::Coarse,
        };
        let time = Time::new(timecode_ms / 1000, (timecode_ms % 1000) as f64 / 1000.0);
        let seeked = self.reader.seek(
            mode,
            SeekTo::Time {
                time,
                track_id: Some(self.track_id),
            },
        )?;
        let provided = self.ts_to_ms(seeked.actual_ts).min(timecode_ms);
        tracing::debug!(
            requested_ms = timecode_ms,
            provided_ms = provided,
            required_ts = seeked.required_ts,
            actual_ts = seeked.actual_ts,
            "container seek"
        );
        Ok(provided)
    }

    fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    fn can_seek(&self) -> bool {
        self.seekable
    }
}

fn time_to_ms(time: Time) -> u64 {
    time.seconds
        .saturating_mul(1000)
        .saturating_add((time.frac * 1000.0).round() as u64)
}
