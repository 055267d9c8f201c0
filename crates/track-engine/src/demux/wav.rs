//! RIFF/WAVE demuxer for integer PCM.
//!
//! Packets carry up to [`BLOCKS_PER_PACKET`] sample frames with any per-block
//! padding stripped. Seeking is computed directly from the block size, so the
//! provided timecode always equals the requested one.

use symphonia::core::audio::Channels;
use symphonia::core::codecs::{
    CODEC_TYPE_PCM_S16LE, CODEC_TYPE_PCM_S24LE, CODEC_TYPE_PCM_S32LE, CodecParameters, CodecType,
};
use symphonia::core::units::TimeBase;

use crate::demux::{
    CodecPacket, ContainerKind, Demuxer, PacketRead, StreamParams, codec_label, frames_to_ms,
};
use crate::error::{EngineError, Result};
use crate::source::{SeekableSource, read_up_to};

pub const BLOCKS_PER_PACKET: usize = 1024;

const FORMAT_PCM: u16 = 0x0001;
const FORMAT_EXTENSIBLE: u16 = 0xFFFE;
const PCM_SUBFORMAT_GUID: [u8; 16] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
];
const MAX_BLOCK_PADDING: usize = 32;

/// Validated `fmt ` and `data` chunk information.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WavInfo {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// Bytes per block as declared, padding included.
    pub block_align: usize,
    /// Absolute offset of the first sample block.
    pub data_start: u64,
    pub block_count: u64,
}

impl WavInfo {
    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// Block size without padding.
    pub fn min_block_align(&self) -> usize {
        self.channels as usize * self.bytes_per_sample()
    }

    pub fn padding(&self) -> usize {
        self.block_align - self.min_block_align()
    }

    pub fn duration_ms(&self) -> u64 {
        frames_to_ms(self.block_count, self.sample_rate)
    }

    fn codec(&self) -> CodecType {
        match self.bits_per_sample {
            16 => CODEC_TYPE_PCM_S16LE,
            24 => CODEC_TYPE_PCM_S24LE,
            _ => CODEC_TYPE_PCM_S32LE,
        }
    }
}

struct FmtChunk {
    format: u16,
    channels: u16,
    sample_rate: u32,
    block_align: u16,
    bits_per_sample: u16,
    sub_format: Option<[u8; 16]>,
}

pub struct WavDemuxer {
    source: Box<dyn SeekableSource>,
    info: WavInfo,
    params: StreamParams,
    /// Next block to read.
    block: u64,
    raw: Vec<u8>,
}

impl WavDemuxer {
    pub fn open(mut source: Box<dyn SeekableSource>) -> Result<Self> {
        let info = read_header(source.as_mut())?;
        let params = stream_params(&info)?;
        tracing::debug!(
            channels = info.channels,
            rate_hz = info.sample_rate,
            bits = info.bits_per_sample,
            block_align = info.block_align,
            blocks = info.block_count,
            "wav header parsed"
        );
        Ok(Self {
            source,
            info,
            params,
            block: 0,
            raw: vec![0u8; info.block_align * BLOCKS_PER_PACKET],
        })
    }

    pub fn info(&self) -> &WavInfo {
        &self.info
    }
}

impl Demuxer for WavDemuxer {
    fn params(&self) -> &StreamParams {
        &self.params
    }

    fn next_packet(&mut self) -> Result<PacketRead> {
        let remaining = self.info.block_count.saturating_sub(self.block);
        let blocks = remaining.min(BLOCKS_PER_PACKET as u64) as usize;
        if blocks == 0 {
            return Ok(PacketRead::Exhausted);
        }

        let wanted = blocks * self.info.block_align;
        let read = read_up_to(self.source.as_mut(), &mut self.raw[..wanted])?;
        let blocks = read / self.info.block_align;
        if blocks == 0 {
            tracing::debug!(block = self.block, "wav data ended before declared length");
            self.block = self.info.block_count;
            return Ok(PacketRead::Exhausted);
        }

        let min_align = self.info.min_block_align();
        let data: Box<[u8]> = if self.info.padding() == 0 {
            self.raw[..blocks * min_align].into()
        } else {
            self.raw[..blocks * self.info.block_align]
                .chunks_exact(self.info.block_align)
                .flat_map(|block| &block[..min_align])
                .copied()
                .collect()
        };

        let ts = self.block;
        self.block += blocks as u64;
        Ok(PacketRead::Packet(CodecPacket {
            track_id: 0,
            ts,
            dur: blocks as u64,
            timecode_ms: frames_to_ms(ts, self.info.sample_rate),
            data,
        }))
    }

    fn seek(&mut self, timecode_ms: u64) -> Result<u64> {
        if !self.source.can_seek() {
            return Err(EngineError::SeekUnsupported);
        }
        let block = (timecode_ms as u128 * self.info.sample_rate as u128 / 1000) as u64;
        let block = block.min(self.info.block_count);
        let offset = self.info.data_start + block * self.info.block_align as u64;
        self.source.seek_to(offset)?;
        self.block = block;
        Ok(timecode_ms)
    }

    fn duration_ms(&self) -> Option<u64> {
        Some(self.info.duration_ms())
    }

    fn can_seek(&self) -> bool {
        self.source.can_seek()
    }
}

/// Parse the RIFF header up to the start of the sample data.
pub fn read_header(source: &mut dyn SeekableSource) -> Result<WavInfo> {
    let mut riff = [0u8; 12];
    if read_up_to(source, &mut riff)? < riff.len() || &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE"
    {
        return Err(EngineError::format("not a RIFF/WAVE stream"));
    }

    let mut fmt: Option<FmtChunk> = None;
    loop {
        let mut header = [0u8; 8];
        if read_up_to(source, &mut header)? < header.len() {
            return Err(EngineError::format("wav data chunk not found"));
        }
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
        match &header[0..4] {
            b"fmt " => {
                if size < 16 || size > 1024 {
                    return Err(EngineError::format(format!("invalid fmt chunk size {size}")));
                }
                let mut body = vec![0u8; size as usize];
                if read_up_to(source, &mut body)? < body.len() {
                    return Err(EngineError::format("truncated fmt chunk"));
                }
                fmt = Some(parse_fmt(&body));
                if size % 2 == 1 {
                    skip(source, 1)?;
                }
            }
            b"data" => {
                let fmt = fmt.ok_or_else(|| EngineError::format("wav data before fmt chunk"))?;
                let data_start = source.position();
                return validate(fmt, data_start, data_length(source, data_start, size));
            }
            _ => skip(source, size + (size & 1))?,
        }
    }
}

fn parse_fmt(body: &[u8]) -> FmtChunk {
    let u16_at = |i: usize| u16::from_le_bytes([body[i], body[i + 1]]);
    let u32_at = |i: usize| u32::from_le_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);
    let sub_format = (body.len() >= 40).then(|| {
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&body[24..40]);
        guid
    });
    FmtChunk {
        format: u16_at(0),
        channels: u16_at(2),
        sample_rate: u32_at(4),
        block_align: u16_at(12),
        bits_per_sample: u16_at(14),
        sub_format,
    }
}

fn data_length(source: &dyn SeekableSource, data_start: u64, declared: u64) -> u64 {
    let available = source
        .content_length()
        .map(|len| len.saturating_sub(data_start));
    match available {
        Some(available) if declared == 0 || declared == u32::MAX as u64 || declared > available => {
            available
        }
        _ => declared,
    }
}

fn validate(fmt: FmtChunk, data_start: u64, data_len: u64) -> Result<WavInfo> {
    let pcm = match fmt.format {
        FORMAT_PCM => true,
        FORMAT_EXTENSIBLE => fmt.sub_format == Some(PCM_SUBFORMAT_GUID),
        _ => false,
    };
    if !pcm {
        return Err(EngineError::format(format!(
            "unsupported wav format 0x{:04x}",
            fmt.format
        )));
    }
    if !(1..=16).contains(&fmt.channels) {
        return Err(EngineError::format(format!(
            "invalid channel count {}",
            fmt.channels
        )));
    }
    if !(100..=384_000).contains(&fmt.sample_rate) {
        return Err(EngineError::format(format!(
            "invalid sample rate {}",
            fmt.sample_rate
        )));
    }
    if !matches!(fmt.bits_per_sample, 16 | 24 | 32) {
        return Err(EngineError::format(format!(
            "unsupported bits per sample {}",
            fmt.bits_per_sample
        )));
    }

    let bytes_per_sample = fmt.bits_per_sample as usize / 8;
    let min_align = fmt.channels as usize * bytes_per_sample;
    let block_align = fmt.block_align as usize;
    if block_align < min_align
        || block_align > min_align + MAX_BLOCK_PADDING
        || block_align % bytes_per_sample != 0
    {
        return Err(EngineError::format(format!(
            "invalid block align {block_align} for {} channels of {} bits",
            fmt.channels, fmt.bits_per_sample
        )));
    }

    Ok(WavInfo {
        channels: fmt.channels,
        sample_rate: fmt.sample_rate,
        bits_per_sample: fmt.bits_per_sample,
        block_align,
        data_start,
        block_count: data_len / block_align as u64,
    })
}

fn stream_params(info: &WavInfo) -> Result<StreamParams> {
    let mask = (1u32 << info.channels) - 1;
    let channels = Channels::from_bits(mask).ok_or_else(|| {
        EngineError::format(format!("no channel layout for {} channels", info.channels))
    })?;
    let codec = info.codec();
    let mut codec_params = CodecParameters::new();
    codec_params
        .for_codec(codec)
        .with_sample_rate(info.sample_rate)
        .with_time_base(TimeBase::new(1, info.sample_rate))
        .with_bits_per_sample(info.bits_per_sample as u32)
        .with_bits_per_coded_sample(info.bits_per_sample as u32)
        .with_channels(channels)
        .with_max_frames_per_packet(BLOCKS_PER_PACKET as u64)
        .with_frames_per_block(1)
        .with_n_frames(info.block_count);
    Ok(StreamParams {
        container: ContainerKind::Wav,
        codec,
        codec_label: codec_label(codec),
        sample_rate: info.sample_rate,
        channels: info.channels,
        bits_per_sample: Some(info.bits_per_sample as u32),
        extra_data: None,
        codec_params,
    })
}

fn skip(source: &mut dyn SeekableSource, bytes: u64) -> Result<()> {
    let target = source.position() + bytes;
    source.seek_to(target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::test_support::{sample_value, wav_bytes, wav_header};

    fn open(bytes: Vec<u8>) -> Result<WavDemuxer> {
        WavDemuxer::open(Box::new(MemorySource::new(bytes)))
    }

    #[test]
    fn packets_cover_every_block_in_order() {
        let mut demuxer = open(wav_bytes(8_000, 1, 16, 2_500)).unwrap();
        let mut blocks = 0u64;
        let mut last_ts = 0;
        while let PacketRead::Packet(p) = demuxer.next_packet().unwrap() {
            assert!(p.ts >= last_ts);
            last_ts = p.ts;
            assert_eq!(p.data.len() as u64, p.dur * 2);
            blocks += p.dur;
        }
        assert_eq!(blocks, 2_500);
        assert!(matches!(demuxer.next_packet().unwrap(), PacketRead::Exhausted));
    }

    #[test]
    fn seek_lands_on_requested_block() {
        let mut demuxer = open(wav_bytes(44_100, 2, 16, 88_200)).unwrap();
        assert_eq!(demuxer.seek(1_500).unwrap(), 1_500);
        let PacketRead::Packet(p) = demuxer.next_packet().unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(p.ts, 66_150);
        assert_eq!(p.timecode_ms, 1_500);
        let first = i16::from_le_bytes([p.data[0], p.data[1]]);
        assert_eq!(first, sample_value(66_150, 0));
    }

    #[test]
    fn padding_is_stripped_from_blocks() {
        let mut bytes = wav_header(FORMAT_PCM, 1, 8_000, 16, 4, 3 * 4);
        for frame in 0..3u64 {
            bytes.extend_from_slice(&sample_value(frame, 0).to_le_bytes());
            bytes.extend_from_slice(&[0xEE, 0xEE]);
        }
        let mut demuxer = open(bytes).unwrap();
        assert_eq!(demuxer.info().padding(), 2);
        let PacketRead::Packet(p) = demuxer.next_packet().unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(p.data.len(), 6);
        assert!(!p.data.contains(&0xEE));
    }

    #[test]
    fn rejects_invalid_formats() {
        let float = wav_header(0x0003, 2, 44_100, 32, 8, 0);
        assert!(matches!(open(float), Err(EngineError::Format(_))));

        let too_many_channels = wav_header(FORMAT_PCM, 17, 44_100, 16, 34, 0);
        assert!(open(too_many_channels).is_err());

        let low_rate = wav_header(FORMAT_PCM, 2, 50, 16, 4, 0);
        assert!(open(low_rate).is_err());

        let eight_bit = wav_header(FORMAT_PCM, 2, 44_100, 8, 2, 0);
        assert!(open(eight_bit).is_err());

        let bad_align = wav_header(FORMAT_PCM, 2, 44_100, 16, 3, 0);
        assert!(open(bad_align).is_err());

        let huge_padding = wav_header(FORMAT_PCM, 1, 44_100, 16, 2 + 34, 0);
        assert!(open(huge_padding).is_err());
    }

    #[test]
    fn extensible_requires_pcm_subformat() {
        let mut fmt = Vec::new();
        fmt.extend_from_slice(&FORMAT_EXTENSIBLE.to_le_bytes());
        fmt.extend_from_slice(&2u16.to_le_bytes());
        fmt.extend_from_slice(&48_000u32.to_le_bytes());
        fmt.extend_from_slice(&(48_000u32 * 4).to_le_bytes());
        fmt.extend_from_slice(&4u16.to_le_bytes());
        fmt.extend_from_slice(&16u16.to_le_bytes());
        fmt.extend_from_slice(&22u16.to_le_bytes());
        fmt.extend_from_slice(&16u16.to_le_bytes());
        fmt.extend_from_slice(&3u32.to_le_bytes());
        let mut guid = PCM_SUBFORMAT_GUID;

        let build = |guid: &[u8; 16]| {
            let mut out = b"RIFF\0\0\0\0WAVE".to_vec();
            out.extend_from_slice(b"fmt ");
            out.extend_from_slice(&40u32.to_le_bytes());
            out.extend_from_slice(&fmt);
            out.extend_from_slice(guid);
            out.extend_from_slice(b"data");
            out.extend_from_slice(&8u32.to_le_bytes());
            out.extend_from_slice(&[0u8; 8]);
            out
        };

        let demuxer = open(build(&guid)).unwrap();
        assert_eq!(demuxer.info().block_count, 2);

        guid[0] = 0x03;
        assert!(open(build(&guid)).is_err());
    }

    #[test]
    fn unknown_chunks_are_skipped() {
        let mut bytes = b"RIFF\0\0\0\0WAVE".to_vec();
        bytes.extend_from_slice(b"LIST");
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 0]);
        let tail = wav_header(FORMAT_PCM, 1, 8_000, 16, 2, 4);
        bytes.extend_from_slice(&tail[12..]);
        bytes.extend_from_slice(&[1, 0, 2, 0]);
        let demuxer = open(bytes).unwrap();
        assert_eq!(demuxer.info().block_count, 2);
    }
}
