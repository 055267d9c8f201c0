//! Non-destructive container detection by magic bytes.

use crate::demux::SeekTrim;
use crate::error::{EngineError, Result};
use crate::source::{ProbeCheckpoint, SeekableSource, read_up_to};

/// Bytes inspected when looking for a container signature or an MPEG frame sync.
const SCAN_WINDOW: usize = 4096;

/// Containers the engine can open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerKind {
    Wav,
    Mp4,
    Matroska,
    Ogg(OggCodec),
    Flac,
    Mp3,
    Adts,
}

/// Codec carried by an OGG stream, read from its first page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OggCodec {
    Vorbis,
    Opus,
    Flac,
    Unknown,
}

impl ContainerKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp4 => "mp4",
            Self::Matroska => "matroska",
            Self::Ogg(OggCodec::Vorbis) => "ogg/vorbis",
            Self::Ogg(OggCodec::Opus) => "ogg/opus",
            Self::Ogg(OggCodec::Flac) => "ogg/flac",
            Self::Ogg(OggCodec::Unknown) => "ogg",
            Self::Flac => "flac",
            Self::Mp3 => "mp3",
            Self::Adts => "adts",
        }
    }

    /// File extension used as a hint for the software container readers.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp4 => "mp4",
            Self::Matroska => "mkv",
            Self::Ogg(_) => "ogg",
            Self::Flac => "flac",
            Self::Mp3 => "mp3",
            Self::Adts => "aac",
        }
    }

    /// Seek reconciliation policy for this container.
    pub fn seek_trim(self) -> SeekTrim {
        match self {
            Self::Mp3 | Self::Adts => SeekTrim::Approximate,
            _ => SeekTrim::Exact,
        }
    }
}

/// Identify the container at the current source position.
///
/// The source position is restored before returning.
pub fn detect(source: &mut dyn SeekableSource) -> Result<ContainerKind> {
    let mut head = vec![0u8; SCAN_WINDOW];
    let filled = {
        let mut checkpoint = ProbeCheckpoint::new(source);
        read_up_to(checkpoint.source(), &mut head)?
    };
    head.truncate(filled);
    detect_bytes(&head).ok_or_else(|| EngineError::format("unrecognized container"))
}

/// Identify a container from its leading bytes.
pub fn detect_bytes(head: &[u8]) -> Option<ContainerKind> {
    if head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"WAVE" {
        return Some(ContainerKind::Wav);
    }
    if head.len() >= 8 && &head[4..8] == b"ftyp" {
        return Some(ContainerKind::Mp4);
    }
    if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(ContainerKind::Matroska);
    }
    if head.starts_with(b"OggS") {
        return Some(ContainerKind::Ogg(ogg_codec(head)));
    }
    if head.starts_with(b"fLaC") {
        return Some(ContainerKind::Flac);
    }
    if head.starts_with(b"ID3") {
        return Some(ContainerKind::Mp3);
    }
    scan_frame_sync(head)
}

fn ogg_codec(head: &[u8]) -> OggCodec {
    let Some(&segments) = head.get(26) else {
        return OggCodec::Unknown;
    };
    let payload = head.get(27 + segments as usize..).unwrap_or(&[]);
    if payload.starts_with(b"\x01vorbis") {
        OggCodec::Vorbis
    } else if payload.starts_with(b"OpusHead") {
        OggCodec::Opus
    } else if payload.starts_with(b"\x7fFLAC") {
        OggCodec::Flac
    } else {
        OggCodec::Unknown
    }
}

fn scan_frame_sync(head: &[u8]) -> Option<ContainerKind> {
    head.windows(4).find_map(|w| {
        if w[0] != 0xFF || w[1] & 0xE0 != 0xE0 {
            return None;
        }
        let layer = (w[1] >> 1) & 0x03;
        if w[1] & 0xF0 == 0xF0 && layer == 0 {
            let sampling_index = (w[2] >> 2) & 0x0F;
            return (sampling_index < 13).then_some(ContainerKind::Adts);
        }
        let version = (w[1] >> 3) & 0x03;
        let bitrate_index = w[2] >> 4;
        let rate_index = (w[2] >> 2) & 0x03;
        let valid = version != 1
            && layer == 1
            && bitrate_index != 0
            && bitrate_index != 0x0F
            && rate_index != 0x03;
        valid.then_some(ContainerKind::Mp3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    #[test]
    fn detects_common_signatures() {
        let mut wav = b"RIFF\0\0\0\0WAVEfmt ".to_vec();
        wav.resize(64, 0);
        assert_eq!(detect_bytes(&wav), Some(ContainerKind::Wav));
        assert_eq!(
            detect_bytes(b"\0\0\0\x20ftypM4A \0\0\0\0"),
            Some(ContainerKind::Mp4)
        );
        assert_eq!(
            detect_bytes(&[0x1A, 0x45, 0xDF, 0xA3, 0x01]),
            Some(ContainerKind::Matroska)
        );
        assert_eq!(detect_bytes(b"fLaC\0\0\0\x22"), Some(ContainerKind::Flac));
        assert_eq!(detect_bytes(b"ID3\x04\0\0"), Some(ContainerKind::Mp3));
    }

    #[test]
    fn ogg_codec_comes_from_first_page() {
        let mut page = b"OggS".to_vec();
        page.resize(26, 0);
        page.push(1);
        page.push(30);
        page.extend_from_slice(b"OpusHead");
        assert_eq!(detect_bytes(&page), Some(ContainerKind::Ogg(OggCodec::Opus)));
    }

    #[test]
    fn frame_sync_distinguishes_adts_from_mp3() {
        let mut adts = vec![0u8; 16];
        adts[4..8].copy_from_slice(&[0xFF, 0xF1, 0x50, 0x80]);
        assert_eq!(detect_bytes(&adts), Some(ContainerKind::Adts));

        let mp3 = [0xFF, 0xFB, 0x90, 0x64, 0, 0];
        assert_eq!(detect_bytes(&mp3), Some(ContainerKind::Mp3));

        assert_eq!(detect_bytes(&[0xFF, 0xFB, 0xF0, 0x00]), None);
    }

    #[test]
    fn detection_restores_position() {
        let mut bytes = b"OggS".to_vec();
        bytes.resize(100, 0);
        let mut src = MemorySource::new(bytes);
        assert_eq!(
            detect(&mut src).unwrap(),
            ContainerKind::Ogg(OggCodec::Unknown)
        );
        assert_eq!(src.position(), 0);
    }

    #[test]
    fn seek_trim_policy_per_container() {
        assert_eq!(ContainerKind::Mp3.seek_trim(), SeekTrim::Approximate);
        assert_eq!(ContainerKind::Adts.seek_trim(), SeekTrim::Approximate);
        assert_eq!(ContainerKind::Mp4.seek_trim(), SeekTrim::Exact);
    }
}
