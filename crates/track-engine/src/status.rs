use track_types::{TrackEndReason, TrackState, TrackStatus};

use crate::codec::DecoderBackend;
use crate::demux::StreamParams;
use crate::format::DecoderFormat;

/// Session facts recorded by the executor thread as they become known.
#[derive(Debug, Default)]
pub struct SessionStatus {
    /// Executor lifecycle state.
    pub state: TrackState,
    /// Detected container label.
    pub container: Option<&'static str>,
    /// Source codec label.
    pub codec: Option<&'static str>,
    /// Duration reported by the container.
    pub container_duration_ms: Option<u64>,
    /// Decoder backend settled on by the router.
    pub decoder_backend: Option<DecoderBackend>,
    /// Negotiated decoder format.
    pub decoder_format: Option<DecoderFormat>,
    /// Whether the filter pipeline resamples.
    pub resampling: Option<bool>,
    /// Terminal reason once the session ended.
    pub end_reason: Option<TrackEndReason>,
}

/// Live counters that belong to the frame buffer rather than the session.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferFigures {
    pub position_ms: u64,
    pub buffered_ms: u64,
    pub capacity_ms: u64,
}

impl SessionStatus {
    /// Record what the demuxer found.
    pub fn set_stream(&mut self, params: &StreamParams, duration_ms: Option<u64>) {
        self.container = Some(params.container.label());
        self.codec = Some(params.codec_label);
        self.container_duration_ms = duration_ms;
    }

    /// Snapshot for callers. `duration_ms` is the effective track duration.
    pub fn snapshot(&self, duration_ms: Option<u64>, buffer: BufferFigures) -> TrackStatus {
        TrackStatus {
            state: self.state,
            position_ms: buffer.position_ms,
            duration_ms,
            container: self.container.map(str::to_string),
            codec: self.codec.map(str::to_string),
            decoder_backend: self.decoder_backend.map(|b| b.label().to_string()),
            source_sample_rate: self.decoder_format.map(|f| f.sample_rate),
            source_channels: self.decoder_format.map(|f| f.channels),
            resampling: self.resampling,
            buffered_ms: buffer.buffered_ms,
            buffer_capacity_ms: buffer.capacity_ms,
            end_reason: self.end_reason,
        }
    }

    /// Drop decoder facts once the session is torn down.
    pub fn clear_session(&mut self) {
        self.decoder_backend = None;
        self.decoder_format = None;
        self.resampling = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_carries_decoder_facts() {
        let status = SessionStatus {
            state: TrackState::Playing,
            container: Some("wav"),
            codec: Some("PCM_S16"),
            decoder_backend: Some(DecoderBackend::Native),
            decoder_format: Some(DecoderFormat {
                channels: 2,
                sample_rate: 44_100,
                frame_size: 1024,
            }),
            resampling: Some(true),
            ..SessionStatus::default()
        };
        let snap = status.snapshot(
            Some(180_000),
            BufferFigures {
                position_ms: 1_000,
                buffered_ms: 400,
                capacity_ms: 5_000,
            },
        );
        assert_eq!(snap.state, TrackState::Playing);
        assert_eq!(snap.decoder_backend.as_deref(), Some("native"));
        assert_eq!(snap.source_sample_rate, Some(44_100));
        assert_eq!(snap.position_ms, 1_000);
        assert_eq!(snap.duration_ms, Some(180_000));
    }

    #[test]
    fn clear_session_keeps_state() {
        let mut status = SessionStatus {
            state: TrackState::Stopped,
            decoder_backend: Some(DecoderBackend::Software),
            end_reason: Some(TrackEndReason::Stopped),
            ..SessionStatus::default()
        };
        status.clear_session();
        assert!(status.decoder_backend.is_none());
        assert_eq!(status.state, TrackState::Stopped);
        assert_eq!(status.end_reason, Some(TrackEndReason::Stopped));
    }
}
