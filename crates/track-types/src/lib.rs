//! Plain data shared between the track engine and its callers.
//!
//! Nothing in here touches audio: these are the descriptor, end reasons and status
//! snapshots that cross the engine boundary.

use serde::{Deserialize, Serialize};

pub mod codec;

/// Duration sentinel for live streams whose length is not known.
pub const DURATION_UNKNOWN: u64 = u64::MAX;

/// Immutable track metadata supplied at load time.
///
/// Shared by value: clones of a track carry equal descriptors, and the playback
/// pipeline never mutates one.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackDescriptor {
    /// Track title.
    pub title: String,
    /// Track author, if known (empty otherwise).
    pub author: String,
    /// Length in milliseconds, [`DURATION_UNKNOWN`] for streams.
    pub duration_ms: u64,
    /// Source-specific identifier.
    pub identifier: String,
    /// `true` for live streams.
    pub is_stream: bool,
    /// Canonical URI, or a local path.
    pub uri: String,
    /// Artwork URL.
    pub artwork_url: Option<String>,
    /// International Standard Recording Code.
    pub isrc: Option<String>,
}

impl TrackDescriptor {
    /// Descriptor for a local file with unknown duration; the engine fills the
    /// duration in from the container once it has been probed.
    pub fn local(path: impl Into<String>) -> Self {
        let uri = path.into();
        let title = uri
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(uri.as_str())
            .to_string();
        Self {
            title,
            author: String::new(),
            duration_ms: DURATION_UNKNOWN,
            identifier: uri.clone(),
            is_stream: false,
            uri,
            artwork_url: None,
            isrc: None,
        }
    }

    /// Known duration in milliseconds, `None` for the unknown sentinel.
    pub fn known_duration_ms(&self) -> Option<u64> {
        (self.duration_ms != DURATION_UNKNOWN).then_some(self.duration_ms)
    }
}

/// Reason why a track execution ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackEndReason {
    /// Every frame was produced and drained.
    Finished,
    /// A fatal error terminated the session.
    LoadFailed,
    /// `stop()` was called.
    Stopped,
}

/// Lifecycle state of a track executor.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Created, `execute` not called yet.
    #[default]
    Idle,
    /// Opening the source and probing the container.
    Loading,
    /// Decoding frames.
    Playing,
    /// Applying a position change.
    Seeking,
    /// Decoding done and every frame drained.
    Finished,
    /// Stopped on request.
    Stopped,
    /// Terminated by a fatal error.
    Failed,
}

impl TrackState {
    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Stopped | Self::Failed)
    }
}

/// Point-in-time view of one executing track.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackStatus {
    /// Executor lifecycle state.
    pub state: TrackState,
    /// Output-side position in milliseconds.
    pub position_ms: u64,
    /// Duration in milliseconds, `None` for live streams.
    pub duration_ms: Option<u64>,
    /// Detected container label (for example `wav`, `mp4`).
    pub container: Option<String>,
    /// Source codec label (for example `PCM_S16`, `AAC`).
    pub codec: Option<String>,
    /// Decoder backend in use (`native` or `software`).
    pub decoder_backend: Option<String>,
    /// Negotiated decoder sample rate.
    pub source_sample_rate: Option<u32>,
    /// Negotiated decoder channel count.
    pub source_channels: Option<u16>,
    /// Whether the filter pipeline resamples.
    pub resampling: Option<bool>,
    /// Duration of audio currently buffered, in milliseconds.
    pub buffered_ms: u64,
    /// Capacity of the frame buffer, in milliseconds.
    pub buffer_capacity_ms: u64,
    /// End reason once the state is terminal.
    pub end_reason: Option<TrackEndReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_descriptor_uses_file_name_as_title() {
        let d = TrackDescriptor::local("/music/album/song.flac");
        assert_eq!(d.title, "song.flac");
        assert_eq!(d.uri, "/music/album/song.flac");
        assert!(d.known_duration_ms().is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(TrackState::Finished.is_terminal());
        assert!(TrackState::Stopped.is_terminal());
        assert!(TrackState::Failed.is_terminal());
        assert!(!TrackState::Seeking.is_terminal());
    }
}
