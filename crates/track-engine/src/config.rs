use std::time::Duration;

use serde::Deserialize;

use crate::format::OutputFormat;

/// Smallest frame buffer the engine accepts.
pub const MIN_BUFFER_MS: u64 = 200;

/// Engine tuning shared by every stage of a track session.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Format of every frame handed to consumers.
    pub output: OutputFormat,
    /// Duration of one output frame.
    pub frame_ms: u64,
    /// Total audio the frame buffer may hold.
    pub buffer_ms: u64,
    /// Keep draining pre-seek frames until post-seek audio is ready.
    pub seek_ghosting: bool,
    /// No frame for this long marks a track as stuck.
    pub stuck_threshold_ms: u64,
    /// How often the stuck monitor scans executors.
    pub stuck_scan_interval_ms: u64,
    /// Resampler input chunk size in frames.
    pub resample_chunk_frames: usize,
    /// How long `stop()` waits for the session to release its decoder.
    pub stop_wait_ms: u64,
    /// Idle playback threads exit after this long.
    pub thread_keep_alive_ms: u64,
    /// Upper bound on concurrently running playback threads.
    pub max_playback_threads: usize,
    /// Consecutive recoverable decode errors tolerated before giving up.
    pub max_decode_errors: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output: OutputFormat::default(),
            frame_ms: 20,
            buffer_ms: 5_000,
            seek_ghosting: true,
            stuck_threshold_ms: 10_000,
            stuck_scan_interval_ms: 500,
            resample_chunk_frames: 1024,
            stop_wait_ms: 5_000,
            thread_keep_alive_ms: 10_000,
            max_playback_threads: 256,
            max_decode_errors: 3,
        }
    }
}

impl EngineConfig {
    /// Frame buffer duration with the lower bound applied.
    pub fn effective_buffer_ms(&self) -> u64 {
        self.buffer_ms.max(MIN_BUFFER_MS)
    }

    /// Output frame duration, never zero.
    pub fn effective_frame_ms(&self) -> u64 {
        self.frame_ms.clamp(1, 1000)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_millis(self.stuck_threshold_ms)
    }

    pub fn stuck_scan_interval(&self) -> Duration {
        Duration::from_millis(self.stuck_scan_interval_ms.max(10))
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }

    pub fn thread_keep_alive(&self) -> Duration {
        Duration::from_millis(self.thread_keep_alive_ms)
    }
}
