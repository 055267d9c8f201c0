//! Lifecycle callbacks for executing tracks.

use std::time::Duration;

use crossbeam_channel::Sender;
use track_types::TrackEndReason;

use crate::error::EngineError;
use crate::executor::TrackExecutor;

/// Receives lifecycle events of a track. Every method defaults to a no-op.
///
/// Calls come from the executor thread, the consumer thread or the stuck
/// monitor, so implementations must not block for long.
pub trait TrackListener: Send + Sync {
    fn on_start(&self, _executor: &TrackExecutor) {}

    fn on_end(&self, _executor: &TrackExecutor, _reason: TrackEndReason) {}

    /// `fatal` errors are followed by `on_end(LoadFailed)`.
    fn on_exception(&self, _executor: &TrackExecutor, _error: &EngineError, _fatal: bool) {}

    /// No frame was produced for at least `threshold`. Whether to stop the
    /// track is up to the listener.
    fn on_stuck(&self, _executor: &TrackExecutor, _threshold: Duration) {}
}

/// Listener that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListener;

impl TrackListener for NoopListener {}

/// Owned form of a listener callback.
#[derive(Clone, Debug, PartialEq)]
pub enum TrackEvent {
    Started,
    Ended(TrackEndReason),
    Exception { message: String, fatal: bool },
    Stuck(Duration),
}

/// Forwards events over a channel, for consumers living on another thread.
#[derive(Clone, Debug)]
pub struct ChannelListener {
    tx: Sender<TrackEvent>,
}

impl ChannelListener {
    pub fn new(tx: Sender<TrackEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: TrackEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("track event receiver dropped");
        }
    }
}

impl TrackListener for ChannelListener {
    fn on_start(&self, _executor: &TrackExecutor) {
        self.send(TrackEvent::Started);
    }

    fn on_end(&self, _executor: &TrackExecutor, reason: TrackEndReason) {
        self.send(TrackEvent::Ended(reason));
    }

    fn on_exception(&self, _executor: &TrackExecutor, error: &EngineError, fatal: bool) {
        self.send(TrackEvent::Exception {
            message: error.to_string(),
            fatal,
        });
    }

    fn on_stuck(&self, _executor: &TrackExecutor, threshold: Duration) {
        self.send(TrackEvent::Stuck(threshold));
    }
}
