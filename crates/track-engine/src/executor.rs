//! Drives one track from its byte source to the frame buffer.
//!
//! `execute` runs the whole playback session on the calling thread (normally a
//! [`PlaybackPool`](crate::pool::PlaybackPool) worker). Every other method is
//! safe to call from any thread while the session runs: the consumer pulls
//! frames with [`TrackExecutor::provide`], control threads seek and stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use track_types::{TrackDescriptor, TrackEndReason, TrackState, TrackStatus};

use crate::buffer::{FrameBuffer, Take};
use crate::codec::NativeCodecLibrary;
use crate::config::EngineConfig;
use crate::demux::{ContainerDemuxer, Demuxer, PacketRead};
use crate::error::{EngineError, Result};
use crate::filter::FrameSink;
use crate::format::AudioFrame;
use crate::listener::TrackListener;
use crate::markers::{MarkerId, MarkerTracker, TrackMarker};
use crate::router::CodecPacketRouter;
use crate::source::SourceOpener;
use crate::status::{BufferFigures, SessionStatus};

const EOF_POLL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct Control {
    pending_seek: Option<u64>,
    stop: bool,
    /// A session owns decoder resources right now.
    session_open: bool,
}

struct ExecutorShared {
    descriptor: TrackDescriptor,
    opener: Arc<dyn SourceOpener>,
    config: Arc<EngineConfig>,
    native_library: Option<Arc<dyn NativeCodecLibrary>>,
    buffer: FrameBuffer,
    markers: MarkerTracker,
    control: Mutex<Control>,
    control_cv: Condvar,
    status: Mutex<SessionStatus>,
    listener: Mutex<Option<Arc<dyn TrackListener>>>,
    thread: Mutex<Option<ThreadId>>,
    started: AtomicBool,
    end_fired: AtomicBool,
    stuck_reported: AtomicBool,
}

enum SessionEnd {
    Drained,
    Stopped,
}

enum AfterEof {
    Drained,
    Stop,
    Seek,
}

/// Handle to one track execution. Clones share the same session.
#[derive(Clone)]
pub struct TrackExecutor {
    shared: Arc<ExecutorShared>,
}

/// Non-owning reference used by the stuck monitor.
#[derive(Clone)]
pub struct WeakExecutor(Weak<ExecutorShared>);

impl WeakExecutor {
    pub fn upgrade(&self) -> Option<TrackExecutor> {
        self.0.upgrade().map(|shared| TrackExecutor { shared })
    }
}

struct BufferSink<'a> {
    buffer: &'a FrameBuffer,
}

impl FrameSink for BufferSink<'_> {
    fn accept(&mut self, frame: AudioFrame) -> Result<()> {
        self.buffer.put(frame)
    }
}

impl TrackExecutor {
    pub fn new(
        descriptor: TrackDescriptor,
        opener: Arc<dyn SourceOpener>,
        config: Arc<EngineConfig>,
        native_library: Option<Arc<dyn NativeCodecLibrary>>,
    ) -> Self {
        let buffer = FrameBuffer::new(config.effective_buffer_ms(), config.effective_frame_ms());
        Self {
            shared: Arc::new(ExecutorShared {
                descriptor,
                opener,
                config,
                native_library,
                buffer,
                markers: MarkerTracker::new(),
                control: Mutex::new(Control::default()),
                control_cv: Condvar::new(),
                status: Mutex::new(SessionStatus::default()),
                listener: Mutex::new(None),
                thread: Mutex::new(None),
                started: AtomicBool::new(false),
                end_fired: AtomicBool::new(false),
                stuck_reported: AtomicBool::new(false),
            }),
        }
    }

    pub fn descriptor(&self) -> &TrackDescriptor {
        &self.shared.descriptor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn downgrade(&self) -> WeakExecutor {
        WeakExecutor(Arc::downgrade(&self.shared))
    }

    /// Run the playback session to completion, failure or stop.
    ///
    /// Only the first call does anything.
    pub fn execute(&self, listener: Arc<dyn TrackListener>) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            tracing::warn!(track = %self.shared.descriptor.identifier, "track already executed");
            return;
        }
        *lock(&self.shared.listener) = Some(listener.clone());
        *lock(&self.shared.thread) = Some(thread::current().id());

        {
            let mut control = lock(&self.shared.control);
            if control.stop {
                drop(control);
                self.end_track(TrackEndReason::Stopped);
                return;
            }
            control.session_open = true;
        }

        tracing::info!(
            track = %self.shared.descriptor.identifier,
            uri = %self.shared.descriptor.uri,
            "track execution started"
        );
        self.set_state(TrackState::Loading);
        self.shared.buffer.mark_progress();
        listener.on_start(self);

        let outcome = self.run_session(listener.as_ref());

        {
            let mut control = lock(&self.shared.control);
            control.session_open = false;
            control.pending_seek = None;
        }
        self.shared.control_cv.notify_all();

        match outcome {
            Ok(SessionEnd::Drained) => self.end_track(TrackEndReason::Finished),
            Ok(SessionEnd::Stopped) => self.end_track(TrackEndReason::Stopped),
            Err(e) => {
                tracing::error!(track = %self.shared.descriptor.identifier, "track failed: {e}");
                self.shared.buffer.close();
                listener.on_exception(self, &e, true);
                self.end_track(TrackEndReason::LoadFailed);
            }
        }
    }

    /// Seek to `position_ms`. Ignored once the track ended.
    pub fn set_position(&self, position_ms: u64) {
        if self.state().is_terminal() {
            tracing::debug!(position_ms, "seek ignored on ended track");
            return;
        }
        {
            let mut control = lock(&self.shared.control);
            if control.stop {
                return;
            }
            control.pending_seek = Some(position_ms);
            if !self.shared.config.seek_ghosting {
                self.shared.buffer.discard_pending(position_ms);
            }
            self.shared.buffer.seek_requested();
            self.shared.buffer.interrupt_producer();
        }
        self.shared.control_cv.notify_all();
        self.shared.markers.check_seek_timecode(position_ms);
        tracing::info!(position_ms, "seek requested");
    }

    /// Stop the track. Idempotent.
    ///
    /// Returns once the session released its decoder, or after the configured
    /// stop wait. Called from the executing thread it returns immediately and the
    /// teardown completes as that thread unwinds.
    pub fn stop(&self) {
        let mut control = lock(&self.shared.control);
        if !control.stop {
            control.stop = true;
            tracing::info!(track = %self.shared.descriptor.identifier, "stop requested");
        }
        self.shared.buffer.interrupt_producer();
        self.shared.buffer.close();
        self.shared.control_cv.notify_all();

        if !self.shared.started.load(Ordering::SeqCst) {
            drop(control);
            self.set_state(TrackState::Stopped);
            return;
        }
        if *lock(&self.shared.thread) == Some(thread::current().id()) {
            return;
        }

        let deadline = Instant::now() + self.shared.config.stop_wait();
        while control.session_open {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    track = %self.shared.descriptor.identifier,
                    "session did not release its decoder within the stop wait"
                );
                return;
            }
            control = self
                .shared
                .control_cv
                .wait_timeout(control, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Next output frame, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout and once the track ended. Drained frames are
    /// reported to the marker tracker. After the last frame the end is reported
    /// by the executing thread once the session is torn down; `provide` waits
    /// for that teardown up to `timeout`.
    pub fn provide(&self, timeout: Duration) -> Option<AudioFrame> {
        match self.shared.buffer.take(timeout) {
            Take::Frame(frame) => {
                self.shared.markers.check_playback_timecode(frame.timecode_ms);
                Some(frame)
            }
            Take::Finished => {
                self.wait_for_teardown(timeout);
                None
            }
            Take::TimedOut | Take::Closed => None,
        }
    }

    /// Output-side position. A seek that was requested but not applied yet
    /// reports its target.
    pub fn position(&self) -> u64 {
        if let Some(target) = lock(&self.shared.control).pending_seek {
            return target;
        }
        self.shared.buffer.position_ms()
    }

    /// Track duration: the descriptor's when known, otherwise the container's.
    pub fn duration(&self) -> Option<u64> {
        self.shared
            .descriptor
            .known_duration_ms()
            .or_else(|| lock(&self.shared.status).container_duration_ms)
    }

    pub fn state(&self) -> TrackState {
        lock(&self.shared.status).state
    }

    pub fn status(&self) -> TrackStatus {
        let buffer = &self.shared.buffer;
        let figures = BufferFigures {
            position_ms: self.position(),
            buffered_ms: buffer.buffered_ms(),
            capacity_ms: buffer.capacity_ms(),
        };
        let duration = self.duration();
        lock(&self.shared.status).snapshot(duration, figures)
    }

    /// Whether the session ended and released its resources.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal() && !lock(&self.shared.control).session_open
    }

    /// Replace all markers with `marker`.
    pub fn set_marker(&self, marker: Option<TrackMarker>) -> Option<MarkerId> {
        self.shared.markers.set(marker, self.position())
    }

    pub fn add_marker(&self, marker: TrackMarker) -> Option<MarkerId> {
        self.shared.markers.add(marker, self.position())
    }

    pub fn remove_marker(&self, id: MarkerId) -> bool {
        self.shared.markers.remove(id)
    }

    pub fn clear_markers(&self) {
        self.shared.markers.clear();
    }

    /// Raise `on_stuck` once per stall longer than `threshold`.
    pub fn check_stuck(&self, threshold: Duration) {
        if !matches!(
            self.state(),
            TrackState::Loading | TrackState::Playing | TrackState::Seeking
        ) {
            return;
        }
        match self.shared.buffer.stalled_for() {
            Some(stalled) if stalled >= threshold => {
                if !self.shared.stuck_reported.swap(true, Ordering::SeqCst) {
                    tracing::warn!(
                        track = %self.shared.descriptor.identifier,
                        stalled_ms = stalled.as_millis() as u64,
                        "track appears stuck"
                    );
                    if let Some(listener) = self.listener() {
                        listener.on_stuck(self, threshold);
                    }
                }
            }
            _ => self.shared.stuck_reported.store(false, Ordering::SeqCst),
        }
    }

    fn run_session(&self, listener: &dyn TrackListener) -> Result<SessionEnd> {
        let source = self.shared.opener.open(&self.shared.descriptor)?;
        if lock(&self.shared.control).stop {
            return Ok(SessionEnd::Stopped);
        }
        let mut demuxer = ContainerDemuxer::open(source)?;
        lock(&self.shared.status).set_stream(demuxer.params(), demuxer.duration_ms());

        let mut router = CodecPacketRouter::new(
            demuxer.params().clone(),
            demuxer.seek_trim(),
            self.shared.config.clone(),
            self.shared.native_library.clone(),
        );
        let result = self.decode_loop(&mut demuxer, &mut router, listener);

        router.close();
        lock(&self.shared.status).clear_session();
        tracing::info!(
            track = %self.shared.descriptor.identifier,
            position_ms = self.shared.buffer.position_ms(),
            "session torn down"
        );
        result
    }

    fn decode_loop(
        &self,
        demuxer: &mut ContainerDemuxer,
        router: &mut CodecPacketRouter,
        listener: &dyn TrackListener,
    ) -> Result<SessionEnd> {
        let buffer = &self.shared.buffer;
        let mut sink = BufferSink { buffer };
        let mut demux_errors = 0usize;
        self.set_state(TrackState::Playing);

        loop {
            let seek = {
                let mut control = lock(&self.shared.control);
                buffer.clear_interrupt();
                if control.stop {
                    return Ok(SessionEnd::Stopped);
                }
                control.pending_seek.take()
            };
            if let Some(target) = seek {
                self.apply_seek(demuxer, router, target, listener)?;
            }

            match demuxer.next_packet() {
                Ok(PacketRead::Packet(packet)) => {
                    demux_errors = 0;
                    match router.process(&packet, &mut sink) {
                        Ok(()) | Err(EngineError::Interrupted) => {}
                        Err(e) => return Err(e),
                    }
                    self.record_router(router);
                }
                Ok(PacketRead::Exhausted) => {
                    match router.flush(&mut sink) {
                        Ok(()) => {}
                        Err(EngineError::Interrupted) => continue,
                        Err(e) => return Err(e),
                    }
                    self.record_router(router);
                    {
                        let control = lock(&self.shared.control);
                        if control.pending_seek.is_none() {
                            buffer.finish();
                        }
                    }
                    tracing::debug!(
                        track = %self.shared.descriptor.identifier,
                        "decoding reached end of stream"
                    );
                    match self.wait_after_eof() {
                        AfterEof::Drained => return Ok(SessionEnd::Drained),
                        AfterEof::Stop => return Ok(SessionEnd::Stopped),
                        AfterEof::Seek => continue,
                    }
                }
                Err(e) if !e.is_fatal() => {
                    demux_errors += 1;
                    if demux_errors > self.shared.config.max_decode_errors {
                        return Err(EngineError::fatal_decode(format!(
                            "{demux_errors} consecutive read errors, last: {e}"
                        )));
                    }
                    tracing::warn!("skipping unreadable packet: {e}");
                    listener.on_exception(self, &e, false);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn apply_seek(
        &self,
        demuxer: &mut ContainerDemuxer,
        router: &mut CodecPacketRouter,
        requested_ms: u64,
        listener: &dyn TrackListener,
    ) -> Result<()> {
        let ghosting = self.shared.config.seek_ghosting;
        self.set_state(TrackState::Seeking);
        let provided_ms = match demuxer.seek(requested_ms) {
            Ok(provided) => provided,
            Err(EngineError::SeekUnsupported) => {
                tracing::warn!(requested_ms, "source cannot seek, playback continues");
                if !ghosting {
                    self.shared.buffer.start_epoch(false);
                }
                listener.on_exception(self, &EngineError::SeekUnsupported, false);
                self.set_state(TrackState::Playing);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let epoch = self.shared.buffer.start_epoch(ghosting);
        router.seek_performed(requested_ms, provided_ms)?;
        tracing::info!(requested_ms, provided_ms, epoch, ghosting, "seek performed");
        self.set_state(TrackState::Playing);
        Ok(())
    }

    fn wait_after_eof(&self) -> AfterEof {
        let mut control = lock(&self.shared.control);
        loop {
            if control.stop {
                return AfterEof::Stop;
            }
            if control.pending_seek.is_some() {
                return AfterEof::Seek;
            }
            if self.shared.buffer.is_drained() || self.shared.buffer.is_closed() {
                return AfterEof::Drained;
            }
            control = self
                .shared
                .control_cv
                .wait_timeout(control, EOF_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wake the executing thread after the consumer drained the last frame and
    /// wait until it reported the end.
    fn wait_for_teardown(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut control = lock(&self.shared.control);
        self.shared.control_cv.notify_all();
        while !self.state().is_terminal() && self.shared.buffer.is_drained() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            control = self
                .shared
                .control_cv
                .wait_timeout(control, remaining.min(EOF_POLL))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn record_router(&self, router: &CodecPacketRouter) {
        let mut status = lock(&self.shared.status);
        status.decoder_backend = router.backend();
        status.decoder_format = router.decoder_format();
        status.resampling = router.resampling();
    }

    fn set_state(&self, state: TrackState) {
        let mut status = lock(&self.shared.status);
        if !status.state.is_terminal() {
            status.state = state;
        }
    }

    fn end_track(&self, reason: TrackEndReason) {
        if self.shared.end_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut status = lock(&self.shared.status);
            status.state = match reason {
                TrackEndReason::Finished => TrackState::Finished,
                TrackEndReason::Stopped => TrackState::Stopped,
                TrackEndReason::LoadFailed => TrackState::Failed,
            };
            status.end_reason = Some(reason);
        }
        self.shared.control_cv.notify_all();
        tracing::info!(
            track = %self.shared.descriptor.identifier,
            ?reason,
            "track ended"
        );
        if let Some(listener) = self.listener() {
            listener.on_end(self, reason);
        }
    }

    fn listener(&self) -> Option<Arc<dyn TrackListener>> {
        lock(&self.shared.listener).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
