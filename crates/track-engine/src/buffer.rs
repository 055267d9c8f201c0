//! Bounded frame buffer between the decode thread and the consumer.
//!
//! Capacity is expressed in milliseconds and converted to a frame count from the
//! fixed output frame duration. Every frame is tagged with the producer epoch it
//! was decoded in; a seek starts a new epoch, and frames from older epochs are
//! dropped by the consumer once they are no longer accepted.
//!
//! With seek-ghosting the old frames stay acceptable until the producer inserts
//! the first frame of the new epoch, which clears them. Without ghosting they are
//! discarded as soon as the seek is requested.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Select, Sender, TryRecvError, TrySendError, bounded, select};

use crate::error::{EngineError, Result};
use crate::format::AudioFrame;

const NOT_FINISHED: u64 = u64::MAX;

struct Entry {
    epoch: u64,
    frame: AudioFrame,
}

/// Outcome of [`FrameBuffer::take`].
#[derive(Debug)]
pub enum Take {
    Frame(AudioFrame),
    /// Nothing arrived within the timeout.
    TimedOut,
    /// The producer finished and every frame was drained.
    Finished,
    /// The buffer was closed.
    Closed,
}

#[derive(Default)]
struct Position {
    epoch: u64,
    /// Whether `base_ms` comes from a drained frame rather than a seek target.
    anchored: bool,
    base_ms: u64,
    frames: u64,
    sample_rate: u32,
}

impl Position {
    fn ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return self.base_ms;
        }
        self.base_ms + self.frames * 1000 / self.sample_rate as u64
    }
}

pub struct FrameBuffer {
    tx: Sender<Entry>,
    rx: Receiver<Entry>,
    capacity: usize,
    frame_ms: u64,
    epoch: AtomicU64,
    accept_epoch: AtomicU64,
    finished_epoch: AtomicU64,
    clear_on_insert: AtomicBool,
    interrupt: AtomicBool,
    closed: AtomicBool,
    producer_blocked: AtomicBool,
    producer_wake: (Sender<()>, Receiver<()>),
    consumer_wake: (Sender<()>, Receiver<()>),
    position: Mutex<Position>,
    last_progress: Mutex<Instant>,
    created: Instant,
    low_watermark_ms: AtomicU64,
}

impl FrameBuffer {
    /// Buffer holding `buffer_ms` of audio in frames of `frame_ms`.
    pub fn new(buffer_ms: u64, frame_ms: u64) -> Self {
        let frame_ms = frame_ms.max(1);
        let capacity = buffer_ms.div_ceil(frame_ms).max(1) as usize;
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            frame_ms,
            epoch: AtomicU64::new(0),
            accept_epoch: AtomicU64::new(0),
            finished_epoch: AtomicU64::new(NOT_FINISHED),
            clear_on_insert: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            producer_blocked: AtomicBool::new(false),
            producer_wake: bounded(1),
            consumer_wake: bounded(1),
            position: Mutex::new(Position::default()),
            last_progress: Mutex::new(Instant::now()),
            created: Instant::now(),
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    /// Capacity in frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn capacity_ms(&self) -> u64 {
        self.capacity as u64 * self.frame_ms
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn buffered_ms(&self) -> u64 {
        self.rx.len() as u64 * self.frame_ms
    }

    /// Enqueue a frame of the current epoch, blocking while the buffer is full.
    ///
    /// Returns [`EngineError::Interrupted`] when the producer is interrupted or
    /// the buffer is closed while waiting.
    pub fn put(&self, frame: AudioFrame) -> Result<()> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        if self.clear_on_insert.swap(false, Ordering::SeqCst) {
            self.clear_stale(epoch);
        }
        self.mark_progress();

        let mut entry = Entry { epoch, frame };
        loop {
            if self.closed.load(Ordering::SeqCst) || self.interrupt.load(Ordering::SeqCst) {
                self.producer_blocked.store(false, Ordering::SeqCst);
                return Err(EngineError::Interrupted);
            }
            match self.tx.try_send(entry) {
                Ok(()) => {
                    self.producer_blocked.store(false, Ordering::SeqCst);
                    return Ok(());
                }
                Err(TrySendError::Full(e)) => entry = e,
                Err(TrySendError::Disconnected(_)) => return Err(EngineError::Interrupted),
            }

            self.producer_blocked.store(true, Ordering::SeqCst);
            let mut sel = Select::new();
            let send_op = sel.send(&self.tx);
            let wake_op = sel.recv(&self.producer_wake.1);
            let oper = sel.select();
            if oper.index() == send_op {
                self.producer_blocked.store(false, Ordering::SeqCst);
                return oper
                    .send(&self.tx, entry)
                    .map_err(|_| EngineError::Interrupted);
            }
            debug_assert_eq!(oper.index(), wake_op);
            let _ = oper.recv(&self.producer_wake.1);
        }
    }

    /// Next accepted frame, waiting up to `timeout`.
    pub fn take(&self, timeout: Duration) -> Take {
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Take::Closed;
            }
            match self.rx.try_recv() {
                Ok(entry) => {
                    if let Some(frame) = self.accept(entry) {
                        return Take::Frame(frame);
                    }
                    continue;
                }
                Err(TryRecvError::Disconnected) => return Take::Closed,
                Err(TryRecvError::Empty) => {}
            }
            if self.is_drained() {
                return Take::Finished;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Take::TimedOut;
            }
            select! {
                recv(self.rx) -> msg => match msg {
                    Ok(entry) => {
                        if let Some(frame) = self.accept(entry) {
                            return Take::Frame(frame);
                        }
                    }
                    Err(_) => return Take::Closed,
                },
                recv(self.consumer_wake.1) -> _ => {}
                default(remaining) => return Take::TimedOut,
            }
        }
    }

    /// Begin producing at a new position. Returns the new epoch.
    ///
    /// With `ghosting`, frames already buffered keep playing until the first
    /// frame of the new epoch is inserted.
    pub fn start_epoch(&self, ghosting: bool) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if ghosting {
            self.clear_on_insert.store(true, Ordering::SeqCst);
        } else {
            self.accept_epoch.fetch_max(epoch, Ordering::SeqCst);
            self.rx.try_iter().for_each(drop);
        }
        epoch
    }

    /// Drop every buffered frame ahead of a seek to `requested_ms`.
    ///
    /// Frames from the current epoch that are still in flight are refused, and
    /// the reported position jumps to the target right away.
    pub fn discard_pending(&self, requested_ms: u64) {
        let next = self.epoch.load(Ordering::SeqCst) + 1;
        self.accept_epoch.fetch_max(next, Ordering::SeqCst);
        let dropped = self.rx.try_iter().count();
        {
            let mut pos = self.lock_position();
            *pos = Position {
                epoch: next,
                anchored: false,
                base_ms: requested_ms,
                frames: 0,
                sample_rate: pos.sample_rate,
            };
        }
        tracing::debug!(dropped, requested_ms, "buffered frames discarded for seek");
        self.wake_consumer();
    }

    /// Make a blocked or future `put` return [`EngineError::Interrupted`].
    pub fn interrupt_producer(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        let _ = self.producer_wake.0.try_send(());
    }

    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::SeqCst);
        while self.producer_wake.1.try_recv().is_ok() {}
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// The producer reached the end of the stream in the current epoch.
    pub fn finish(&self) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        if self.clear_on_insert.swap(false, Ordering::SeqCst) {
            self.clear_stale(epoch);
        }
        self.finished_epoch.store(epoch, Ordering::SeqCst);
        self.wake_consumer();
    }

    /// A seek is pending, so the stream is no longer finished. The consumer
    /// waits for the new epoch instead of reporting the end.
    pub fn seek_requested(&self) {
        self.finished_epoch.store(NOT_FINISHED, Ordering::SeqCst);
    }

    /// Finished in the current epoch and nothing left to drain.
    pub fn is_drained(&self) -> bool {
        self.finished_epoch.load(Ordering::SeqCst) == self.epoch.load(Ordering::SeqCst)
            && self.rx.is_empty()
    }

    /// Refuse every further operation and wake both sides.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let dropped = self.rx.try_iter().count();
            tracing::debug!(dropped, "frame buffer closed");
        }
        let _ = self.producer_wake.0.try_send(());
        self.wake_consumer();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Output-side position derived from drained frames.
    pub fn position_ms(&self) -> u64 {
        self.lock_position().ms()
    }

    /// Time since the producer last made progress.
    ///
    /// `None` while the producer is held back by a full buffer or has finished,
    /// since neither is a stall.
    pub fn stalled_for(&self) -> Option<Duration> {
        if self.producer_blocked.load(Ordering::SeqCst)
            || self.finished_epoch.load(Ordering::SeqCst) == self.epoch.load(Ordering::SeqCst)
            || self.closed.load(Ordering::SeqCst)
        {
            return None;
        }
        let last = *self
            .last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Some(last.elapsed())
    }

    /// Restart the stall clock, for example when loading begins.
    pub fn mark_progress(&self) {
        *self
            .last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn accept(&self, entry: Entry) -> Option<AudioFrame> {
        if entry.epoch < self.accept_epoch.load(Ordering::SeqCst) {
            return None;
        }
        {
            let mut pos = self.lock_position();
            if !pos.anchored || pos.epoch != entry.epoch {
                *pos = Position {
                    epoch: entry.epoch,
                    anchored: true,
                    base_ms: entry.frame.timecode_ms,
                    frames: 0,
                    sample_rate: entry.frame.format.sample_rate,
                };
            }
            pos.frames += entry.frame.sample_frames as u64;
        }
        self.log_low_watermark();
        Some(entry.frame)
    }

    fn clear_stale(&self, epoch: u64) {
        self.accept_epoch.fetch_max(epoch, Ordering::SeqCst);
        let dropped = self.rx.try_iter().filter(|e| e.epoch < epoch).count();
        tracing::debug!(dropped, epoch, "ghost frames cleared");
    }

    fn wake_consumer(&self) {
        let _ = self.consumer_wake.0.try_send(());
    }

    fn lock_position(&self) -> MutexGuard<'_, Position> {
        self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_low_watermark(&self) {
        let threshold = (self.capacity / 8).max(1);
        let queued = self.rx.len();
        if queued >= threshold
            || self.finished_epoch.load(Ordering::SeqCst) != NOT_FINISHED
        {
            return;
        }
        let now = self.created.elapsed().as_millis() as u64;
        let last = self.low_watermark_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) > 1000 {
            self.low_watermark_ms.store(now, Ordering::Relaxed);
            tracing::info!(
                queued_frames = queued,
                threshold_frames = threshold,
                "frame buffer low watermark"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::OutputFormat;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;

    fn frame(timecode_ms: u64) -> AudioFrame {
        let format = OutputFormat {
            sample_rate: 1_000,
            ..OutputFormat::default()
        };
        AudioFrame {
            timecode_ms,
            sample_frames: 20,
            format,
            data: vec![0; 20 * 4],
        }
    }

    fn take_now(buffer: &FrameBuffer) -> Take {
        buffer.take(Duration::from_millis(10))
    }

    #[test]
    fn capacity_is_derived_from_duration() {
        assert_eq!(FrameBuffer::new(100, 20).capacity(), 5);
        assert_eq!(FrameBuffer::new(110, 20).capacity(), 6);
        assert_eq!(FrameBuffer::new(100, 20).capacity_ms(), 100);
    }

    #[test]
    fn put_blocks_when_full_until_take() {
        let buffer = Arc::new(FrameBuffer::new(100, 20));
        for i in 0..5 {
            buffer.put(frame(i * 20)).unwrap();
        }
        assert_eq!(buffer.buffered_ms(), 100);

        let (tx, rx) = mpsc::channel();
        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                buffer.put(frame(100)).unwrap();
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(matches!(take_now(&buffer), Take::Frame(f) if f.timecode_ms == 0));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        producer.join().unwrap();
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn interrupt_unblocks_producer() {
        let buffer = Arc::new(FrameBuffer::new(20, 20));
        buffer.put(frame(0)).unwrap();
        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.put(frame(20)))
        };
        thread::sleep(Duration::from_millis(50));
        buffer.interrupt_producer();
        assert!(matches!(producer.join().unwrap(), Err(EngineError::Interrupted)));
        buffer.clear_interrupt();
        assert!(!buffer.is_interrupted());
    }

    #[test]
    fn ghosted_frames_play_until_new_epoch_arrives() {
        let buffer = FrameBuffer::new(200, 20);
        for i in 0..3 {
            buffer.put(frame(i * 20)).unwrap();
        }
        buffer.start_epoch(true);
        assert!(matches!(take_now(&buffer), Take::Frame(f) if f.timecode_ms == 0));
        assert!(matches!(take_now(&buffer), Take::Frame(f) if f.timecode_ms == 20));

        buffer.put(frame(5_000)).unwrap();
        assert!(matches!(take_now(&buffer), Take::Frame(f) if f.timecode_ms == 5_000));
        assert_eq!(buffer.position_ms(), 5_020);
        assert!(matches!(take_now(&buffer), Take::TimedOut));
    }

    #[test]
    fn discard_drops_frames_immediately() {
        let buffer = FrameBuffer::new(200, 20);
        buffer.put(frame(0)).unwrap();
        buffer.put(frame(20)).unwrap();
        buffer.discard_pending(3_000);
        assert_eq!(buffer.position_ms(), 3_000);
        // A frame decoded before the producer noticed the seek.
        buffer.put(frame(40)).unwrap();
        assert!(matches!(take_now(&buffer), Take::TimedOut));

        buffer.start_epoch(false);
        buffer.put(frame(3_000)).unwrap();
        assert!(matches!(take_now(&buffer), Take::Frame(f) if f.timecode_ms == 3_000));
        assert_eq!(buffer.position_ms(), 3_020);
    }

    #[test]
    fn finish_reports_after_drain() {
        let buffer = FrameBuffer::new(200, 20);
        buffer.put(frame(0)).unwrap();
        buffer.finish();
        assert!(!buffer.is_drained());
        assert!(matches!(take_now(&buffer), Take::Frame(_)));
        assert!(matches!(take_now(&buffer), Take::Finished));

        buffer.start_epoch(true);
        assert!(!buffer.is_drained());
    }

    #[test]
    fn seek_after_finish_keeps_consumer_waiting() {
        let buffer = FrameBuffer::new(200, 20);
        buffer.put(frame(0)).unwrap();
        buffer.finish();
        assert!(matches!(take_now(&buffer), Take::Frame(_)));
        assert!(buffer.is_drained());

        buffer.seek_requested();
        assert!(!buffer.is_drained());
        assert!(matches!(take_now(&buffer), Take::TimedOut));

        buffer.start_epoch(true);
        buffer.put(frame(0)).unwrap();
        assert!(matches!(take_now(&buffer), Take::Frame(_)));
    }

    #[test]
    fn position_accumulates_drained_frames() {
        let buffer = FrameBuffer::new(200, 20);
        for i in 0..4 {
            buffer.put(frame(i * 20)).unwrap();
        }
        for _ in 0..4 {
            assert!(matches!(take_now(&buffer), Take::Frame(_)));
        }
        assert_eq!(buffer.position_ms(), 80);
    }

    #[test]
    fn close_wakes_consumer() {
        let buffer = Arc::new(FrameBuffer::new(200, 20));
        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.take(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));
        buffer.close();
        assert!(matches!(consumer.join().unwrap(), Take::Closed));
        assert!(matches!(buffer.put(frame(0)), Err(EngineError::Interrupted)));
    }

    #[test]
    fn stall_clock_ignores_full_buffer_and_finish() {
        let buffer = FrameBuffer::new(200, 20);
        assert!(buffer.stalled_for().is_some());
        buffer.finish();
        assert!(buffer.stalled_for().is_none());
    }
}
