//! Thread pool that gives every playing track its own worker.
//!
//! Workers are spawned on demand up to a configured maximum. A worker that sits
//! idle for longer than the keep-alive exits.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::executor::TrackExecutor;
use crate::listener::TrackListener;
use crate::monitor::StuckMonitor;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("playback pool is shut down")]
    ShutDown,
    #[error("all {0} playback threads are busy")]
    Saturated(usize),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),
}

struct PoolInner {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    idle: AtomicUsize,
    workers: AtomicUsize,
    next_id: AtomicUsize,
    max_workers: usize,
    keep_alive: Duration,
    shutdown: AtomicBool,
}

pub struct PlaybackPool {
    inner: Arc<PoolInner>,
    monitor: StuckMonitor,
}

impl PlaybackPool {
    pub fn new(config: &EngineConfig) -> Result<Self, PoolError> {
        let (tx, rx) = unbounded();
        let monitor = StuckMonitor::new(config.stuck_threshold(), config.stuck_scan_interval())?;
        tracing::debug!(
            max_workers = config.max_playback_threads,
            keep_alive_ms = config.thread_keep_alive_ms,
            "playback pool created"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                tx,
                rx,
                idle: AtomicUsize::new(0),
                workers: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                max_workers: config.max_playback_threads.max(1),
                keep_alive: config.thread_keep_alive(),
                shutdown: AtomicBool::new(false),
            }),
            monitor,
        })
    }

    /// Run `executor` on a worker and watch it for stalls.
    pub fn spawn_track(
        &self,
        executor: TrackExecutor,
        listener: Arc<dyn TrackListener>,
    ) -> Result<(), PoolError> {
        let weak = executor.downgrade();
        let track = executor.descriptor().identifier.clone();
        self.submit(move || executor.execute(listener))?;
        self.monitor.register(weak);
        tracing::debug!(%track, "track scheduled");
        Ok(())
    }

    /// Run `job` on an idle worker, or on a new one if none is idle.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), PoolError> {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }
        let job: Job = Box::new(job);

        if inner
            .idle
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return inner.tx.send(job).map_err(|_| PoolError::ShutDown);
        }

        if inner
            .workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < inner.max_workers).then_some(n + 1)
            })
            .is_err()
        {
            tracing::warn!(max = inner.max_workers, "playback pool saturated");
            return Err(PoolError::Saturated(inner.max_workers));
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let worker = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("playback-{id}"))
            .spawn(move || worker_loop(worker, job));
        if let Err(e) = spawned {
            inner.workers.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::Spawn(e));
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.load(Ordering::SeqCst)
    }

    pub fn monitor(&self) -> &StuckMonitor {
        &self.monitor
    }
}

impl Drop for PlaybackPool {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }
}

fn worker_loop(inner: Arc<PoolInner>, first: Job) {
    run_guarded(first);
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        inner.idle.fetch_add(1, Ordering::SeqCst);
        match inner.rx.recv_timeout(inner.keep_alive) {
            Ok(job) => run_guarded(job),
            Err(RecvTimeoutError::Timeout) => {
                let released = inner
                    .idle
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if released {
                    break;
                }
                // A submitter reserved this worker; its job is on the way.
                match inner.rx.recv() {
                    Ok(job) => run_guarded(job),
                    Err(_) => break,
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    inner.workers.fetch_sub(1, Ordering::SeqCst);
    tracing::trace!("playback worker exited");
}

/// Run a job, containing a panic to the job itself.
pub(crate) fn run_guarded(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("pool job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ChannelListener, TrackEvent};
    use crate::source::{MemorySource, SeekableSource, SourceOpener};
    use crate::test_support::wav_bytes;
    use crate::error::Result;
    use crossbeam_channel::bounded;
    use std::time::Instant;
    use track_types::{TrackDescriptor, TrackEndReason};

    fn config(max: usize, keep_alive_ms: u64) -> EngineConfig {
        EngineConfig {
            max_playback_threads: max,
            thread_keep_alive_ms: keep_alive_ms,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn idle_worker_is_reused() {
        let pool = PlaybackPool::new(&config(4, 5_000)).unwrap();
        let (tx, rx) = bounded(2);
        let first = tx.clone();
        pool.submit(move || first.send(thread::current().id()).unwrap())
            .unwrap();
        let a = rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.idle_count() == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        pool.submit(move || tx.send(thread::current().id()).unwrap())
            .unwrap();
        let b = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.worker_count(), 1);
    }

    #[test]
    fn saturated_pool_refuses_work() {
        let pool = PlaybackPool::new(&config(1, 5_000)).unwrap();
        let (release_tx, release_rx) = bounded::<()>(0);
        pool.submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();
        assert!(matches!(pool.submit(|| {}), Err(PoolError::Saturated(1))));
        release_tx.send(()).unwrap();
    }

    #[test]
    fn idle_workers_exit_after_keep_alive() {
        let pool = PlaybackPool::new(&config(4, 20)).unwrap();
        pool.submit(|| {}).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.worker_count() > 0 {
            assert!(Instant::now() < deadline, "worker never exited");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn panicking_job_keeps_worker_alive() {
        let pool = PlaybackPool::new(&config(1, 5_000)).unwrap();
        pool.submit(|| panic!("boom")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.idle_count() == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        let (tx, rx) = bounded(1);
        pool.submit(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn spawned_track_plays_to_the_end() {
        let pool = PlaybackPool::new(&EngineConfig::default()).unwrap();
        let bytes = wav_bytes(48_000, 2, 16, 9_600);
        let opener: Arc<dyn SourceOpener> =
            Arc::new(move |_: &TrackDescriptor| -> Result<Box<dyn SeekableSource>> {
                Ok(Box::new(MemorySource::new(bytes.clone())))
            });
        let executor = TrackExecutor::new(
            TrackDescriptor::local("pool.wav"),
            opener,
            Arc::new(EngineConfig::default()),
            None,
        );
        let (tx, rx) = crossbeam_channel::unbounded();
        pool.spawn_track(executor.clone(), Arc::new(ChannelListener::new(tx)))
            .unwrap();
        assert_eq!(pool.monitor().tracked(), 1);

        let mut frames = 0;
        while executor.provide(Duration::from_secs(5)).is_some() {
            frames += 1;
        }
        assert_eq!(frames, 10);
        let ended = rx
            .iter()
            .find(|e| matches!(e, TrackEvent::Ended(_)))
            .unwrap();
        assert_eq!(ended, TrackEvent::Ended(TrackEndReason::Finished));
    }
}
