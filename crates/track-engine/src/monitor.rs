//! Periodic scan for tracks that stopped producing frames.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::executor::WeakExecutor;

type Tracked = Arc<Mutex<Vec<WeakExecutor>>>;

/// Background thread that asks every registered executor whether it stalled.
///
/// Executors are held weakly and dropped from the list once finished.
pub struct StuckMonitor {
    tracked: Tracked,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StuckMonitor {
    pub fn new(threshold: Duration, interval: Duration) -> io::Result<Self> {
        let tracked: Tracked = Arc::default();
        let (shutdown, shutdown_rx) = bounded(0);
        let scan_list = tracked.clone();
        let handle = thread::Builder::new()
            .name("stuck-monitor".to_string())
            .spawn(move || run(scan_list, shutdown_rx, threshold, interval))?;
        Ok(Self {
            tracked,
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    pub fn register(&self, executor: WeakExecutor) {
        lock(&self.tracked).push(executor);
    }

    /// Executors still being watched.
    pub fn tracked(&self) -> usize {
        lock(&self.tracked).len()
    }
}

impl Drop for StuckMonitor {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(tracked: Tracked, shutdown: Receiver<()>, threshold: Duration, interval: Duration) {
    tracing::debug!(
        threshold_ms = threshold.as_millis() as u64,
        interval_ms = interval.as_millis() as u64,
        "stuck monitor started"
    );
    loop {
        match shutdown.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => scan(&tracked, threshold),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("stuck monitor stopped");
}

fn scan(tracked: &Tracked, threshold: Duration) {
    let live: Vec<_> = {
        let mut list = lock(tracked);
        let mut live = Vec::with_capacity(list.len());
        list.retain(|weak| match weak.upgrade() {
            Some(executor) if !executor.is_finished() => {
                live.push(executor);
                true
            }
            _ => false,
        });
        live
    };
    for executor in live {
        executor.check_stuck(threshold);
    }
}

fn lock(tracked: &Tracked) -> MutexGuard<'_, Vec<WeakExecutor>> {
    tracked.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::{EngineError, Result};
    use crate::executor::TrackExecutor;
    use crate::listener::{ChannelListener, TrackEvent};
    use crate::source::{SeekableSource, SourceOpener};
    use crossbeam_channel::unbounded;
    use std::time::Instant;
    use track_types::TrackDescriptor;

    #[test]
    fn hanging_open_is_reported_once() {
        let (release_tx, release_rx) = bounded::<()>(0);
        let opener: Arc<dyn SourceOpener> =
            Arc::new(move |_: &TrackDescriptor| -> Result<Box<dyn SeekableSource>> {
                let _ = release_rx.recv();
                Err(EngineError::format("never opened"))
            });
        let executor = TrackExecutor::new(
            TrackDescriptor::local("hang.wav"),
            opener,
            Arc::new(EngineConfig::default()),
            None,
        );
        let monitor = StuckMonitor::new(Duration::from_millis(50), Duration::from_millis(10)).unwrap();
        monitor.register(executor.downgrade());

        let (tx, rx) = unbounded();
        let exec = executor.clone();
        let handle = thread::spawn(move || exec.execute(Arc::new(ChannelListener::new(tx))));

        let deadline = Instant::now() + Duration::from_secs(5);
        let stuck = loop {
            let event = rx.recv_deadline(deadline).unwrap();
            if let TrackEvent::Stuck(threshold) = event {
                break threshold;
            }
        };
        assert_eq!(stuck, Duration::from_millis(50));
        thread::sleep(Duration::from_millis(100));
        assert!(!rx.try_iter().any(|e| matches!(e, TrackEvent::Stuck(_))));

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while monitor.tracked() > 0 {
            assert!(Instant::now() < deadline, "finished executor still tracked");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn dropped_executors_are_unregistered() {
        let monitor = StuckMonitor::new(Duration::from_secs(10), Duration::from_millis(10)).unwrap();
        {
            let executor = TrackExecutor::new(
                TrackDescriptor::local("gone.wav"),
                Arc::new(crate::source::FileOpener),
                Arc::new(EngineConfig::default()),
                None,
            );
            monitor.register(executor.downgrade());
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while monitor.tracked() > 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(10));
        }
    }
}
