//! Per-key sequential execution on top of the playback pool.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::pool::{Job, PlaybackPool, PoolError, run_guarded};

type Queues<K> = Arc<Mutex<HashMap<K, VecDeque<Job>>>>;

/// Jobs sharing a key run one after another in submission order. Jobs with
/// different keys may run concurrently.
pub struct OrderedExecutor<K> {
    pool: Arc<PlaybackPool>,
    queues: Queues<K>,
}

impl<K> OrderedExecutor<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(pool: Arc<PlaybackPool>) -> Self {
        Self {
            pool,
            queues: Arc::default(),
        }
    }

    pub fn submit(&self, key: K, job: impl FnOnce() + Send + 'static) -> Result<(), PoolError> {
        let job: Job = Box::new(job);
        {
            let mut queues = lock(&self.queues);
            if let Some(queue) = queues.get_mut(&key) {
                queue.push_back(job);
                return Ok(());
            }
            queues.insert(key.clone(), VecDeque::new());
        }

        let queues = self.queues.clone();
        let runner_key = key.clone();
        let submitted = self.pool.submit(move || drain(queues, runner_key, job));
        if let Err(e) = submitted {
            let dropped = lock(&self.queues).remove(&key).map_or(0, |q| q.len());
            tracing::warn!(dropped, "ordered job rejected: {e}");
            return Err(e);
        }
        Ok(())
    }

    /// Keys with a job running or queued.
    pub fn active_keys(&self) -> usize {
        lock(&self.queues).len()
    }
}

fn drain<K: Eq + Hash>(queues: Queues<K>, key: K, first: Job) {
    let mut job = first;
    loop {
        run_guarded(job);
        let next = {
            let mut map = lock(&queues);
            match map.get_mut(&key).and_then(VecDeque::pop_front) {
                Some(next) => next,
                None => {
                    map.remove(&key);
                    return;
                }
            }
        };
        job = next;
    }
}

fn lock<K>(queues: &Queues<K>) -> MutexGuard<'_, HashMap<K, VecDeque<Job>>> {
    queues.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crossbeam_channel::{bounded, unbounded};
    use std::thread;
    use std::time::{Duration, Instant};

    fn pool() -> Arc<PlaybackPool> {
        Arc::new(PlaybackPool::new(&EngineConfig::default()).unwrap())
    }

    #[test]
    fn same_key_runs_in_submission_order() {
        let ordered = OrderedExecutor::new(pool());
        let (tx, rx) = unbounded();
        for i in 0..20 {
            let tx = tx.clone();
            ordered
                .submit("album", move || {
                    thread::sleep(Duration::from_millis(1));
                    tx.send(i).unwrap();
                })
                .unwrap();
        }
        let seen: Vec<i32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn different_keys_run_concurrently() {
        let ordered = OrderedExecutor::new(pool());
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded(1);
        ordered
            .submit(1u32, move || {
                let _ = gate_rx.recv();
            })
            .unwrap();
        ordered
            .submit(2u32, move || {
                done_tx.send(()).unwrap();
            })
            .unwrap();
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        gate_tx.send(()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while ordered.active_keys() > 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn panic_does_not_block_the_key() {
        let ordered = OrderedExecutor::new(pool());
        let (tx, rx) = bounded(1);
        ordered.submit('k', || panic!("bad job")).unwrap();
        ordered.submit('k', move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
}
