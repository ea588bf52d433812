//! Bounded worker pool and backoff for sender tasks.
//!
//! A fixed number of workers drain one bounded task queue. Submission never
//! waits: a full queue rejects the task and the caller backs off.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// Every worker is busy and the task queue is full.
    Full,
    /// The pool is shutting down.
    Closed,
}

pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` workers sharing a queue of `capacity` tasks.
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Task>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|n| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        match next {
                            Some(task) => task.await,
                            None => break,
                        }
                    }
                    debug!(worker = n, "worker stopped");
                })
            })
            .collect();
        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    pub fn try_submit(&self, task: Task) -> Result<(), Rejected> {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(Rejected::Closed)?;
        tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Rejected::Full,
            mpsc::error::TrySendError::Closed(_) => Rejected::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stop accepting tasks, run every task already queued, then stop the
    /// workers.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let handles =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker panicked");
            }
        }
    }
}

/// Exponential backoff: floor, 2×floor, 4×floor, … up to a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
            current: floor,
        }
    }

    /// The interval to wait now. Doubles the next one.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Delay before redelivering an action that failed `attempts` times.
///
/// Attempt 1 waits `floor`, each further attempt doubles it, capped at
/// `ceiling`. Large attempt counts are clamped to avoid overflow.
pub fn retry_delay(attempts: u32, floor: Duration, ceiling: Duration) -> Duration {
    let shift = attempts.saturating_sub(1).min(30);
    let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
    floor.saturating_mul(factor).min(ceiling.max(floor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[test]
    fn test_backoff_sequence() {
        let floor = Duration::from_millis(100);
        let mut backoff = Backoff::new(floor, Duration::from_millis(1000));
        assert_eq!(backoff.next(), floor);
        assert_eq!(backoff.next(), floor * 2);
        assert_eq!(backoff.next(), floor * 4);
        assert_eq!(backoff.next(), floor * 8);
        assert_eq!(backoff.next(), Duration::from_millis(1000));
        assert_eq!(backoff.next(), Duration::from_millis(1000));

        backoff.reset();
        assert_eq!(backoff.next(), floor);
    }

    #[test]
    fn test_retry_delay() {
        let floor = Duration::from_millis(50);
        let ceiling = Duration::from_secs(1);
        assert_eq!(retry_delay(1, floor, ceiling), floor);
        assert_eq!(retry_delay(2, floor, ceiling), floor * 2);
        assert_eq!(retry_delay(3, floor, ceiling), floor * 4);
        assert_eq!(retry_delay(10, floor, ceiling), ceiling);
        assert_eq!(retry_delay(u32::MAX, floor, ceiling), ceiling);
        assert_eq!(retry_delay(0, floor, ceiling), floor);
    }

    #[tokio::test]
    async fn test_rejects_when_full() {
        let pool = WorkerPool::new(1, 1);
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());

        let (g, s) = (Arc::clone(&gate), Arc::clone(&started));
        pool.try_submit(Box::pin(async move {
            s.notify_one();
            g.notified().await;
        }))
        .unwrap();
        started.notified().await;

        // The worker is busy; one task fits in the queue, the next does not.
        pool.try_submit(Box::pin(async {})).unwrap();
        assert_eq!(pool.try_submit(Box::pin(async {})), Err(Rejected::Full));

        gate.notify_one();
        pool.shutdown().await;
        assert_eq!(pool.try_submit(Box::pin(async {})), Err(Rejected::Closed));
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let pool = WorkerPool::new(2, 8);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..6 {
            let done = Arc::clone(&done);
            pool.try_submit(Box::pin(async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(pool.is_closed());
    }
}
