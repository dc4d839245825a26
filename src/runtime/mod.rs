//! Serial executors and timers.
//!
//! A `TaskPool` is a FIFO strand: one worker thread draining a flume
//! channel, so everything pushed onto it runs serialized in push order.
//! The algo shards, the journal writers, and the position store writer
//! are all strands. `TimerService` is a shared one-shot timer wheel;
//! fired callbacks are expected to re-post themselves onto a strand.

use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Single-threaded FIFO task executor.
pub struct TaskPool {
    tx: flume::Sender<Task>,
}

impl TaskPool {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = flume::unbounded::<Task>();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in rx.iter() {
                    task();
                }
            })
            .expect("failed to spawn task pool thread");
        Self { tx }
    }

    /// Enqueue a task. Dropped silently if the pool is shut down.
    pub fn push<F: FnOnce() + Send + 'static>(&self, f: F) {
        let _ = self.tx.send(Box::new(f));
    }
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct TimerShared {
    heap: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    wakeup: Condvar,
}

/// Shared one-shot timer service. Callbacks run on the timer thread;
/// callers wrap them to hop back onto the right strand.
pub struct TimerService {
    shared: Arc<TimerShared>,
    seq: AtomicU64,
}

impl TimerService {
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(TimerShared {
            heap: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
        });
        let worker = shared.clone();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let mut due: Vec<Task> = vec![];
                {
                    let mut heap = worker.heap.lock();
                    let now = Instant::now();
                    loop {
                        match heap.peek() {
                            Some(Reverse(head)) if head.at <= now => {
                                if let Some(Reverse(entry)) = heap.pop() {
                                    due.push(entry.task);
                                }
                            }
                            _ => break,
                        }
                    }
                    if due.is_empty() {
                        match heap.peek() {
                            Some(Reverse(head)) => {
                                let wait = head.at.saturating_duration_since(now);
                                let _ = worker.wakeup.wait_for(&mut heap, wait);
                            }
                            None => worker.wakeup.wait(&mut heap),
                        }
                    }
                }
                for task in due {
                    task();
                }
            })
            .expect("failed to spawn timer thread");
        Self {
            shared,
            seq: AtomicU64::new(0),
        }
    }

    pub fn schedule<F: FnOnce() + Send + 'static>(&self, delay: Duration, f: F) {
        let entry = TimerEntry {
            at: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            task: Box::new(f),
        };
        let mut heap = self.shared.heap.lock();
        heap.push(Reverse(entry));
        self.shared.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn task_pool_preserves_fifo_order() {
        let pool = TaskPool::new("test-pool");
        let log = Arc::new(Mutex::new(vec![]));
        let (tx, rx) = flume::bounded(1);
        for i in 0..100 {
            let log = log.clone();
            let tx = tx.clone();
            pool.push(move || {
                log.lock().push(i);
                if i == 99 {
                    let _ = tx.send(());
                }
            });
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*log.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let timers = TimerService::new("test-timer");
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = flume::bounded(2);
        let f1 = fired.clone();
        let tx1 = tx.clone();
        timers.schedule(Duration::from_millis(50), move || {
            f1.fetch_add(1, Ordering::SeqCst);
            let _ = tx1.send(1);
        });
        let f2 = fired.clone();
        timers.schedule(Duration::from_millis(5), move || {
            f2.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(2);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
