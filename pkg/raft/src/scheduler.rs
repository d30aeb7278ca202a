//! A single-threaded, cooperative delayed-task queue.
//!
//! All role timers (election timeouts, heartbeats, housekeeping) are
//! scheduled through here rather than via ad-hoc `thread::spawn` +
//! `sleep` calls, so that the node can reason about "no two scheduled
//! tasks run concurrently" without its own locking scheme having to
//! account for overlapping timer callbacks.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline (and,
        // for ties, the lowest sequence number, i.e. FIFO) to sort first,
        // so reverse the natural ordering.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<Entry>>,
    condvar: Condvar,
    stopped: AtomicBool,
    next_seq: AtomicU64,
}

/// Handle to the background timer thread. Dropping it stops the thread.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            condvar: Condvar::new(),
            stopped: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("raft-scheduler".into())
            .spawn(move || Self::run(worker_shared))
            .expect("failed to spawn scheduler thread");

        Scheduler {
            shared,
            worker: Some(worker),
        }
    }

    /// Runs `task` no earlier than `delay` from now. Tasks scheduled for
    /// the same deadline run in the order they were submitted.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let seq = self.shared.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let entry = Entry {
            deadline: Instant::now() + delay,
            seq,
            task: Box::new(task),
        };
        let mut heap = self.shared.heap.lock().unwrap();
        heap.push(entry);
        self.shared.condvar.notify_all();
    }

    fn run(shared: Arc<Shared>) {
        loop {
            let entry = {
                let mut heap = shared.heap.lock().unwrap();
                loop {
                    if shared.stopped.load(AtomicOrdering::Relaxed) {
                        return;
                    }
                    match heap.peek() {
                        None => {
                            heap = shared.condvar.wait(heap).unwrap();
                        }
                        Some(top) => {
                            let now = Instant::now();
                            if top.deadline <= now {
                                break;
                            }
                            let wait_for = top.deadline - now;
                            let (new_heap, _timeout) =
                                shared.condvar.wait_timeout(heap, wait_for).unwrap();
                            heap = new_heap;
                        }
                    }
                }
                heap.pop()
            };

            // Run the task with the lock released: a task that itself
            // calls `schedule` must not deadlock against this thread.
            if let Some(entry) = entry {
                (entry.task)();
            }
        }
    }

    pub fn stop(&self) {
        self.shared.stopped.store(true, AtomicOrdering::Relaxed);
        self.shared.condvar.notify_all();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_after_deadline_not_before() {
        let scheduler = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        scheduler.schedule(Duration::from_millis(30), move || {
            tx.send(Instant::now()).unwrap();
        });
        let fired = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(25));
    }

    #[test]
    fn equal_deadlines_run_fifo() {
        let scheduler = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        let deadline = Duration::from_millis(10);
        for i in 0..5 {
            let tx = tx.clone();
            scheduler.schedule(deadline, move || tx.send(i).unwrap());
        }
        let order: Vec<i32> = (0..5).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn tasks_never_overlap() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let max_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..20 {
            let counter = counter.clone();
            let max_seen = max_seen.clone();
            let tx = tx.clone();
            scheduler.schedule(Duration::from_millis(1), move || {
                let now = counter.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                max_seen.fetch_max(now, AtomicOrdering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
                counter.fetch_sub(1, AtomicOrdering::SeqCst);
                tx.send(()).unwrap();
            });
        }
        for _ in 0..20 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert_eq!(max_seen.load(AtomicOrdering::SeqCst), 1);
    }
}
