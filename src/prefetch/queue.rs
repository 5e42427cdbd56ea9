//! Bounded priority queue for prefetch work
//!
//! Higher priority pops first; equal priorities pop in FIFO order.
//! Pushes onto a full queue are refused; prefetching is opportunistic
//! and the next playback-position update retries.

use parking_lot::Mutex;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// One prefetch work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchTask {
    pub fingerprint: String,
    pub index: usize,
    pub priority: i32,
}

#[derive(Debug)]
struct QueuedTask {
    task: PrefetchTask,
    seq: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap on priority; lower sequence wins ties (FIFO)
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded priority queue
pub struct PrefetchQueue {
    heap: Mutex<BinaryHeap<QueuedTask>>,
    capacity: usize,
    notify: Notify,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl PrefetchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity,
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a task. Returns false when the queue is full or closed.
    pub fn push(&self, task: PrefetchTask) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        {
            let mut heap = self.heap.lock();
            if heap.len() >= self.capacity {
                return false;
            }
            heap.push(QueuedTask {
                task,
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
            });
        }
        self.notify.notify_one();
        true
    }

    fn try_pop(&self) -> Option<PrefetchTask> {
        self.heap.lock().pop().map(|q| q.task)
    }

    /// Wait for the next task. Returns None once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<PrefetchTask> {
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.try_pop() {
                return Some(task);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue: pending tasks drain, new pushes are refused,
    /// and idle workers wake up to observe the close.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Drop all queued tasks for one fingerprint.
    pub fn discard_fingerprint(&self, fingerprint: &str) {
        let mut heap = self.heap.lock();
        let remaining: BinaryHeap<QueuedTask> = heap
            .drain()
            .filter(|q| q.task.fingerprint != fingerprint)
            .collect();
        *heap = remaining;
    }
}
