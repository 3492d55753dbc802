//! Fire-and-forget ingestion queue.
//!
//! HTTP handlers enqueue parsed stat batches and answer immediately;
//! a single consumer thread per stats kind applies the increments. The
//! queue is bounded: when full, the oldest batch is dropped and counted,
//! so a slow store never backs up into request handling.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

/// One ingest payload: `app_id -> name -> field -> delta`.
pub type StatsBatch = HashMap<String, HashMap<String, HashMap<String, f64>>>;

struct QueueInner {
    queue: Mutex<VecDeque<StatsBatch>>,
    available: Condvar,
    capacity: usize,
    dropped: AtomicU64,
    shutdown: AtomicBool,
}

pub struct IngestQueue {
    inner: Arc<QueueInner>,
    worker: Option<JoinHandle<()>>,
}

impl IngestQueue {
    /// Start the consumer thread. `handler` receives batches in order and
    /// must swallow its own errors; nothing is reported back to clients.
    pub fn spawn<F>(label: &'static str, capacity: usize, handler: F) -> Self
    where
        F: Fn(StatsBatch) + Send + 'static,
    {
        let inner = Arc::new(QueueInner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name(format!("ingest-{label}"))
            .spawn(move || worker_loop(worker_inner, handler))
            .expect("spawn ingest worker");
        Self {
            inner,
            worker: Some(worker),
        }
    }

    /// Queue a batch, dropping the oldest one when at capacity.
    pub fn enqueue(&self, batch: StatsBatch) {
        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.capacity {
            queue.pop_front();
            let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(total, "ingest queue full, dropped oldest batch");
        }
        queue.push_back(batch);
        drop(queue);
        self.inner.available.notify_one();
    }

    /// Batches currently waiting.
    pub fn depth(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Batches dropped since start.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Stop the worker after it drains everything already queued.
    pub fn shutdown(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.available.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("ingest worker panicked");
            }
        }
    }
}

impl Drop for IngestQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<F>(inner: Arc<QueueInner>, handler: F)
where
    F: Fn(StatsBatch),
{
    info!("ingest worker started");
    loop {
        let batch = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(batch) = queue.pop_front() {
                    break batch;
                }
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                inner.available.wait(&mut queue);
            }
        };
        handler(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn batch(tag: &str) -> StatsBatch {
        let mut counts = HashMap::new();
        counts.insert("NUMBER".to_string(), 1.0);
        let mut names = HashMap::new();
        names.insert(tag.to_string(), counts);
        let mut batch = StatsBatch::new();
        batch.insert("A".to_string(), names);
        batch
    }

    fn tag_of(batch: &StatsBatch) -> String {
        batch["A"].keys().next().unwrap().clone()
    }

    #[test]
    fn batches_are_processed_in_order() {
        let (tx, rx) = mpsc::channel();
        let mut queue = IngestQueue::spawn("test", 16, move |b| {
            tx.send(tag_of(&b)).unwrap();
        });
        queue.enqueue(batch("one"));
        queue.enqueue(batch("two"));
        queue.shutdown();
        let seen: Vec<String> = rx.try_iter().collect();
        assert_eq!(seen, vec!["one", "two"]);
    }

    #[test]
    fn full_queue_drops_oldest() {
        // Gate the handler so the queue actually fills.
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (seen_tx, seen_rx) = mpsc::channel();
        let gate_rx = Mutex::new(gate_rx);

        let mut queue = IngestQueue::spawn("test", 2, move |b| {
            started_tx.send(()).unwrap();
            gate_rx.lock().recv().unwrap();
            seen_tx.send(tag_of(&b)).unwrap();
        });

        queue.enqueue(batch("one"));
        // Wait until the worker holds "one"; the queue itself is now empty.
        started_rx.recv().unwrap();
        queue.enqueue(batch("two"));
        queue.enqueue(batch("three"));
        queue.enqueue(batch("four")); // evicts "two"
        assert_eq!(queue.dropped(), 1);

        for _ in 0..3 {
            gate_tx.send(()).unwrap();
        }
        queue.shutdown();
        let seen: Vec<String> = seen_rx.try_iter().collect();
        assert_eq!(seen, vec!["one", "three", "four"]);
    }
}
