//! Fixed-size worker pool for parallel-mode task execution.
//!
//! A fixed number of OS threads drain a shared, unbounded
//! [`crossbeam::channel`] of ready-to-run closures. `submit` never blocks
//! the caller; a dequeued closure that panics is caught and logged without
//! killing the worker.

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::util::panic_message;

type Job = Box<dyn FnOnce() + Send>;

struct Inner {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

/// A fixed-size pool of worker threads serving one shared FIFO queue.
pub struct WorkerPool {
    inner: Mutex<Inner>,
    thread_count: usize,
}

impl WorkerPool {
    /// Spawn `n` worker threads, each looping: dequeue, invoke, repeat.
    pub fn start(n: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(n);
        for index in 0..n {
            let receiver: Receiver<Job> = receiver.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("anvil-worker-{index}"))
                    .spawn(move || Self::run(receiver))
                    .expect("failed to spawn worker thread"),
            );
        }
        tracing::info!(threads = n, "worker pool started");
        Self {
            inner: Mutex::new(Inner {
                sender: Some(sender),
                handles,
            }),
            thread_count: n,
        }
    }

    fn run(receiver: Receiver<Job>) {
        while let Ok(job) = receiver.recv() {
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(job)) {
                let reason = panic_message(&payload);
                tracing::error!(error = %reason, "worker job panicked");
            }
        }
    }

    /// Number of worker threads in the pool.
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Submit a closure for execution on some worker thread. Never blocks:
    /// the queue is unbounded. If the pool has already been joined, the
    /// closure is dropped and a warning is logged.
    pub fn submit(&self, job: Job) {
        let guard = self.inner.lock().expect("worker pool mutex poisoned");
        match &guard.sender {
            Some(sender) => {
                // SegQueue-style unbounded send: only fails if every
                // receiver has already exited, which only happens after
                // join_all has torn the pool down.
                let _ = sender.send(job);
            }
            None => tracing::warn!("dropped job submitted after worker pool shutdown"),
        }
    }

    /// Signal shutdown, wait for every worker to drain its queue and exit.
    /// Idempotent: calling this more than once is a no-op after the first.
    pub fn join_all(&self) {
        let (sender, handles) = {
            let mut guard = self.inner.lock().expect("worker pool mutex poisoned");
            (guard.sender.take(), std::mem::take(&mut guard.handles))
        };
        // Dropping the sender closes the channel once the queue drains,
        // which lets every worker's `recv` loop exit on its own.
        drop(sender);
        for handle in handles {
            let _ = handle.join();
        }
        tracing::info!("worker pool joined");
    }
}
