//! Tick-driven task scheduler.
//!
//! The scheduler owns a logical tick counter, a priority queue of pending
//! tasks keyed by `next_fire_tick`, and the main-thread dispatch loop that
//! drains it. Parallel-mode tasks are hashed off to a [`WorkerPool`];
//! sync-mode tasks run inline on whichever thread calls [`Scheduler::run`].
//!
//! # Locking
//!
//! `pending` is guarded by a single mutex (`scheduler_lock` in spec
//! terms). It is held only across heap pushes/pops -- never across user
//! callback execution. Task metadata lives in a [`DashMap`] so that
//! `cancel`/`cancel_all`/introspection never need the heap lock.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::{CoreError, CoreResult};
use crate::task::{OwnerId, Task, TaskCallback, TaskHandle, TaskInfo, TaskPriority, invoke_callback};
use crate::worker::WorkerPool;

/// Plain configuration values recognized by the scheduler. Loading these
/// from a file or environment is the embedder's responsibility -- this
/// crate only defines the values and their defaults.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    /// Logical ticks per second the main loop attempts to maintain.
    pub ticks_per_second: u32,
    /// Number of worker threads backing the parallel task pool.
    pub worker_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            ticks_per_second: 60,
            worker_threads: parallelism.saturating_mul(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    next_fire_tick: u64,
    handle: TaskHandle,
}

struct SchedulerInner {
    tasks: DashMap<TaskHandle, Task>,
    pending: std::sync::Mutex<BinaryHeap<Reverse<HeapEntry>>>,
    next_handle: AtomicU64,
    tick: AtomicU64,
    target_tps: AtomicU32,
    overloaded: AtomicBool,
    /// True for the duration of `run()`; false before the first call and
    /// after the loop exits.
    active: AtomicBool,
    /// True once `stop()` has been called; admission is rejected from this
    /// point on, even if `run()` has not yet observed the request.
    shutdown: AtomicBool,
    worker_pool: WorkerPool,
}

/// Tick-driven scheduler. Cheaply cloneable; clones share the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Build a scheduler and its worker pool. Does not start the main loop;
    /// call [`Scheduler::run`] to occupy a thread with it.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                tasks: DashMap::new(),
                pending: std::sync::Mutex::new(BinaryHeap::new()),
                next_handle: AtomicU64::new(0),
                tick: AtomicU64::new(0),
                target_tps: AtomicU32::new(config.ticks_per_second.max(1)),
                overloaded: AtomicBool::new(false),
                active: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                worker_pool: WorkerPool::start(config.worker_threads),
            }),
        }
    }

    // -- Submission -----------------------------------------------------

    /// Schedule a repeating, main-thread task. Fires first at `tick() +
    /// delay`, then every `period` ticks thereafter.
    pub fn schedule_sync_repeating(
        &self,
        owner: OwnerId,
        callback: impl Fn() + Send + Sync + 'static,
        priority: TaskPriority,
        delay: u64,
        period: u64,
    ) -> CoreResult<TaskHandle> {
        self.admit(Some(owner), Arc::new(callback), priority, delay, period, false)
    }

    /// Schedule a one-shot, worker-pool task owned by `owner`.
    pub fn schedule_async_delayed(
        &self,
        owner: OwnerId,
        callback: impl Fn() + Send + Sync + 'static,
        priority: TaskPriority,
        delay: u64,
    ) -> CoreResult<TaskHandle> {
        self.admit(Some(owner), Arc::new(callback), priority, delay, 0, true)
    }

    /// Schedule a one-shot, worker-pool task with no owner, eligible
    /// immediately. Never affected by [`Scheduler::cancel`].
    pub fn schedule_async_anonymous(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
        priority: TaskPriority,
    ) -> CoreResult<TaskHandle> {
        self.admit(None, Arc::new(callback), priority, 0, 0, true)
    }

    fn admit(
        &self,
        owner: Option<OwnerId>,
        callback: TaskCallback,
        priority: TaskPriority,
        delay: u64,
        period: u64,
        parallel: bool,
    ) -> CoreResult<TaskHandle> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(CoreError::SchedulerShutdown);
        }

        let handle = TaskHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let tick = self.inner.tick.load(Ordering::Acquire);
        let next_fire_tick = tick + delay;
        let name = format!("task-{}", handle.0);
        let task = Task::new(owner, callback, priority, period, next_fire_tick, parallel, name);

        self.inner.tasks.insert(handle, task);
        {
            let mut heap = self.inner.pending.lock().expect("scheduler lock poisoned");
            heap.push(Reverse(HeapEntry { next_fire_tick, handle }));
        }
        tracing::debug!(?handle, ?priority, delay, period, parallel, "task scheduled");
        Ok(handle)
    }

    // -- Cancellation -----------------------------------------------------

    /// Mark every alive task owned by `owner_id` as not-alive. In-flight
    /// invocations are not interrupted; no further invocation will begin.
    pub fn cancel(&self, owner_id: OwnerId) {
        for entry in self.inner.tasks.iter() {
            if entry.owner() == Some(owner_id) {
                entry.cancel();
            }
        }
    }

    /// Mark every alive task as not-alive, regardless of owner.
    pub fn cancel_all(&self) {
        for entry in self.inner.tasks.iter() {
            entry.cancel();
        }
    }

    /// Cancel a single task by its handle. The handle returned from
    /// `schedule_*` stays valid for this purpose for the life of the task.
    pub fn cancel_task(&self, handle: TaskHandle) -> CoreResult<()> {
        self.inner
            .tasks
            .get(&handle)
            .map(|t| t.cancel())
            .ok_or(CoreError::TaskNotFound(handle))
    }

    /// Change a task's priority after submission.
    pub fn set_task_priority(&self, handle: TaskHandle, priority: TaskPriority) -> CoreResult<()> {
        self.inner
            .tasks
            .get_mut(&handle)
            .map(|mut t| t.set_priority(priority))
            .ok_or(CoreError::TaskNotFound(handle))
    }

    /// Rename a task after submission (diagnostics only).
    pub fn set_task_name(&self, handle: TaskHandle, name: impl Into<String>) -> CoreResult<()> {
        self.inner
            .tasks
            .get_mut(&handle)
            .map(|mut t| t.set_name(name))
            .ok_or(CoreError::TaskNotFound(handle))
    }

    /// Snapshot a task's queryable state (owner, name, liveness, mode).
    pub fn task_info(&self, handle: TaskHandle) -> CoreResult<TaskInfo> {
        self.inner
            .tasks
            .get(&handle)
            .map(|t| t.snapshot(handle))
            .ok_or(CoreError::TaskNotFound(handle))
    }

    // -- Introspection ----------------------------------------------------

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn is_overloaded(&self) -> bool {
        self.inner.overloaded.load(Ordering::Acquire)
    }

    pub fn uptime_ticks(&self) -> u64 {
        self.inner.tick.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.inner.worker_pool.thread_count()
    }

    pub fn ticks_per_second(&self) -> u32 {
        self.inner.target_tps.load(Ordering::Acquire)
    }

    /// Changing this takes effect at the next measurement window, not
    /// mid-window.
    pub fn set_ticks_per_second(&self, tps: u32) {
        self.inner.target_tps.store(tps.max(1), Ordering::Release);
    }

    /// Request the main loop to exit after finishing its current tick, and
    /// stop accepting new submissions. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
    }

    // -- Main loop ----------------------------------------------------------

    /// Occupy the calling thread as the main loop until [`Scheduler::stop`]
    /// is called. Joins the worker pool before returning.
    pub fn run(&self) {
        self.inner.active.store(true, Ordering::Release);
        tracing::info!(tps = self.ticks_per_second(), "scheduler main loop started");

        let mut window_target = self.ticks_per_second();
        let mut ticks_this_window: u32 = 0;
        let mut window_start = Instant::now();

        while !self.inner.shutdown.load(Ordering::Acquire) {
            self.drain_tick();
            self.inner.tick.fetch_add(1, Ordering::AcqRel);
            ticks_this_window += 1;

            if ticks_this_window >= window_target {
                let elapsed = window_start.elapsed();
                let budget = Duration::from_secs(1);
                if elapsed >= budget {
                    self.inner.overloaded.store(true, Ordering::Release);
                    tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "tick budget exceeded");
                } else {
                    self.inner.overloaded.store(false, Ordering::Release);
                    std::thread::sleep(budget - elapsed);
                }
                window_start = Instant::now();
                ticks_this_window = 0;
                window_target = self.ticks_per_second();
            }
        }

        tracing::info!("scheduler main loop stopping");
        self.inner.active.store(false, Ordering::Release);
        self.inner.worker_pool.join_all();
    }

    /// Drive exactly one tick without sleeping or pacing -- used by tests
    /// that need deterministic, wall-clock-independent control.
    pub fn tick_once(&self) {
        self.drain_tick();
        self.inner.tick.fetch_add(1, Ordering::AcqRel);
    }

    fn drain_tick(&self) {
        let tick = self.inner.tick.load(Ordering::Acquire);
        let mut sync_batch = Vec::new();

        {
            let mut heap = self.inner.pending.lock().expect("scheduler lock poisoned");
            loop {
                let Some(Reverse(top)) = heap.peek().copied() else {
                    break;
                };
                if top.next_fire_tick > tick {
                    break;
                }
                heap.pop();

                let alive = self
                    .inner
                    .tasks
                    .get(&top.handle)
                    .map(|t| t.is_alive())
                    .unwrap_or(false);
                if !alive {
                    self.inner.tasks.remove(&top.handle);
                    continue;
                }

                let parallel = self
                    .inner
                    .tasks
                    .get(&top.handle)
                    .map(|t| t.is_parallel())
                    .unwrap_or(false);
                if parallel {
                    self.inner.submit_parallel(top.handle);
                } else {
                    sync_batch.push(top.handle);
                }
            }
        }

        let overloaded = self.inner.overloaded.load(Ordering::Acquire);
        let mut reinsert = Vec::new();
        for handle in sync_batch {
            let Some((callback, name, owner)) = self
                .inner
                .tasks
                .get(&handle)
                .map(|t| (t.callback(), t.name().to_string(), t.owner()))
            else {
                continue;
            };
            invoke_callback(&callback, &name, owner);

            let Some(mut task) = self.inner.tasks.get_mut(&handle) else {
                continue;
            };
            task.advance(tick, overloaded);
            if task.is_alive() {
                reinsert.push(HeapEntry {
                    next_fire_tick: task.next_fire_tick(),
                    handle,
                });
            } else {
                drop(task);
                self.inner.tasks.remove(&handle);
            }
        }

        if !reinsert.is_empty() {
            let mut heap = self.inner.pending.lock().expect("scheduler lock poisoned");
            for entry in reinsert {
                heap.push(Reverse(entry));
            }
        }
    }
}

impl SchedulerInner {
    /// Hand a parallel task off to the worker pool. The task's advance /
    /// reinsertion bookkeeping happens on the worker thread after the
    /// callback returns, since completion order of parallel tasks is
    /// unspecified.
    fn submit_parallel(self: &Arc<Self>, handle: TaskHandle) {
        let Some((callback, name, owner)) = self
            .tasks
            .get(&handle)
            .map(|t| (t.callback(), t.name().to_string(), t.owner()))
        else {
            return;
        };

        let inner = Arc::clone(self);
        self.worker_pool.submit(Box::new(move || {
            invoke_callback(&callback, &name, owner);
            inner.finish_parallel(handle);
        }));
    }

    fn finish_parallel(self: &Arc<Self>, handle: TaskHandle) {
        let tick = self.tick.load(Ordering::Acquire);
        let overloaded = self.overloaded.load(Ordering::Acquire);

        let Some(mut task) = self.tasks.get_mut(&handle) else {
            return;
        };
        task.advance(tick, overloaded);
        if task.is_alive() {
            let entry = HeapEntry {
                next_fire_tick: task.next_fire_tick(),
                handle,
            };
            drop(task);
            let mut heap = self.pending.lock().expect("scheduler lock poisoned");
            heap.push(Reverse(entry));
        } else {
            drop(task);
            self.tasks.remove(&handle);
        }
    }
}
