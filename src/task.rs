//! Task value type.
//!
//! A [`Task`] describes one unit of work submitted to the [`crate::scheduler::Scheduler`]:
//! who owns it, what it runs, how it is prioritized, and when it next fires.
//! Tasks live in the scheduler's arena (a [`dashmap::DashMap`] keyed by
//! [`TaskHandle`]) rather than being reference-counted between the pending
//! heap, the sync batch, and the worker queue -- only the handle moves
//! between those places.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::util::panic_message;

/// Opaque, stable identifier of the plugin that submitted a task or event
/// delegate. Treated as opaque by this crate; the plugin manager owns the
/// allocation scheme. A newtype over `u64` so a raw integer can't be passed
/// where an owner id is expected (or vice versa) without a compiler error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct OwnerId(pub u64);

/// Stable handle to a scheduled task, minted from a monotonic counter.
///
/// Handles double as the FIFO tie-break sequence: two tasks with the same
/// `next_fire_tick` are drained in ascending handle order, which is exactly
/// insertion order since handles are assigned monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct TaskHandle(pub(crate) u64);

/// Scheduling priority. Ordinal order is `Critical < High < Normal < Low <
/// Idle`; it does not by itself determine drain order (that is
/// `next_fire_tick`) but it does determine how much a repeating task's next
/// fire is deferred while the scheduler is [`overloaded`](crate::scheduler::Scheduler::is_overloaded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum TaskPriority {
    Critical,
    High,
    Normal,
    Low,
    Idle,
}

impl TaskPriority {
    /// Extra ticks added to a repeating task's next fire when the scheduler
    /// is overloaded. Lower-priority tasks defer more so critical work keeps
    /// its cadence under load.
    pub(crate) fn overload_deferral(self) -> u64 {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 4,
            TaskPriority::Idle => 8,
        }
    }
}

/// A zero-argument, no-return procedure. Shared via `Arc` so a repeating
/// task can invoke the same callback on every fire without cloning it.
pub type TaskCallback = Arc<dyn Fn() + Send + Sync>;

/// One unit of scheduled work.
///
/// Public surface is deliberately narrow: priority and name may be changed
/// after submission, the task may be cancelled, and its liveness/ownership/
/// mode may be queried. Re-firing and liveness transitions (`advance`) are
/// scheduler-internal.
pub struct Task {
    owner: Option<OwnerId>,
    name: String,
    callback: TaskCallback,
    priority: TaskPriority,
    /// Non-zero period in ticks; zero means one-shot.
    period: u64,
    next_fire_tick: u64,
    parallel: bool,
    alive: AtomicBool,
    /// Wall-clock submission time, for diagnostics only -- all scheduling
    /// decisions are made in logical ticks, never against this.
    created_at: DateTime<Utc>,
}

impl Task {
    pub(crate) fn new(
        owner: Option<OwnerId>,
        callback: TaskCallback,
        priority: TaskPriority,
        period: u64,
        next_fire_tick: u64,
        parallel: bool,
        name: String,
    ) -> Self {
        Self {
            owner,
            name,
            callback,
            priority,
            period,
            next_fire_tick,
            parallel,
            alive: AtomicBool::new(true),
            created_at: Utc::now(),
        }
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: TaskPriority) {
        self.priority = priority;
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn is_repeating(&self) -> bool {
        self.period > 0
    }

    pub(crate) fn next_fire_tick(&self) -> u64 {
        self.next_fire_tick
    }

    pub(crate) fn callback(&self) -> TaskCallback {
        Arc::clone(&self.callback)
    }

    /// Mark the task as not-alive. Idempotent: cancelling an already-dead
    /// task is a no-op. Takes effect at the next scheduling decision; an
    /// in-flight invocation is not interrupted.
    pub(crate) fn cancel(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Run the callback once. A panic raised by the callback is caught and
    /// logged with the task's name/owner, never propagated, and never
    /// changes liveness.
    pub(crate) fn invoke(&self) {
        invoke_callback(&self.callback, &self.name, self.owner);
    }

    /// Recompute `next_fire_tick`/`alive` after the callback has run on
    /// `current_tick`. Applied post-execution: a repeating task's next fire
    /// is always computed from when it just ran, not from when it was
    /// submitted.
    pub(crate) fn advance(&mut self, current_tick: u64, overloaded: bool) {
        if !self.is_repeating() {
            self.cancel();
            return;
        }
        let deferral = if overloaded {
            self.priority.overload_deferral()
        } else {
            0
        };
        self.next_fire_tick = current_tick + self.period + deferral;
    }
}

/// Point-in-time snapshot of a task's queryable state, handed back to
/// callers that only hold a [`TaskHandle`]: owner, name, priority,
/// liveness, and scheduling mode.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TaskInfo {
    pub handle: TaskHandle,
    pub owner: Option<OwnerId>,
    pub name: String,
    pub priority: TaskPriority,
    pub alive: bool,
    pub parallel: bool,
    pub repeating: bool,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub(crate) fn snapshot(&self, handle: TaskHandle) -> TaskInfo {
        TaskInfo {
            handle,
            owner: self.owner,
            name: self.name.clone(),
            priority: self.priority,
            alive: self.is_alive(),
            parallel: self.parallel,
            repeating: self.is_repeating(),
            created_at: self.created_at,
        }
    }
}

/// Run a detached callback, catching and logging any panic. Used both by
/// [`Task::invoke`] and by the scheduler when executing a callback it has
/// already cloned out of a task (so it is not holding the task's map guard
/// while user code runs).
pub(crate) fn invoke_callback(callback: &TaskCallback, name: &str, owner: Option<OwnerId>) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback()));
    if let Err(payload) = result {
        let reason = panic_message(&payload);
        tracing::error!(task = %name, owner = ?owner, error = %reason, "task callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_task(period: u64) -> Task {
        Task::new(
            None,
            Arc::new(|| {}),
            TaskPriority::Normal,
            period,
            0,
            false,
            "t".to_string(),
        )
    }

    #[test]
    fn one_shot_dies_after_advance() {
        let mut task = noop_task(0);
        task.advance(5, false);
        assert!(!task.is_alive());
    }

    #[test]
    fn repeating_reschedules_by_period() {
        let mut task = noop_task(2);
        task.advance(10, false);
        assert!(task.is_alive());
        assert_eq!(task.next_fire_tick(), 12);
    }

    #[test]
    fn overload_defers_by_priority() {
        let mut task = noop_task(2);
        task.set_priority(TaskPriority::Low);
        task.advance(10, true);
        assert_eq!(task.next_fire_tick(), 10 + 2 + 4);
    }

    #[test]
    fn critical_is_unaffected_by_overload() {
        let mut task = noop_task(2);
        task.set_priority(TaskPriority::Critical);
        task.advance(10, true);
        assert_eq!(task.next_fire_tick(), 12);
    }

    #[test]
    fn cancel_is_idempotent() {
        let task = noop_task(2);
        task.cancel();
        task.cancel();
        assert!(!task.is_alive());
    }

    #[test]
    fn invoke_panic_is_caught() {
        let task = Task::new(
            None,
            Arc::new(|| panic!("boom")),
            TaskPriority::Normal,
            0,
            0,
            false,
            "panicky".to_string(),
        );
        task.invoke();
        // Liveness is untouched by invoke(); advance() is what retires it.
        assert!(task.is_alive());
    }
}
