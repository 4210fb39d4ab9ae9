//! Prioritized event dispatch.
//!
//! The dispatcher is a keyed registry from an opaque event-type id to a
//! priority-banded chain of delegates. `emit_sync` walks the chain on the
//! calling thread; `emit_async` wraps the same walk in a one-shot anonymous
//! task and hands it to the [`Scheduler`]'s worker pool, reusing the
//! scheduler rather than owning a second execution path.
//!
//! # Locking
//!
//! `registry_lock` (here, a single [`Mutex`] over both maps) is held only
//! across registration changes. `emit_sync` takes a snapshot of the chain
//! under the lock, releases it, then dispatches -- a slow or blocking
//! delegate never stalls `register`/`unregister`. `registry_lock` is never
//! held while calling into the scheduler, so it cannot deadlock against
//! `scheduler_lock`.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use crate::error::CoreResult;
use crate::scheduler::Scheduler;
use crate::task::{OwnerId, TaskHandle, TaskPriority};
use crate::util::panic_message;

/// Opaque id identifying a class of event (e.g. "player joined"). A newtype
/// over `u64` so an event-type id can't be silently swapped with an owner
/// id or delegate id at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct EventTypeId(pub u64);

/// Caller-assigned, comparable identity for a registered delegate. Two
/// registrations with the same id in the same `(event_type_id, band)` are
/// duplicates. A newtype over `u64` for the same reason as [`EventTypeId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct DelegateId(pub u64);

/// Priority band a delegate fires in. Bands dispatch in declaration order,
/// `Lowest` first and `Monitor` last. `Monitor` is a documented convention
/// for observers that should not mutate the event -- it is not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum PriorityBand {
    Lowest = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Highest = 4,
    Monitor = 5,
}

const BAND_COUNT: usize = 6;
const BANDS_ASCENDING: [PriorityBand; BAND_COUNT] = [
    PriorityBand::Lowest,
    PriorityBand::Low,
    PriorityBand::Normal,
    PriorityBand::High,
    PriorityBand::Highest,
    PriorityBand::Monitor,
];

type DelegateFn = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/// A registered listener: a comparable identity plus the callback it runs.
/// The event is passed as `&dyn Any` so the dispatcher stays generic over
/// event payload types; delegates downcast to the type they expect.
#[derive(Clone)]
pub struct EventDelegate {
    id: DelegateId,
    call: DelegateFn,
}

impl EventDelegate {
    pub fn new(id: DelegateId, callback: impl Fn(&dyn Any) + Send + Sync + 'static) -> Self {
        Self {
            id,
            call: Arc::new(callback),
        }
    }
}

type Chain = [Vec<EventDelegate>; BAND_COUNT];

fn empty_chain() -> Chain {
    [
        Vec::new(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
    ]
}

struct RegistryState {
    handlers: HashMap<EventTypeId, Chain>,
    by_owner: HashMap<OwnerId, Vec<(DelegateId, PriorityBand, EventTypeId)>>,
}

/// Keyed registry of priority-banded delegate chains, with sync/async
/// dispatch. Cheaply cloneable; clones share the same registry and
/// scheduler.
#[derive(Clone)]
pub struct EventDispatcher {
    state: Arc<Mutex<RegistryState>>,
    scheduler: Scheduler,
}

impl EventDispatcher {
    /// Build a dispatcher that submits async dispatches to `scheduler`.
    #[must_use]
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                handlers: HashMap::new(),
                by_owner: HashMap::new(),
            })),
            scheduler,
        }
    }

    /// Register `delegate` at `band` for `event_type_id`. Returns `false`
    /// if an identically-identified delegate is already present at that
    /// exact `(event_type_id, band)` -- this is not treated as an error.
    pub fn register(
        &self,
        owner_id: OwnerId,
        event_type_id: EventTypeId,
        band: PriorityBand,
        delegate: EventDelegate,
    ) -> bool {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let chain = state
            .handlers
            .entry(event_type_id)
            .or_insert_with(empty_chain);
        let slot = &mut chain[band as usize];
        if slot.iter().any(|d| d.id == delegate.id) {
            return false;
        }
        let delegate_id = delegate.id;
        slot.push(delegate);
        state
            .by_owner
            .entry(owner_id)
            .or_default()
            .push((delegate_id, band, event_type_id));
        tracing::debug!(?owner_id, ?event_type_id, ?band, ?delegate_id, "delegate registered");
        true
    }

    /// Remove a previously registered delegate. Symmetrical with
    /// `register`: a second call for the same identity returns `false`.
    pub fn unregister(
        &self,
        owner_id: OwnerId,
        event_type_id: EventTypeId,
        band: PriorityBand,
        delegate_id: DelegateId,
    ) -> bool {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let removed = match state.handlers.get_mut(&event_type_id) {
            Some(chain) => {
                let slot = &mut chain[band as usize];
                let before = slot.len();
                slot.retain(|d| d.id != delegate_id);
                let removed = slot.len() != before;
                if removed && chain.iter().all(Vec::is_empty) {
                    state.handlers.remove(&event_type_id);
                }
                removed
            }
            None => false,
        };
        if removed {
            if let Some(regs) = state.by_owner.get_mut(&owner_id) {
                regs.retain(|(id, b, e)| !(*id == delegate_id && *b == band && *e == event_type_id));
                if regs.is_empty() {
                    state.by_owner.remove(&owner_id);
                }
            }
            tracing::debug!(?owner_id, ?event_type_id, ?band, ?delegate_id, "delegate unregistered");
        }
        removed
    }

    /// Remove every registration made by `owner_id`, in O(k) via the
    /// owner-keyed index. The plugin manager must call this (and
    /// [`Scheduler::cancel`]) before releasing plugin-owned memory the
    /// removed delegates might have captured.
    pub fn remove_plugin(&self, owner_id: OwnerId) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let Some(registrations) = state.by_owner.remove(&owner_id) else {
            return;
        };
        for (delegate_id, band, event_type_id) in registrations {
            if let Some(chain) = state.handlers.get_mut(&event_type_id) {
                chain[band as usize].retain(|d| d.id != delegate_id);
                if chain.iter().all(Vec::is_empty) {
                    state.handlers.remove(&event_type_id);
                }
            }
        }
        tracing::info!(?owner_id, "plugin event registrations removed");
    }

    /// Clear every registration, regardless of owner.
    pub fn remove_all(&self) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        state.handlers.clear();
        state.by_owner.clear();
    }

    /// Call every delegate registered for `event_type_id`, `Lowest` band
    /// first through `Monitor` last, insertion order within a band, on the
    /// calling thread. A no-op, not an error, if nothing is registered. A
    /// panicking delegate is caught, logged, and does not stop the chain.
    pub fn emit_sync(&self, event_type_id: EventTypeId, event: &dyn Any) {
        let snapshot: Option<Chain> = {
            let state = self.state.lock().expect("registry lock poisoned");
            state.handlers.get(&event_type_id).cloned()
        };
        let Some(chain) = snapshot else {
            return;
        };
        for band in BANDS_ASCENDING {
            for delegate in &chain[band as usize] {
                let call = Arc::clone(&delegate.call);
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| call(event)));
                if let Err(payload) = result {
                    let reason = panic_message(&payload);
                    tracing::error!(
                        ?event_type_id,
                        ?band,
                        delegate_id = ?delegate.id,
                        error = %reason,
                        "event delegate panicked"
                    );
                }
            }
        }
    }

    /// Wrap the sync dispatch in a closure and submit it as an anonymous,
    /// one-shot task to the scheduler's worker pool; returns immediately on
    /// the calling thread. `event` must be `Send + Sync` since a worker
    /// thread reads it after this call returns. If the worker pool has no
    /// threads, the dispatch never runs (see `WorkerPool::start(0)`).
    pub fn emit_async<E>(&self, event_type_id: EventTypeId, event: E) -> CoreResult<TaskHandle>
    where
        E: Any + Send + Sync + 'static,
    {
        let dispatcher = self.clone();
        self.scheduler.schedule_async_anonymous(
            move || dispatcher.emit_sync(event_type_id, &event),
            TaskPriority::Normal,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn dispatcher_with_pool(threads: usize) -> EventDispatcher {
        let scheduler = Scheduler::new(SchedulerConfig {
            ticks_per_second: 1000,
            worker_threads: threads,
        });
        EventDispatcher::new(scheduler)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let dispatcher = dispatcher_with_pool(0);
        let ok1 = dispatcher.register(
            OwnerId(1),
            EventTypeId(10),
            PriorityBand::Normal,
            EventDelegate::new(DelegateId(1), |_| {}),
        );
        let ok2 = dispatcher.register(
            OwnerId(1),
            EventTypeId(10),
            PriorityBand::Normal,
            EventDelegate::new(DelegateId(1), |_| {}),
        );
        assert!(ok1);
        assert!(!ok2);
    }

    #[test]
    fn register_unregister_round_trip() {
        let dispatcher = dispatcher_with_pool(0);
        assert!(dispatcher.register(
            OwnerId(1),
            EventTypeId(10),
            PriorityBand::Normal,
            EventDelegate::new(DelegateId(1), |_| {}),
        ));
        assert!(dispatcher.unregister(OwnerId(1), EventTypeId(10), PriorityBand::Normal, DelegateId(1)));
        assert!(!dispatcher.unregister(OwnerId(1), EventTypeId(10), PriorityBand::Normal, DelegateId(1)));

        // Registry is empty again: the identical registration succeeds.
        assert!(dispatcher.register(
            OwnerId(1),
            EventTypeId(10),
            PriorityBand::Normal,
            EventDelegate::new(DelegateId(1), |_| {}),
        ));
    }

    #[test]
    fn emit_sync_dispatches_in_band_order() {
        let dispatcher = dispatcher_with_pool(0);
        let order = Arc::new(StdMutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        dispatcher.register(
            OwnerId(1),
            EventTypeId(10),
            PriorityBand::Lowest,
            EventDelegate::new(DelegateId(1), move |_| o1.lock().unwrap().push("d1")),
        );
        let o2 = Arc::clone(&order);
        dispatcher.register(
            OwnerId(2),
            EventTypeId(10),
            PriorityBand::Normal,
            EventDelegate::new(DelegateId(2), move |_| o2.lock().unwrap().push("d2")),
        );
        let o3 = Arc::clone(&order);
        dispatcher.register(
            OwnerId(3),
            EventTypeId(10),
            PriorityBand::Monitor,
            EventDelegate::new(DelegateId(3), move |_| o3.lock().unwrap().push("d3")),
        );

        dispatcher.emit_sync(EventTypeId(10), &());
        assert_eq!(*order.lock().unwrap(), vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn emit_on_unknown_event_type_is_a_no_op() {
        let dispatcher = dispatcher_with_pool(0);
        // Should not panic, log an error, or do anything observable.
        dispatcher.emit_sync(EventTypeId(999), &());
    }

    #[test]
    fn panicking_delegate_does_not_stop_the_chain() {
        let dispatcher = dispatcher_with_pool(0);
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));

        dispatcher.register(
            OwnerId(1),
            EventTypeId(10),
            PriorityBand::Lowest,
            EventDelegate::new(DelegateId(1), |_| panic!("boom")),
        );
        let r = Arc::clone(&ran);
        dispatcher.register(
            OwnerId(2),
            EventTypeId(10),
            PriorityBand::Normal,
            EventDelegate::new(DelegateId(2), move |_| r.store(true, std::sync::atomic::Ordering::SeqCst)),
        );

        dispatcher.emit_sync(EventTypeId(10), &());
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn remove_plugin_drops_only_its_delegates() {
        let dispatcher = dispatcher_with_pool(0);
        dispatcher.register(
            OwnerId(1),
            EventTypeId(10),
            PriorityBand::Normal,
            EventDelegate::new(DelegateId(1), |_| {}),
        );
        dispatcher.register(
            OwnerId(2),
            EventTypeId(10),
            PriorityBand::Normal,
            EventDelegate::new(DelegateId(2), |_| {}),
        );

        dispatcher.remove_plugin(OwnerId(1));

        dispatcher.unregister(OwnerId(1), EventTypeId(10), PriorityBand::Normal, DelegateId(1)); // already gone
        assert!(!dispatcher.unregister(OwnerId(1), EventTypeId(10), PriorityBand::Normal, DelegateId(1)));
        assert!(dispatcher.unregister(OwnerId(2), EventTypeId(10), PriorityBand::Normal, DelegateId(2)));
    }

    #[test]
    fn remove_all_clears_everything() {
        let dispatcher = dispatcher_with_pool(0);
        dispatcher.register(
            OwnerId(1),
            EventTypeId(10),
            PriorityBand::Normal,
            EventDelegate::new(DelegateId(1), |_| {}),
        );
        dispatcher.register(
            OwnerId(2),
            EventTypeId(20),
            PriorityBand::Normal,
            EventDelegate::new(DelegateId(2), |_| {}),
        );
        dispatcher.remove_all();
        assert!(!dispatcher.unregister(OwnerId(1), EventTypeId(10), PriorityBand::Normal, DelegateId(1)));
        assert!(!dispatcher.unregister(OwnerId(2), EventTypeId(20), PriorityBand::Normal, DelegateId(2)));
    }

    #[test]
    fn emit_async_runs_on_worker_pool() {
        let dispatcher = dispatcher_with_pool(1);
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let r = Arc::clone(&ran);
        dispatcher.register(
            OwnerId(1),
            EventTypeId(10),
            PriorityBand::Normal,
            EventDelegate::new(DelegateId(1), move |_| r.store(true, std::sync::atomic::Ordering::SeqCst)),
        );

        dispatcher.emit_async(EventTypeId(10), ()).unwrap();
        dispatcher.scheduler.tick_once();

        for _ in 0..20 {
            if ran.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
        dispatcher.scheduler.stop();
    }

    #[test]
    fn emit_async_with_zero_worker_threads_never_runs() {
        let dispatcher = dispatcher_with_pool(0);
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let r = Arc::clone(&ran);
        dispatcher.register(
            OwnerId(1),
            EventTypeId(10),
            PriorityBand::Normal,
            EventDelegate::new(DelegateId(1), move |_| r.store(true, std::sync::atomic::Ordering::SeqCst)),
        );

        dispatcher.emit_async(EventTypeId(10), ()).unwrap();
        dispatcher.scheduler.tick_once();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        dispatcher.scheduler.stop();
    }
}
