//! Predicate engine: a registration-ordered list of `(predicate, trigger)`
//! pairs evaluated repeatedly against the table.
//!
//! Triggers run on the evaluation thread. A recurrent predicate may fire on
//! every pass; a one-shot predicate removes itself after its first firing.
//! Both registration and removal are safe to perform from inside a trigger,
//! which is how the view-change protocol chains its continuation steps.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::sst::Sst;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredicateMode {
    /// Evaluated on every pass for as long as it stays registered.
    Recurrent,
    /// Removed automatically after the trigger fires once.
    OneShot,
}

/// Handle to a registered predicate. Cancelling is idempotent and may be
/// done from inside any trigger, including the predicate's own.
#[derive(Clone)]
pub struct PredicateHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl PredicateHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Entry<R: Clone + Send + Sync + 'static> {
    mode: PredicateMode,
    cancelled: Arc<AtomicBool>,
    pred: Box<dyn FnMut(&Sst<R>) -> bool + Send>,
    trigger: Box<dyn FnMut(&Sst<R>) + Send>,
}

struct PredsInner<R: Clone + Send + Sync + 'static> {
    // Slot vector: entries are taken out while their trigger runs so that
    // triggers can re-enter `insert`/`cancel` without deadlocking.
    slots: Mutex<Vec<Option<Entry<R>>>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    started: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

pub struct Predicates<R: Clone + Send + Sync + 'static> {
    inner: Arc<PredsInner<R>>,
}

impl<R: Clone + Send + Sync + 'static> Clone for Predicates<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Clone + Send + Sync + 'static> Predicates<R> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PredsInner {
                slots: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                shutdown: AtomicBool::new(false),
                started: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn insert(
        &self,
        pred: impl FnMut(&Sst<R>) -> bool + Send + 'static,
        trigger: impl FnMut(&Sst<R>) + Send + 'static,
        mode: PredicateMode,
    ) -> PredicateHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            mode,
            cancelled: Arc::clone(&cancelled),
            pred: Box::new(pred),
            trigger: Box::new(trigger),
        };
        self.inner.slots.lock().unwrap().push(Some(entry));
        PredicateHandle { id, cancelled }
    }

    pub fn remove(&self, handle: &PredicateHandle) {
        handle.cancel();
    }

    /// Cancels every registered predicate.
    pub fn clear(&self) {
        let slots = self.inner.slots.lock().unwrap();
        for entry in slots.iter().flatten() {
            entry.cancelled.store(true, Ordering::Release);
        }
    }

    /// Runs a single evaluation pass: predicates fire in registration order,
    /// cancelled entries are dropped, one-shot entries are dropped after
    /// firing. Exposed so epoch termination (and tests) can drive the engine
    /// deterministically.
    pub fn evaluate_once(&self, sst: &Sst<R>) {
        // Compact dead entries first so the pass sees a stable prefix.
        {
            let mut slots = self.inner.slots.lock().unwrap();
            slots.retain(|slot| match slot {
                Some(entry) => !entry.cancelled.load(Ordering::Acquire),
                // A vacant slot belongs to a trigger currently running on
                // another pass frame; keep it so put-back lands correctly.
                None => true,
            });
        }
        let len = self.inner.slots.lock().unwrap().len();
        for i in 0..len {
            let taken = {
                let mut slots = self.inner.slots.lock().unwrap();
                match slots.get_mut(i) {
                    Some(slot) => slot.take(),
                    None => None,
                }
            };
            let Some(mut entry) = taken else {
                continue;
            };
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            let mut keep = true;
            if (entry.pred)(sst) {
                (entry.trigger)(sst);
                if entry.mode == PredicateMode::OneShot {
                    entry.cancelled.store(true, Ordering::Release);
                    keep = false;
                }
            }
            if keep && !entry.cancelled.load(Ordering::Acquire) {
                let mut slots = self.inner.slots.lock().unwrap();
                if let Some(slot) = slots.get_mut(i) {
                    *slot = Some(entry);
                }
            }
        }
    }

    /// Spawns the evaluation thread. Idempotent: later calls are ignored.
    pub fn start(&self, sst: Sst<R>) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let engine = self.clone();
        let handle = thread::Builder::new()
            .name("sst-predicates".to_string())
            .spawn(move || {
                while !inner.shutdown.load(Ordering::Acquire) {
                    engine.evaluate_once(&sst);
                    // Brief pause between passes; the table is polled, never
                    // waited on.
                    thread::sleep(Duration::from_micros(50));
                }
                tracing::debug!("predicate evaluation thread shutting down");
            })
            .expect("spawn sst-predicates thread");
        *self.inner.thread.lock().unwrap() = Some(handle);
    }

    /// Stops the evaluation thread and joins it. Safe to call from a trigger
    /// running on the evaluation thread itself (the join is skipped).
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let handle = self.inner.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

impl<R: Clone + Send + Sync + 'static> Default for Predicates<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MemoryMesh;

    fn single_node_sst() -> Sst<u64> {
        let mesh = Arc::new(MemoryMesh::<u64>::new());
        Sst::new(vec![1], 0, 0u64, mesh)
    }

    #[test]
    fn one_shot_fires_once_and_unregisters() {
        let sst = single_node_sst();
        let fired = Arc::new(AtomicU64::new(0));
        let fired_in_trigger = Arc::clone(&fired);
        sst.predicates().insert(
            |_| true,
            move |_| {
                fired_in_trigger.fetch_add(1, Ordering::SeqCst);
            },
            PredicateMode::OneShot,
        );
        sst.predicates().evaluate_once(&sst);
        sst.predicates().evaluate_once(&sst);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recurrent_fires_every_pass_until_cancelled() {
        let sst = single_node_sst();
        let fired = Arc::new(AtomicU64::new(0));
        let fired_in_trigger = Arc::clone(&fired);
        let handle = sst.predicates().insert(
            |_| true,
            move |_| {
                fired_in_trigger.fetch_add(1, Ordering::SeqCst);
            },
            PredicateMode::Recurrent,
        );
        sst.predicates().evaluate_once(&sst);
        sst.predicates().evaluate_once(&sst);
        handle.cancel();
        sst.predicates().evaluate_once(&sst);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn trigger_may_register_and_cancel_predicates() {
        let sst = single_node_sst();
        let inner_fired = Arc::new(AtomicU64::new(0));
        let engine = sst.predicates().clone();
        let inner_fired_clone = Arc::clone(&inner_fired);
        sst.predicates().insert(
            |_| true,
            move |_| {
                let fired = Arc::clone(&inner_fired_clone);
                let handle = engine.insert(
                    |_| true,
                    move |_| {
                        fired.fetch_add(1, Ordering::SeqCst);
                    },
                    PredicateMode::OneShot,
                );
                assert!(handle.is_active());
            },
            PredicateMode::OneShot,
        );
        sst.predicates().evaluate_once(&sst);
        // The nested predicate was appended during the pass and fires on the
        // next one.
        sst.predicates().evaluate_once(&sst);
        assert_eq!(inner_fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn triggers_fire_in_registration_order() {
        let sst = single_node_sst();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3u64 {
            let order = Arc::clone(&order);
            sst.predicates().insert(
                |_| true,
                move |_| order.lock().unwrap().push(tag),
                PredicateMode::Recurrent,
            );
        }
        sst.predicates().evaluate_once(&sst);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
