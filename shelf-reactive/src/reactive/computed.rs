//! Computed Values
//!
//! A computed is a memoized value derived from other signals and computeds.
//!
//! # How Computeds Work
//!
//! 1. The compute function does not run when the computed is created
//! 2. The first read runs it and records every value it reads
//! 3. A change to any of those values marks the computed dirty
//! 4. The next read (or the next flush) recomputes it
//! 5. If the equality function says the result is unchanged, the old value
//!    is kept and subscribers are not notified
//!
//! Edges are rebuilt on every recompute, so a branch that stops being taken
//! stops triggering recomputes.
//!
//! # Failures
//!
//! A panicking compute function does not poison the graph. The failure is
//! stored and every read returns it as [`ReactiveError::ComputeFailed`]
//! until a later change lets the computed succeed again.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::debug;

use super::runtime::{Runtime, WeakRuntime};
use super::signal::{EqualsFn, SignalOptions};
use super::subscriber::{PendingChange, Subscribers, Subscription, Unsubscribe};
use crate::error::{ReactiveError, Result};
use crate::graph::{Node, NodeId, NodeKind, Resolve};

/// Options for creating computeds.
pub type ComputedOptions<T> = SignalOptions<T>;

type ComputedSubscriber<T> = dyn Fn(&T, Option<&T>);

pub(crate) struct ComputedCell<T: 'static> {
    compute: Box<dyn Fn() -> T>,
    equals: EqualsFn<T>,
    value: RefCell<Option<T>>,
    failure: RefCell<Option<ReactiveError>>,
    subscribers: Rc<Subscribers<ComputedSubscriber<T>>>,
    open: RefCell<Option<Rc<PendingChange<T, Option<T>>>>>,
    runs: Cell<usize>,
}

impl<T: Clone + 'static> ComputedCell<T> {
    fn fail(&self, err: ReactiveError) -> Result<()> {
        self.failure.replace(Some(err.clone()));
        Err(err)
    }
}

impl<T: Clone + 'static> Resolve for ComputedCell<T> {
    fn resolve(&self, rt: &Runtime, id: NodeId) -> Result<()> {
        self.runs.set(self.runs.get() + 1);

        let next = match rt.run_tracked(id, || (self.compute)()) {
            Ok(next) => next,
            Err(err) => return self.fail(err),
        };
        self.failure.replace(None);

        let changed = {
            let current = self.value.borrow();
            match current.as_ref() {
                None => Ok(true),
                Some(previous) => rt.invoke(|| !(self.equals)(previous, &next)),
            }
        };
        let changed = match changed {
            Ok(changed) => changed,
            Err(message) => {
                let node = rt.label(id);
                return self.fail(ReactiveError::EqualityPanicked { node, message });
            }
        };
        if !changed {
            return Ok(());
        }

        let previous = self.value.replace(Some(next.clone()));
        if !self.subscribers.is_empty() {
            self.notify(rt, id, next, previous);
        }
        Ok(())
    }
}

impl<T: Clone + 'static> ComputedCell<T> {
    /// Same delivery rules as signal subscribers: one queued callback per
    /// subscriber, folded within a batch.
    fn notify(&self, rt: &Runtime, id: NodeId, next: T, previous: Option<T>) {
        let batching = rt.is_batching();
        let open = batching
            .then(|| self.open.borrow().clone())
            .flatten()
            .filter(|change| change.is_open());
        if let Some(change) = open {
            let void = change.previous().as_ref().is_some_and(|previous| {
                rt.invoke(|| (self.equals)(previous, &next))
                    .unwrap_or(false)
            });
            change.absorb(next, void);
            return;
        }

        let change = PendingChange::new(next, previous);
        let origin = rt.label(id);
        for (subscriber, callback) in self.subscribers.snapshot() {
            let change = Rc::clone(&change);
            let list = Rc::downgrade(&self.subscribers);
            rt.enqueue(
                origin.clone(),
                Box::new(move || {
                    if list.upgrade().is_some_and(|list| list.contains(subscriber)) {
                        change.deliver(|next, prev| callback(next, prev.as_ref()));
                    }
                }),
            );
        }
        *self.open.borrow_mut() = batching.then_some(change);
    }
}

/// A lazily evaluated, memoized derived value.
///
/// # Example
///
/// ```rust
/// use shelf_reactive::Runtime;
///
/// let rt = Runtime::new();
/// let first = rt.signal("Ada".to_string());
/// let last = rt.signal("Lovelace".to_string());
///
/// let full = {
///     let (first, last) = (first.clone(), last.clone());
///     rt.computed(move || format!("{} {}", first.get(), last.get()))
/// };
///
/// assert_eq!(full.get(), "Ada Lovelace");
/// ```
pub struct Computed<T: 'static> {
    rt: WeakRuntime,
    id: NodeId,
    cell: Rc<ComputedCell<T>>,
}

impl<T: Clone + 'static> Computed<T> {
    pub(crate) fn create(
        rt: &Runtime,
        compute: impl Fn() -> T + 'static,
        options: ComputedOptions<T>,
    ) -> Self {
        let cell = Rc::new(ComputedCell {
            compute: Box::new(compute),
            equals: options.equals,
            value: RefCell::new(None),
            failure: RefCell::new(None),
            subscribers: Rc::new(Subscribers::new()),
            open: RefCell::new(None),
            runs: Cell::new(0),
        });
        let resolver: Rc<dyn Resolve> = cell.clone();
        let id = rt.insert_node(Node::new(NodeKind::Computed(resolver), options.name));
        Self {
            rt: rt.downgrade(),
            id,
            cell,
        }
    }

    /// The node id of this computed.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the value, recomputing first if it is stale, and track the read.
    ///
    /// # Panics
    ///
    /// Panics on any error [`try_get`](Self::try_get) would return.
    pub fn get(&self) -> T {
        self.try_get().unwrap_or_else(|err| panic!("{err}"))
    }

    /// Get the value, recomputing first if it is stale, and track the read.
    pub fn try_get(&self) -> Result<T> {
        self.try_with(T::clone)
    }

    /// Borrow the value, recomputing first if it is stale.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.try_with(f).unwrap_or_else(|err| panic!("{err}"))
    }

    /// Fallible form of [`with`](Self::with).
    pub fn try_with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let rt = self.rt.upgrade()?;
        rt.track(self.id)?;
        self.refresh(&rt)?;
        self.read(&rt, f)
    }

    /// Get the value without tracking. Still recomputes if stale.
    pub fn peek(&self) -> T {
        self.try_peek().unwrap_or_else(|err| panic!("{err}"))
    }

    /// Fallible form of [`peek`](Self::peek).
    pub fn try_peek(&self) -> Result<T> {
        let rt = self.rt.upgrade()?;
        self.refresh(&rt)?;
        self.read(&rt, T::clone)
    }

    fn refresh(&self, rt: &Runtime) -> Result<()> {
        let (dirty, computing) = rt.node_flags(self.id)?;
        if computing {
            return Err(ReactiveError::Cycle {
                node: rt.label(self.id),
            });
        }
        if dirty {
            // The cell keeps the failure; `read` reports it.
            if let Err(err) = rt.resolve_node(self.id) {
                debug!(node = ?self.id, error = %err, "recompute failed");
            }
        }
        Ok(())
    }

    fn read<R>(&self, rt: &Runtime, f: impl FnOnce(&T) -> R) -> Result<R> {
        if let Some(err) = self.cell.failure.borrow().as_ref() {
            return Err(err.clone());
        }
        let value = self.cell.value.borrow();
        match value.as_ref() {
            Some(value) => Ok(f(value)),
            None => Err(ReactiveError::ComputeFailed {
                node: rt.label(self.id),
                message: "value was never computed".into(),
            }),
        }
    }

    /// Call `f(new, previous)` whenever the value changes. Forces the value
    /// to resolve, so that changes are picked up from now on; `previous` is
    /// `None` for the first computed value.
    pub fn subscribe(&self, f: impl Fn(&T, Option<&T>) + 'static) -> Subscription {
        let callback: Rc<ComputedSubscriber<T>> = Rc::new(f);
        let id = self.cell.subscribers.insert(callback);
        if let Ok(rt) = self.rt.upgrade() {
            if let Err(err) = self.refresh(&rt) {
                debug!(node = ?self.id, error = %err, "subscribe could not resolve");
            }
            // Deliver the first value now in immediate mode.
            rt.settle();
        }
        let list: Weak<dyn Unsubscribe> = Rc::downgrade(&self.cell.subscribers) as Weak<dyn Unsubscribe>;
        Subscription::new(id, list)
    }

    /// Whether the cached value is stale.
    pub fn is_dirty(&self) -> bool {
        self.rt
            .upgrade()
            .and_then(|rt| rt.node_flags(self.id))
            .is_ok_and(|(dirty, _)| dirty)
    }

    /// Number of times the compute function has run.
    pub fn compute_count(&self) -> usize {
        self.cell.runs.get()
    }

    /// Number of values read during the last compute.
    pub fn source_count(&self) -> usize {
        self.rt.upgrade().map_or(0, |rt| rt.source_count(self.id))
    }

    /// Number of computeds and effects currently reading this computed.
    pub fn observer_count(&self) -> usize {
        self.rt.upgrade().map_or(0, |rt| rt.observer_count(self.id))
    }

    /// Remove the computed from the graph. Later reads return
    /// [`ReactiveError::Disposed`].
    pub fn dispose(&self) {
        if let Ok(rt) = self.rt.upgrade() {
            rt.remove_node(self.id);
        }
    }

    /// Whether the computed has been disposed (or its runtime dropped).
    pub fn is_disposed(&self) -> bool {
        self.rt
            .upgrade()
            .map_or(true, |rt| rt.ensure_alive(self.id).is_err())
    }
}

impl<T: 'static> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            id: self.id,
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.id)
            .field("value", &*self.cell.value.borrow())
            .field("runs", &self.cell.runs.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computed_basic() {
        let rt = Runtime::new();
        let a = rt.signal(10);
        let b = rt.signal(20);

        let sum = {
            let (a, b) = (a.clone(), b.clone());
            rt.computed(move || a.get() + b.get())
        };
        assert_eq!(sum.get(), 30);
    }

    #[test]
    fn computed_updates() {
        let rt = Runtime::new();
        let count = rt.signal(5);
        let doubled = {
            let count = count.clone();
            rt.computed(move || count.get() * 2)
        };

        assert_eq!(doubled.get(), 10);
        count.set(10);
        assert!(doubled.is_dirty());
        assert_eq!(doubled.get(), 20);
    }

    #[test]
    fn creation_is_lazy() {
        let rt = Runtime::new();
        let computed = rt.computed(|| 1);
        assert_eq!(computed.compute_count(), 0);
        assert!(computed.is_dirty());
    }

    #[test]
    fn reads_are_memoized() {
        let rt = Runtime::new();
        let source = rt.signal(1);
        let computed = {
            let source = source.clone();
            rt.computed(move || source.get() + 1)
        };

        for _ in 0..5 {
            assert_eq!(computed.get(), 2);
        }
        assert_eq!(computed.compute_count(), 1);
    }

    #[test]
    fn chained_computeds_get_increasing_levels() {
        let rt = Runtime::new();
        let a = rt.signal(1);
        let b = {
            let a = a.clone();
            rt.computed(move || a.get() + 1)
        };
        let c = {
            let b = b.clone();
            rt.computed(move || b.get() * 2)
        };

        assert_eq!(c.get(), 4);
        let level = |id| rt.node_info(id).unwrap().level.unwrap();
        assert_eq!(level(a.id()), 0);
        assert_eq!(level(b.id()), 1);
        assert_eq!(level(c.id()), 2);
    }

    #[test]
    fn failure_is_reported_until_recovery() {
        let rt = Runtime::new();
        let divisor = rt.signal(0);
        let quotient = {
            let divisor = divisor.clone();
            rt.computed(move || {
                let d = divisor.get();
                assert!(d != 0, "division by zero");
                100 / d
            })
        };

        let err = quotient.try_get().unwrap_err();
        assert!(matches!(err, ReactiveError::ComputeFailed { .. }));
        // Still failing without a change.
        assert!(quotient.try_get().is_err());

        divisor.set(4);
        assert_eq!(quotient.try_get(), Ok(25));
    }

    #[test]
    fn self_read_is_a_cycle() {
        let rt = Runtime::new();
        let slot: Rc<RefCell<Option<Computed<i32>>>> = Rc::new(RefCell::new(None));

        let computed = {
            let slot = slot.clone();
            rt.computed(move || {
                let me = slot.borrow().clone();
                me.map_or(0, |me| me.try_get().map_or(-1, |v| v + 1))
            })
        };
        *slot.borrow_mut() = Some(computed.clone());

        // The inner read fails with a cycle and the compute returns -1.
        assert_eq!(computed.get(), -1);
        *slot.borrow_mut() = None;
    }

    #[test]
    fn subscribe_sees_first_and_later_values() {
        let rt = Runtime::new();
        let source = rt.signal(1);
        let computed = {
            let source = source.clone();
            rt.computed(move || source.get() * 10)
        };
        let seen = Rc::new(RefCell::new(Vec::new()));

        let _sub = {
            let seen = seen.clone();
            computed.subscribe(move |new, prev| seen.borrow_mut().push((*new, prev.copied())))
        };
        rt.flush().unwrap();
        assert_eq!(*seen.borrow(), vec![(10, None)]);

        source.set(2);
        rt.flush().unwrap();
        assert_eq!(*seen.borrow(), vec![(10, None), (20, Some(10))]);
    }

    #[test]
    fn subscribe_delivers_first_value_in_immediate_mode() {
        let rt = Runtime::builder()
            .flush_mode(crate::config::FlushMode::Immediate)
            .build()
            .unwrap();
        let source = rt.signal(4);
        let computed = {
            let source = source.clone();
            rt.computed(move || source.get() + 1)
        };
        let hits = Rc::new(Cell::new(0));

        let _sub = {
            let hits = hits.clone();
            computed.subscribe(move |_, _| hits.set(hits.get() + 1))
        };
        assert_eq!(hits.get(), 1);
        assert!(!rt.is_flush_pending());

        source.set(5);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn pulls_inside_a_batch_notify_once() {
        let rt = Runtime::new();
        let source = rt.signal(1);
        let computed = {
            let source = source.clone();
            rt.computed(move || source.get() * 10)
        };
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            computed.subscribe(move |new, prev| seen.borrow_mut().push((*new, prev.copied())))
        };
        rt.flush().unwrap();

        rt.batch(|| {
            source.set(2);
            assert_eq!(computed.get(), 20);
            source.set(3);
            assert_eq!(computed.get(), 30);
        });
        rt.flush().unwrap();
        assert_eq!(*seen.borrow(), vec![(10, None), (30, Some(10))]);
    }

    #[test]
    fn disposed_computed_rejects_reads() {
        let rt = Runtime::new();
        let computed = rt.computed(|| 3);
        assert_eq!(computed.get(), 3);

        computed.dispose();
        assert!(computed.is_disposed());
        assert!(matches!(
            computed.try_get(),
            Err(ReactiveError::Disposed { .. })
        ));
    }
}
