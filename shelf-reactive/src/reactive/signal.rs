//! Signal Primitive
//!
//! Signals are the fundamental reactive primitive. They hold a value and
//! notify dependents when the value changes.
//!
//! # How Signals Work
//!
//! 1. A signal is created with an initial value and an equality function
//! 2. When read inside a computed or effect, it records that dependency
//! 3. When written and the equality function says the value changed:
//!    - The new value is stored
//!    - The signal and its transitive observers are marked dirty
//!    - Raw subscribers are queued for the next flush, once per write or
//!      once per batch
//!
//! Writing a value equal to the current one does nothing at all.

use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::trace;

use super::runtime::{Runtime, WeakRuntime};
use super::subscriber::{PendingChange, Subscribers, Subscription, Unsubscribe};
use crate::error::{ReactiveError, Result};
use crate::graph::{Node, NodeId, NodeKind};

pub(crate) type EqualsFn<T> = Box<dyn Fn(&T, &T) -> bool>;

type SignalSubscriber<T> = dyn Fn(&T, &T);

/// Options for creating signals and computeds.
pub struct SignalOptions<T> {
    pub(crate) name: Option<Cow<'static, str>>,
    pub(crate) equals: EqualsFn<T>,
}

impl<T: PartialEq + 'static> Default for SignalOptions<T> {
    fn default() -> Self {
        Self {
            name: None,
            equals: Box::new(|a: &T, b: &T| a == b),
        }
    }
}

impl<T: 'static> SignalOptions<T> {
    /// Options with a custom equality function.
    pub fn with_equals(equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
        Self {
            name: None,
            equals: Box::new(equals),
        }
    }

    /// Options under which every write counts as a change.
    pub fn always_notify() -> Self {
        Self::with_equals(|_: &T, _: &T| false)
    }

    /// Set the debug name shown in logs and diagnostics.
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the equality function.
    pub fn equals(mut self, equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.equals = Box::new(equals);
        self
    }
}

impl<T> fmt::Debug for SignalOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalOptions")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct SignalCell<T: 'static> {
    value: RefCell<T>,
    equals: EqualsFn<T>,
    subscribers: Rc<Subscribers<SignalSubscriber<T>>>,
    /// Change queued during the current batch, if still undelivered.
    open: RefCell<Option<Rc<PendingChange<T, T>>>>,
}

/// A reactive value cell.
///
/// Cloning a `Signal` produces another handle to the same cell.
pub struct Signal<T: 'static> {
    rt: WeakRuntime,
    id: NodeId,
    cell: Rc<SignalCell<T>>,
}

impl<T: Clone + 'static> Signal<T> {
    pub(crate) fn create(rt: &Runtime, initial: T, options: SignalOptions<T>) -> Self {
        let id = rt.insert_node(Node::new(NodeKind::Signal, options.name));
        Self {
            rt: rt.downgrade(),
            id,
            cell: Rc::new(SignalCell {
                value: RefCell::new(initial),
                equals: options.equals,
                subscribers: Rc::new(Subscribers::new()),
                open: RefCell::new(None),
            }),
        }
    }

    /// The node id of this signal.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the current value, tracking the read.
    ///
    /// # Panics
    ///
    /// Panics if the runtime has been dropped or the read closes a cycle.
    /// Use [`try_get`](Self::try_get) to handle those cases.
    pub fn get(&self) -> T {
        self.try_get().unwrap_or_else(|err| panic!("{err}"))
    }

    /// Get the current value, tracking the read.
    pub fn try_get(&self) -> Result<T> {
        self.try_with(T::clone)
    }

    /// Borrow the current value, tracking the read.
    ///
    /// The value stays borrowed while `f` runs; writing this signal from
    /// inside `f` panics.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.try_with(f).unwrap_or_else(|err| panic!("{err}"))
    }

    /// Fallible form of [`with`](Self::with).
    pub fn try_with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let rt = self.rt.upgrade()?;
        rt.track(self.id)?;
        let value = self.cell.value.borrow();
        Ok(f(&value))
    }

    /// Get the current value without tracking.
    pub fn peek(&self) -> T {
        self.cell.value.borrow().clone()
    }

    /// Borrow the current value without tracking.
    pub fn with_untracked<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.cell.value.borrow())
    }

    /// Set a new value.
    ///
    /// # Panics
    ///
    /// Panics if the runtime has been dropped or the equality function
    /// panics. Use [`try_set`](Self::try_set) to handle those cases.
    pub fn set(&self, value: T) {
        if let Err(err) = self.try_set(value) {
            panic!("{err}");
        }
    }

    /// Set a new value. Returns whether the value changed.
    pub fn try_set(&self, value: T) -> Result<bool> {
        let rt = self.rt.upgrade()?;
        self.commit(&rt, value)
    }

    /// Replace the value with `f(current)`.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        if let Err(err) = self.try_update(f) {
            panic!("{err}");
        }
    }

    /// Fallible form of [`update`](Self::update).
    pub fn try_update(&self, f: impl FnOnce(&T) -> T) -> Result<bool> {
        let rt = self.rt.upgrade()?;
        let next = {
            let current = self.cell.value.borrow();
            f(&current)
        };
        self.commit(&rt, next)
    }

    fn commit(&self, rt: &Runtime, next: T) -> Result<bool> {
        rt.ensure_alive(self.id)?;

        let unchanged = rt
            .invoke(|| (self.cell.equals)(&self.cell.value.borrow(), &next))
            .map_err(|message| ReactiveError::EqualityPanicked {
                node: rt.label(self.id),
                message,
            })?;
        if unchanged {
            trace!(signal = ?self.id, "write ignored; value unchanged");
            return Ok(false);
        }

        let previous = self.cell.value.replace(next);
        trace!(signal = ?self.id, "signal written");
        rt.mark_dirty(self.id);

        if !self.cell.subscribers.is_empty() {
            self.notify(rt, previous);
        }

        rt.settle();
        Ok(true)
    }

    fn notify(&self, rt: &Runtime, previous: T) {
        let next = self.cell.value.borrow().clone();
        let batching = rt.is_batching();
        let open = batching
            .then(|| self.cell.open.borrow().clone())
            .flatten()
            .filter(|change| change.is_open());
        if let Some(change) = open {
            let void = rt
                .invoke(|| (self.cell.equals)(change.previous(), &next))
                .unwrap_or(false);
            change.absorb(next, void);
            return;
        }

        // One queued notification per subscriber, so a panicking
        // subscriber cannot starve the others.
        let change = PendingChange::new(next, previous);
        let origin = rt.label(self.id);
        for (subscriber, callback) in self.cell.subscribers.snapshot() {
            let change = Rc::clone(&change);
            let list = Rc::downgrade(&self.cell.subscribers);
            rt.enqueue(
                origin.clone(),
                Box::new(move || {
                    if list.upgrade().is_some_and(|list| list.contains(subscriber)) {
                        change.deliver(|next, prev| callback(next, prev));
                    }
                }),
            );
        }
        *self.cell.open.borrow_mut() = batching.then_some(change);
    }

    /// Call `f(new, previous)` after every change, at the end of the flush
    /// pass that follows the write. All writes made inside one batch reach
    /// `f` as a single change from the value before the batch.
    pub fn subscribe(&self, f: impl Fn(&T, &T) + 'static) -> Subscription {
        let callback: Rc<SignalSubscriber<T>> = Rc::new(f);
        let id = self.cell.subscribers.insert(callback);
        let list: Weak<dyn Unsubscribe> = Rc::downgrade(&self.cell.subscribers) as Weak<dyn Unsubscribe>;
        Subscription::new(id, list)
    }

    /// Number of raw subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.cell.subscribers.len()
    }

    /// Number of computeds and effects currently reading this signal.
    pub fn observer_count(&self) -> usize {
        self.rt
            .upgrade()
            .map_or(0, |rt| rt.observer_count(self.id))
    }
}

impl<T: 'static> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            id: self.id,
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("value", &*self.cell.value.borrow())
            .finish()
    }
}
