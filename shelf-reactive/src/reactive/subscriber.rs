//! Subscriber types for the reactive system.
//!
//! Raw subscribers sit beside the dependency graph: they receive change
//! notifications for a single signal or computed without becoming nodes.
//! Persistence hooks and other "tell me when this changes" code use them.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// Identifier for a subscriber within one subscriber list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// An ordered list of subscriber callbacks.
pub(crate) struct Subscribers<F: ?Sized> {
    next_id: Cell<u64>,
    entries: RefCell<Vec<(SubscriberId, Rc<F>)>>,
}

impl<F: ?Sized> Subscribers<F> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: Cell::new(0),
            entries: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn insert(&self, callback: Rc<F>) -> SubscriberId {
        let id = SubscriberId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.entries.borrow_mut().push((id, callback));
        id
    }

    pub(crate) fn remove(&self, id: SubscriberId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Copy of the current entries, so callbacks can run without holding
    /// the list borrowed (a callback may unsubscribe itself).
    pub(crate) fn snapshot(&self) -> Vec<(SubscriberId, Rc<F>)> {
        self.entries
            .borrow()
            .iter()
            .map(|(id, callback)| (*id, Rc::clone(callback)))
            .collect()
    }

    pub(crate) fn contains(&self, id: SubscriberId) -> bool {
        self.entries.borrow().iter().any(|(entry, _)| *entry == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

/// A change queued for delivery, shared by the callbacks of every
/// subscriber of one node.
///
/// While no callback has run yet, later writes in the same batch fold into
/// it: `next` is replaced and `previous` kept, so subscribers see the batch
/// as a single change.
pub(crate) struct PendingChange<N, P> {
    next: RefCell<N>,
    previous: P,
    delivering: Cell<bool>,
    /// The folded writes cancelled out.
    void: Cell<bool>,
}

impl<N, P> PendingChange<N, P> {
    pub(crate) fn new(next: N, previous: P) -> Rc<Self> {
        Rc::new(Self {
            next: RefCell::new(next),
            previous,
            delivering: Cell::new(false),
            void: Cell::new(false),
        })
    }

    /// Whether later writes can still be folded in.
    pub(crate) fn is_open(&self) -> bool {
        !self.delivering.get()
    }

    pub(crate) fn previous(&self) -> &P {
        &self.previous
    }

    /// Replace the value to deliver. `void` marks a net no-op.
    pub(crate) fn absorb(&self, next: N, void: bool) {
        debug_assert!(self.is_open(), "change absorbed after delivery began");
        *self.next.borrow_mut() = next;
        self.void.set(void);
    }

    /// Hand the change to one subscriber, closing it to further writes.
    pub(crate) fn deliver(&self, f: impl FnOnce(&N, &P)) {
        self.delivering.set(true);
        if !self.void.get() {
            f(&self.next.borrow(), &self.previous);
        }
    }
}

/// Subscriber lists that can drop an entry through a type-erased handle.
pub(crate) trait Unsubscribe {
    fn unsubscribe(&self, id: SubscriberId);
}

impl<F: ?Sized> Unsubscribe for Subscribers<F> {
    fn unsubscribe(&self, id: SubscriberId) {
        self.remove(id);
    }
}

/// Handle to a raw subscription.
///
/// Dropping the handle unsubscribes. Call [`detach`](Self::detach) to keep
/// the subscription for the lifetime of the signal instead.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: SubscriberId,
    list: Option<Weak<dyn Unsubscribe>>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriberId, list: Weak<dyn Unsubscribe>) -> Self {
        Self {
            id,
            list: Some(list),
        }
    }

    /// The subscriber's id.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Stop receiving notifications.
    pub fn dispose(mut self) {
        self.cancel();
    }

    /// Keep the subscription alive without holding the handle.
    pub fn detach(mut self) {
        self.list = None;
    }

    fn cancel(&mut self) {
        if let Some(list) = self.list.take().and_then(|list| list.upgrade()) {
            list.unsubscribe(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.list.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Callback = dyn Fn(&i32);

    #[test]
    fn subscriber_ids_are_unique() {
        let list: Subscribers<Callback> = Subscribers::new();
        let a = list.insert(Rc::new(|_: &i32| {}));
        let b = list.insert(Rc::new(|_: &i32| {}));
        assert_ne!(a, b);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn snapshot_calls_every_callback() {
        let list: Subscribers<Callback> = Subscribers::new();
        let total = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let total = total.clone();
            list.insert(Rc::new(move |v: &i32| total.set(total.get() + v)));
        }

        for (_, callback) in list.snapshot() {
            callback(&2);
        }
        assert_eq!(total.get(), 6);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let list: Rc<Subscribers<Callback>> = Rc::new(Subscribers::new());
        let id = list.insert(Rc::new(|_: &i32| {}));
        let weak: Weak<dyn Unsubscribe> = Rc::downgrade(&list) as Weak<dyn Unsubscribe>;

        let subscription = Subscription::new(id, weak);
        assert!(list.contains(id));
        drop(subscription);
        assert!(list.is_empty());
        assert!(!list.contains(id));
    }

    #[test]
    fn detached_subscription_stays() {
        let list: Rc<Subscribers<Callback>> = Rc::new(Subscribers::new());
        let id = list.insert(Rc::new(|_: &i32| {}));
        let weak: Weak<dyn Unsubscribe> = Rc::downgrade(&list) as Weak<dyn Unsubscribe>;

        Subscription::new(id, weak).detach();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn pending_change_folds_until_delivered() {
        let change = PendingChange::new(1, 0);
        change.absorb(2, false);
        change.absorb(3, false);

        let mut seen = Vec::new();
        change.deliver(|next, prev| seen.push((*next, *prev)));
        change.deliver(|next, prev| seen.push((*next, *prev)));
        assert_eq!(seen, vec![(3, 0), (3, 0)]);
        assert!(!change.is_open());
    }

    #[test]
    fn void_change_is_not_delivered() {
        let change = PendingChange::new(1, 0);
        change.absorb(0, true);

        let calls = Cell::new(0);
        change.deliver(|_, _| calls.set(calls.get() + 1));
        assert_eq!(calls.get(), 0);
    }
}
