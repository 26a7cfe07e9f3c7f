//! Keyed Store
//!
//! A [`Store`] is a reactive map with one signal per key. Reading a key
//! subscribes only to that key, so writing one entry does not recompute
//! readers of another. Readers of the key set ([`Store::keys`],
//! [`Store::len`]) subscribe to a revision signal that changes whenever a
//! key is inserted or removed.
//!
//! Each slot is a signal node. An untracked read of a missing key creates
//! nothing; a tracked one creates an empty slot so the reader hears about
//! the insert. [`Store::remove`] frees the slot unless something still
//! reads it, in which case it stays empty until the next removal finds it
//! unread.

use std::cell::RefCell;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use indexmap::IndexMap;

use super::runtime::{Runtime, WeakRuntime};
use super::signal::{Signal, SignalOptions};
use crate::error::Result;

struct StoreInner<K: 'static, V: 'static> {
    entries: RefCell<IndexMap<K, Signal<Option<V>>>>,
    revision: Signal<u64>,
}

/// Reactive key-value map.
pub struct Store<K: 'static, V: 'static> {
    rt: WeakRuntime,
    inner: Rc<StoreInner<K, V>>,
}

impl<K, V> Store<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    pub(crate) fn create(rt: &Runtime) -> Self {
        Self {
            rt: rt.downgrade(),
            inner: Rc::new(StoreInner {
                entries: RefCell::new(IndexMap::new()),
                revision: rt.signal_with(0, SignalOptions::default().name("store revision")),
            }),
        }
    }

    /// Signal for `key`, created empty on first use so that readers of a
    /// missing key are notified when it appears.
    fn slot(&self, rt: &Runtime, key: &K) -> Signal<Option<V>> {
        if let Some(slot) = self.inner.entries.borrow().get(key) {
            return slot.clone();
        }
        let slot = rt.signal(None);
        self.inner
            .entries
            .borrow_mut()
            .insert(key.clone(), slot.clone());
        slot
    }

    /// Tracked read of one entry.
    pub fn get(&self, key: &K) -> Option<V> {
        self.try_get(key).unwrap_or_else(|err| panic!("{err}"))
    }

    /// Fallible form of [`get`](Self::get).
    pub fn try_get(&self, key: &K) -> Result<Option<V>> {
        let rt = self.rt.upgrade()?;
        if !rt.is_tracking() && !self.inner.entries.borrow().contains_key(key) {
            return Ok(None);
        }
        self.slot(&rt, key).try_get()
    }

    /// Untracked read of one entry.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner
            .entries
            .borrow()
            .get(key)
            .and_then(|slot| slot.peek())
    }

    /// Tracked presence check.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace an entry.
    pub fn set(&self, key: K, value: V) {
        if let Err(err) = self.try_set(key, value) {
            panic!("{err}");
        }
    }

    /// Fallible form of [`set`](Self::set). The write and the key-set
    /// change land in one batch.
    pub fn try_set(&self, key: K, value: V) -> Result<()> {
        let rt = self.rt.upgrade()?;
        let slot = self.slot(&rt, &key);
        rt.batch(|| {
            let inserted = slot.peek().is_none();
            slot.try_set(Some(value))?;
            if inserted {
                self.inner.revision.try_update(|rev| rev + 1)?;
            }
            Ok(())
        })
    }

    /// Remove an entry, returning its last value.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.try_remove(key).unwrap_or_else(|err| panic!("{err}"))
    }

    /// Fallible form of [`remove`](Self::remove).
    pub fn try_remove(&self, key: &K) -> Result<Option<V>> {
        let rt = self.rt.upgrade()?;
        let Some(slot) = self.inner.entries.borrow().get(key).cloned() else {
            return Ok(None);
        };
        let previous = slot.peek();
        if previous.is_some() {
            rt.batch(|| {
                slot.try_set(None)?;
                self.inner.revision.try_update(|rev| rev + 1)
            })?;
        }
        if slot.observer_count() == 0 {
            self.inner.entries.borrow_mut().shift_remove(key);
            rt.remove_node(slot.id());
        }
        Ok(previous)
    }

    /// Keys with a value, in insertion order. Tracks the key set.
    pub fn keys(&self) -> Vec<K> {
        self.inner.revision.get();
        self.inner
            .entries
            .borrow()
            .iter()
            .filter(|(_, slot)| slot.with_untracked(Option::is_some))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of entries with a value. Tracks the key set.
    pub fn len(&self) -> usize {
        self.inner.revision.get();
        self.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of inserts and removals so far, untracked.
    pub fn revision(&self) -> u64 {
        self.inner.revision.peek()
    }

    fn count(&self) -> usize {
        self.inner
            .entries
            .borrow()
            .values()
            .filter(|slot| slot.with_untracked(Option::is_some))
            .count()
    }
}

impl<K: 'static, V: 'static> Clone for Store<K, V> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<K: 'static, V: 'static> fmt::Debug for Store<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("slots", &self.inner.entries.borrow().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn store_set_get_remove() {
        let rt = Runtime::new();
        let store: Store<&'static str, i32> = rt.store();

        assert_eq!(store.get(&"a"), None);
        store.set("a", 1);
        store.set("b", 2);
        assert_eq!(store.get(&"a"), Some(1));
        assert_eq!(store.len(), 2);
        assert_eq!(store.keys(), vec!["a", "b"]);

        assert_eq!(store.remove(&"a"), Some(1));
        assert_eq!(store.remove(&"a"), None);
        assert_eq!(store.keys(), vec!["b"]);
        assert_eq!(store.revision(), 3);
    }

    #[test]
    fn per_key_tracking() {
        let rt = Runtime::new();
        let store: Store<u32, String> = rt.store();
        store.set(1, "one".into());
        store.set(2, "two".into());

        let runs = Rc::new(Cell::new(0));
        let first = {
            let (store, runs) = (store.clone(), runs.clone());
            rt.computed(move || {
                runs.set(runs.get() + 1);
                store.get(&1)
            })
        };
        assert_eq!(first.get().as_deref(), Some("one"));

        store.set(2, "deux".into());
        assert_eq!(first.get().as_deref(), Some("one"));
        assert_eq!(runs.get(), 1);

        store.set(1, "un".into());
        assert_eq!(first.get().as_deref(), Some("un"));
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn missing_key_readers_see_insertion() {
        let rt = Runtime::new();
        let store: Store<&'static str, i32> = rt.store();
        let value = {
            let store = store.clone();
            rt.computed(move || store.get(&"late").unwrap_or(-1))
        };

        assert_eq!(value.get(), -1);
        store.set("late", 9);
        assert_eq!(value.get(), 9);
    }

    #[test]
    fn unread_slots_are_freed() {
        let rt = Runtime::new();
        let store: Store<u32, u32> = rt.store();
        let baseline = rt.node_count();

        for key in 0..50 {
            assert_eq!(store.get(&key), None);
        }
        assert_eq!(rt.node_count(), baseline);

        store.set(1, 10);
        assert_eq!(rt.node_count(), baseline + 1);
        assert_eq!(store.remove(&1), Some(10));
        assert_eq!(rt.node_count(), baseline);
        assert!(rt.check_invariants().is_ok());
    }

    #[test]
    fn removal_keeps_slots_that_are_still_read() {
        let rt = Runtime::new();
        let store: Store<&'static str, i32> = rt.store();
        store.set("k", 1);
        let value = {
            let store = store.clone();
            rt.computed(move || store.get(&"k"))
        };
        assert_eq!(value.get(), Some(1));

        assert_eq!(store.remove(&"k"), Some(1));
        assert_eq!(value.get(), None);

        store.set("k", 2);
        assert_eq!(value.get(), Some(2));
    }

    #[test]
    fn key_set_readers_ignore_value_changes() {
        let rt = Runtime::new();
        let store: Store<&'static str, i32> = rt.store();
        store.set("a", 1);

        let size = {
            let store = store.clone();
            rt.computed(move || store.len())
        };
        assert_eq!(size.get(), 1);

        store.set("a", 2);
        assert!(!size.is_dirty());

        store.set("b", 3);
        assert_eq!(size.get(), 2);
    }
}
