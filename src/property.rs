//! Typed property bag for contexts and phases
//!
//! Add-on modules attach their own state to a [`Context`](crate::Context) or
//! [`Phase`](crate::Phase) through a [`PropertyKey`]. The key carries the
//! value type, so lookups never need to guess what was stored.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Mutex;

/// Strongly typed key into a [`PropertyBag`].
///
/// Declare keys as constants in the module that owns the property:
///
/// ```rust
/// use phased_idempotency::PropertyKey;
///
/// const ATTEMPTS: PropertyKey<u32> = PropertyKey::new("my_crate.retries", "attempts");
/// assert_eq!(ATTEMPTS.qualified_name(), "my_crate.retries.attempts");
/// ```
pub struct PropertyKey<T> {
    namespace: &'static str,
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> PropertyKey<T> {
    /// Create a key in `namespace`
    pub const fn new(namespace: &'static str, name: &'static str) -> Self {
        Self {
            namespace,
            name,
            _type: PhantomData,
        }
    }

    /// `"<namespace>.<name>"`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl<T> Clone for PropertyKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PropertyKey<T> {}

impl<T> std::fmt::Debug for PropertyKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PropertyKey({}.{})", self.namespace, self.name)
    }
}

type Slot = (String, TypeId);

/// Namespaced, lazily initialised attribute store
#[derive(Default)]
pub struct PropertyBag {
    values: Mutex<HashMap<Slot, Box<dyn Any + Send>>>,
}

impl PropertyBag {
    /// Empty bag
    pub fn new() -> Self {
        Self::default()
    }

    fn slot<T: 'static>(key: &PropertyKey<T>) -> Slot {
        (key.qualified_name(), TypeId::of::<T>())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Slot, Box<dyn Any + Send>>> {
        // Values are plain data; a panic elsewhere leaves them consistent.
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current value, if initialised
    pub fn get<T: Clone + Send + 'static>(&self, key: &PropertyKey<T>) -> Option<T> {
        self.lock()
            .get(&Self::slot(key))
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Current value, computing and caching it with `init` on first access
    pub fn get_or_init<T, F>(&self, key: &PropertyKey<T>, init: F) -> T
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T,
    {
        self.update(key, init, |v| v.clone())
    }

    /// Fallible variant of [`get_or_init`](Self::get_or_init); nothing is cached on error
    pub fn try_get_or_init<T, E, F>(&self, key: &PropertyKey<T>, init: F) -> Result<T, E>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = init()?;
        Ok(self.update(key, || value, |v| v.clone()))
    }

    /// Replace the value
    pub fn set<T: Send + 'static>(&self, key: &PropertyKey<T>, value: T) {
        self.lock().insert(Self::slot(key), Box::new(value));
    }

    /// Mutate the value in place, initialising it with `init` first if needed.
    ///
    /// `init` runs without the bag locked, so it may read the bag itself. If
    /// another caller initialises the slot meanwhile, that value wins and the
    /// one from `init` is dropped.
    pub fn update<T, R, I, F>(&self, key: &PropertyKey<T>, init: I, f: F) -> R
    where
        T: Send + 'static,
        I: FnOnce() -> T,
        F: FnOnce(&mut T) -> R,
    {
        let slot = Self::slot(key);
        if let Some(value) = self.lock().get_mut(&slot).and_then(|v| v.downcast_mut::<T>()) {
            return f(value);
        }

        let fresh = init();
        let mut values = self.lock();
        let entry = values.entry(slot).or_insert_with(|| Box::new(fresh));
        match entry.downcast_mut::<T>() {
            Some(value) => f(value),
            // The slot includes the TypeId, so the downcast always matches.
            None => unreachable!("property slot holds a foreign type"),
        }
    }

    /// Remove and return the value
    pub fn remove<T: Send + 'static>(&self, key: &PropertyKey<T>) -> Option<T> {
        self.lock()
            .remove(&Self::slot(key))
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    /// Whether a value is stored under `key`
    pub fn contains<T: 'static>(&self, key: &PropertyKey<T>) -> bool {
        self.lock().contains_key(&Self::slot(key))
    }
}

impl std::fmt::Debug for PropertyBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.lock().keys().map(|(name, _)| name.clone()).collect();
        f.debug_struct("PropertyBag").field("keys", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: PropertyKey<u32> = PropertyKey::new("tests", "counter");
    const QUEUE: PropertyKey<Vec<String>> = PropertyKey::new("tests", "queue");
    const SAME_NAME_OTHER_TYPE: PropertyKey<String> = PropertyKey::new("tests", "counter");

    #[test]
    fn test_lazy_initialisation_runs_once() {
        let bag = PropertyBag::new();
        let mut calls = 0;
        assert_eq!(bag.get(&COUNTER), None);
        assert_eq!(bag.get_or_init(&COUNTER, || { calls += 1; 7 }), 7);
        assert_eq!(bag.get_or_init(&COUNTER, || 99), 7);
        assert_eq!(calls, 1);

        bag.set(&COUNTER, 8);
        assert_eq!(bag.get(&COUNTER), Some(8));
    }

    #[test]
    fn test_update_in_place() {
        let bag = PropertyBag::new();
        bag.update(&QUEUE, Vec::new, |q| q.push("a".to_string()));
        let len = bag.update(&QUEUE, Vec::new, |q| {
            q.push("b".to_string());
            q.len()
        });
        assert_eq!(len, 2);
        assert_eq!(bag.remove(&QUEUE), Some(vec!["a".to_string(), "b".to_string()]));
        assert!(!bag.contains(&QUEUE));
    }

    #[test]
    fn test_initialiser_may_read_the_bag() {
        let bag = PropertyBag::new();
        bag.set(&COUNTER, 2);
        let queue = bag.get_or_init(&QUEUE, || {
            let count = bag.get(&COUNTER).unwrap_or_default();
            vec![format!("count={count}")]
        });
        assert_eq!(queue, vec!["count=2".to_string()]);
    }

    #[test]
    fn test_keys_are_typed() {
        let bag = PropertyBag::new();
        bag.set(&COUNTER, 1);
        bag.set(&SAME_NAME_OTHER_TYPE, "one".to_string());
        assert_eq!(bag.get(&COUNTER), Some(1));
        assert_eq!(bag.get(&SAME_NAME_OTHER_TYPE), Some("one".to_string()));
    }

    #[test]
    fn test_failed_init_is_not_cached() {
        let bag = PropertyBag::new();
        let err: Result<u32, &str> = bag.try_get_or_init(&COUNTER, || Err("boom"));
        assert_eq!(err, Err("boom"));
        assert!(!bag.contains(&COUNTER));
        assert_eq!(bag.try_get_or_init::<_, &str, _>(&COUNTER, || Ok(3)), Ok(3));
    }
}
