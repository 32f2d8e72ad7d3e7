use crate::RwLock;
use foldhash::fast::RandomState;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};

/// A thread-safe hashmap guarded by a single reader-writer lock.
///
/// Lookups (`get`, `contains_key`, `len`, `values`) take the lock in shared
/// mode and run in parallel with each other. Every mutation, and `for_each`,
/// takes it in exclusive mode. Values are handed out as clones or moved out,
/// never as long-lived references into the map.
pub struct ConcurrentMap<K, V, S = RandomState> {
    entries: RwLock<HashMap<K, V, S>>,
}

impl<K: Eq + Hash, V> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V> ConcurrentMap<K, V> {
    /// Creates an empty `ConcurrentMap`.
    ///
    /// # Examples
    /// ```
    /// use tsmap::ConcurrentMap;
    ///
    /// let map = ConcurrentMap::<String, u32>::new();
    /// assert!(map.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }

    /// Creates an empty `ConcurrentMap` able to hold at least `capacity`
    /// entries without reallocating.
    ///
    /// # Arguments
    ///
    /// * `capacity` - The initial capacity of the hashmap.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::default())
    }
}

impl<K, V, S> ConcurrentMap<K, V, S> {
    /// Creates an empty `ConcurrentMap` which will use the given hash builder.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    /// Creates an empty `ConcurrentMap` with the specified capacity and hash builder.
    ///
    /// # Arguments
    ///
    /// * `capacity` - The initial capacity of the hashmap.
    /// * `hasher` - The hash builder used for every key.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity_and_hasher(capacity, hasher)),
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// **Locking behaviour:** shared.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if the map holds no entries.
    ///
    /// **Locking behaviour:** shared.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Calls `func` once for every value in the map, in unspecified order.
    ///
    /// The exclusive lock is held for the whole traversal, so the visited set
    /// is a consistent snapshot and no writer runs in between.
    ///
    /// **Locking behaviour:** exclusive. Deadlock if `func` calls back into the
    /// same map; collect with [`values`](Self::values) first if it needs to.
    ///
    /// # Examples
    /// ```
    /// use tsmap::ConcurrentMap;
    ///
    /// let map = ConcurrentMap::<&str, u32>::new();
    /// map.set("a", 1);
    /// map.set("b", 2);
    ///
    /// let mut sum = 0;
    /// map.for_each(|v| sum += v);
    /// assert_eq!(sum, 3);
    /// ```
    pub fn for_each<F>(&self, func: F)
    where
        F: FnMut(&V),
    {
        self.entries.write().values().for_each(func);
    }

    /// Returns a snapshot of every value currently in the map.
    ///
    /// Unlike [`for_each`](Self::for_each) the lock is released before the
    /// caller looks at the values, at the cost of cloning all of them.
    ///
    /// **Locking behaviour:** shared.
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.entries.read().values().cloned().collect()
    }

    /// Consumes the map, returning the underlying `HashMap`.
    pub fn into_inner(self) -> HashMap<K, V, S> {
        self.entries.into_inner()
    }
}

impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Gets a clone of the value associated with the given key.
    ///
    /// # Arguments
    /// * `key` - The key to look up
    ///
    /// # Returns
    /// * `Some(V)` if the key exists
    /// * `None` if the key doesn't exist
    ///
    /// **Locking behaviour:** shared.
    ///
    /// # Examples
    /// ```
    /// use tsmap::ConcurrentMap;
    ///
    /// let map = ConcurrentMap::<String, String>::new();
    /// map.set("one".to_string(), "data1".to_string());
    /// assert_eq!(map.get("one").as_deref(), Some("data1"));
    /// assert_eq!(map.get("missing"), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.read().get(key).cloned()
    }

    /// Returns `true` if the map contains the given key.
    ///
    /// **Locking behaviour:** shared.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.read().contains_key(key)
    }

    /// Sets a value in the map, replacing any previous value for the key.
    ///
    /// # Arguments
    /// * `key` - The key to update
    /// * `value` - The value to set
    ///
    /// **Locking behaviour:** exclusive.
    ///
    /// # Examples
    /// ```
    /// use tsmap::ConcurrentMap;
    ///
    /// let map = ConcurrentMap::<String, u32>::new();
    ///
    /// // Set a value
    /// map.set("key".to_string(), 42);
    ///
    /// // Update existing value
    /// map.set("key".to_string(), 123);
    /// assert_eq!(map.get("key"), Some(123));
    /// ```
    pub fn set(&self, key: K, value: V) {
        let previous = self.entries.write().insert(key, value);
        // The replaced value is dropped here, outside the lock.
        drop(previous);
    }

    /// Removes a key from the map and returns its value.
    ///
    /// Reading and removing happen under one exclusive lock, so only one
    /// concurrent caller can pop a given value.
    ///
    /// # Returns
    /// * `Some(V)` if the key existed
    /// * `None` if the key doesn't exist, the map is left unchanged
    ///
    /// **Locking behaviour:** exclusive.
    ///
    /// # Examples
    /// ```
    /// use tsmap::ConcurrentMap;
    ///
    /// let map = ConcurrentMap::<String, u32>::new();
    /// map.set("key".to_string(), 42);
    /// assert_eq!(map.pop("key"), Some(42));
    /// assert_eq!(map.pop("key"), None);
    /// ```
    pub fn pop<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.write().remove(key)
    }

    /// Removes a key from the map, discarding its value.
    ///
    /// # Returns
    /// `true` if the key existed and was removed.
    ///
    /// **Locking behaviour:** exclusive.
    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.pop(key).is_some()
    }

    /// Removes every listed key that is present. Absent keys are ignored.
    ///
    /// The whole batch runs under a single exclusive lock, so no reader can
    /// observe it half applied.
    ///
    /// **Locking behaviour:** exclusive.
    ///
    /// # Examples
    /// ```
    /// use tsmap::ConcurrentMap;
    ///
    /// let map = ConcurrentMap::<String, u32>::new();
    /// map.set("a".to_string(), 1);
    /// map.set("b".to_string(), 2);
    /// map.delete_multiple(["a", "b", "c"]);
    /// assert!(map.is_empty());
    /// ```
    pub fn delete_multiple<'q, Q, I>(&self, keys: I)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized + 'q,
        I: IntoIterator<Item = &'q Q>,
    {
        let removed = {
            let mut entries = self.entries.write();
            keys.into_iter()
                .filter_map(|key| entries.remove(key))
                .collect::<Vec<_>>()
        };
        log::trace!("delete_multiple removed {} entries", removed.len());
    }

    /// Removes every entry, leaving a fresh empty table behind.
    ///
    /// The old entries are dropped after the lock has been released.
    ///
    /// **Locking behaviour:** exclusive.
    pub fn flush(&self)
    where
        S: Clone,
    {
        let flushed = {
            let mut entries = self.entries.write();
            let fresh = HashMap::with_hasher(entries.hasher().clone());
            std::mem::replace(&mut *entries, fresh)
        };
        log::trace!("flush removed {} entries", flushed.len());
    }
}

impl<K, V, S> fmt::Debug for ConcurrentMap<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.read().iter()).finish()
    }
}

impl<K, V, S> FromIterator<(K, V)> for ConcurrentMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: RwLock::new(iter.into_iter().collect()),
        }
    }
}
