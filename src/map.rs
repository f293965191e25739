use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::guard::{self, Guard};
use crate::lifecycle::Lifecycle;
use crate::raw::table::Table;
use crate::raw::{PutCondition, RawMap, TableCounters};
use crate::word::{self, Word};

/// A lock-free hash table for word-sized keys and values.
///
/// The table grows by allocating a larger successor and migrating entries
/// cooperatively: every writer copies a small chunk on its way through, so
/// no thread ever stops the world. Operations go through a pinned handle
/// obtained with [`HashMap::pin`], which registers the calling thread with
/// the table's reclamation machinery.
///
/// # Examples
///
/// ```
/// let map = moult::HashMap::new();
/// let m = map.pin();
///
/// m.put(1usize, 10usize);
/// assert_eq!(m.get(1), Some(10));
/// assert!(m.remove(1));
/// assert_eq!(m.get(1), None);
/// ```
pub struct HashMap<K, V, S = RandomState, M = ()> {
    raw: RawMap<K, V, S, M>,
}

/// A builder for a [`HashMap`].
///
/// # Examples
///
/// ```
/// let map: moult::HashMap<usize, usize> = moult::HashMap::builder()
///     // Expected number of entries before the first resize.
///     .capacity(128)
///     // Fraction of slots holding keys before the table counts as full.
///     .density(0.5)
///     .build();
///
/// map.pin().put(1, 2);
/// ```
pub struct HashMapBuilder<K, V, S = RandomState, M = ()> {
    capacity: usize,
    density: f64,
    hasher: S,
    manager: M,
    _kv: PhantomData<(K, V)>,
}

/// The default fraction of slots holding keys before a table counts as
/// full.
const DEFAULT_DENSITY: f64 = 0.5;

impl<K, V> HashMap<K, V> {
    /// Creates an empty `HashMap`.
    ///
    /// The map starts with a minimal table and grows by migration, so small
    /// maps stay small.
    pub fn new() -> HashMap<K, V> {
        HashMap::with_capacity(1)
    }

    /// Creates an empty `HashMap` sized to hold `capacity` entries before
    /// the first resize.
    ///
    /// The internal table length is the capacity divided by the density,
    /// rounded up to a power of two.
    pub fn with_capacity(capacity: usize) -> HashMap<K, V> {
        HashMap::builder().capacity(capacity).build()
    }

    /// Returns a builder for more involved configuration: density, a custom
    /// hasher, or a key/value lifecycle manager.
    pub fn builder() -> HashMapBuilder<K, V> {
        HashMapBuilder {
            capacity: 1,
            density: DEFAULT_DENSITY,
            hasher: RandomState::new(),
            manager: (),
            _kv: PhantomData,
        }
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates an empty `HashMap` which will use the given hash builder to
    /// hash keys.
    pub fn with_hasher(hasher: S) -> HashMap<K, V, S> {
        HashMap::with_capacity_and_hasher(1, hasher)
    }

    /// Creates an empty `HashMap` with the specified capacity, using
    /// `hasher` to hash the keys.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> HashMap<K, V, S> {
        HashMap {
            raw: RawMap::new(capacity, DEFAULT_DENSITY, hasher, ()),
        }
    }
}

impl<K, V, S, M> Default for HashMap<K, V, S, M>
where
    S: Default,
    M: Default,
{
    fn default() -> Self {
        HashMap {
            raw: RawMap::new(1, DEFAULT_DENSITY, S::default(), M::default()),
        }
    }
}

impl<K, V> HashMapBuilder<K, V> {
    /// Set the hash builder used to hash keys.
    pub fn hasher<S>(self, hasher: S) -> HashMapBuilder<K, V, S> {
        HashMapBuilder {
            capacity: self.capacity,
            density: self.density,
            hasher,
            manager: self.manager,
            _kv: PhantomData,
        }
    }
}

impl<K, V, S, M> HashMapBuilder<K, V, S, M> {
    /// Set the number of entries the map should hold before its first
    /// resize. Must be at least 1.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the fraction of slots that may hold keys before a table counts
    /// as full. Must lie strictly between 0 and 1.
    ///
    /// Lower densities trade memory for shorter probe sequences.
    pub fn density(mut self, density: f64) -> Self {
        self.density = density;
        self
    }

    /// Set the key/value lifecycle manager. See [`Lifecycle`].
    pub fn manager<M2>(self, manager: M2) -> HashMapBuilder<K, V, S, M2> {
        HashMapBuilder {
            capacity: self.capacity,
            density: self.density,
            hasher: self.hasher,
            manager,
            _kv: PhantomData,
        }
    }

    /// Construct a [`HashMap`] from the builder, using the configured
    /// options.
    pub fn build(self) -> HashMap<K, V, S, M> {
        HashMap {
            raw: RawMap::new(self.capacity, self.density, self.hasher, self.manager),
        }
    }
}

impl<K, V, S, M> HashMap<K, V, S, M> {
    /// Pins the current thread to this map, returning a handle for map
    /// operations.
    ///
    /// The first pin on a thread acquires that thread's guard through the
    /// per-thread registry; later pins reuse it. The guard is handed back
    /// for reuse when the thread exits.
    pub fn pin(&self) -> HashMapRef<'_, K, V, S, M> {
        HashMapRef {
            map: self,
            guard: guard::guard_for(self.raw.id, &self.raw.guards),
        }
    }

    #[doc(hidden)]
    pub fn table_counters(&self) -> Arc<TableCounters> {
        self.raw.counters.clone()
    }

    #[doc(hidden)]
    pub fn retired_tables(&mut self) -> usize {
        self.raw.retired_len()
    }
}

impl<K, V, S, M> HashMap<K, V, S, M>
where
    K: Word + Hash + Eq,
    V: Word + Eq,
    S: BuildHasher,
    M: Lifecycle<K, V>,
{
    /// Returns the number of live entries by walking the chain.
    ///
    /// Exact when no other thread is writing; otherwise a snapshot-free
    /// estimate.
    pub fn len(&self) -> usize {
        self.pin().len()
    }

    /// Returns `true` if the map holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V, S, M> HashMap<K, V, S, M>
where
    K: Word,
    V: Word,
{
    /// Returns an iterator over the entries of the map.
    ///
    /// Iteration requires exclusive access: concurrent migration would make
    /// the walk meaningless. Entry order is arbitrary.
    pub fn iter(&mut self) -> Iter<'_, K, V> {
        Iter {
            table: *self.raw.head.get_mut(),
            index: 0,
            _map: PhantomData,
        }
    }
}

impl<K, V, S, M> Clone for HashMap<K, V, S, M>
where
    K: Word + Hash + Eq,
    V: Word + Eq,
    S: BuildHasher + Clone,
    M: Lifecycle<K, V> + Clone,
{
    /// Duplicates the map by registering as a reader on the source and
    /// re-inserting every observed entry into the copy. The result is not
    /// an atomic snapshot of a concurrently mutated source.
    fn clone(&self) -> Self {
        let source = self.pin();

        let clone = HashMap {
            raw: RawMap::new(
                source.len().max(1),
                self.raw.density,
                self.raw.hasher.clone(),
                self.raw.manager.clone(),
            ),
        };

        {
            let target = clone.pin();
            let manager = &self.raw.manager;
            self.raw.for_each(source.guard(), |key, value| {
                target.put_if_absent(manager.clone_key(key), manager.clone_value(value));
            });
        }

        clone
    }
}

impl<K, V, S, M> fmt::Debug for HashMap<K, V, S, M>
where
    K: Word + Hash + Eq + fmt::Debug,
    V: Word + Eq + fmt::Debug,
    S: BuildHasher,
    M: Lifecycle<K, V>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pinned = self.pin();
        let mut map = f.debug_map();
        self.raw.for_each(pinned.guard(), |key, value| {
            map.entry(&key, &value);
        });
        map.finish()
    }
}

/// A [`HashMap`] pinned by the current thread.
///
/// The handle is bound to the thread that created it and cannot be sent
/// elsewhere; each thread pins the map for itself.
pub struct HashMapRef<'map, K, V, S = RandomState, M = ()> {
    map: &'map HashMap<K, V, S, M>,
    guard: *mut guard::Node,
}

impl<K, V, S, M> HashMapRef<'_, K, V, S, M> {
    #[inline]
    fn guard(&self) -> &Guard {
        // Safety: the guard node lives as long as the map's guard manager,
        // and the handle borrows the map.
        unsafe { &**self.guard }
    }
}

impl<K, V, S, M> HashMapRef<'_, K, V, S, M>
where
    K: Word + Hash + Eq,
    V: Word + Eq,
    S: BuildHasher,
    M: Lifecycle<K, V>,
{
    /// Returns the value associated with `key`.
    pub fn get(&self, key: K) -> Option<V> {
        let raw = self.map.raw.get(check_key(key), self.guard());
        if word::is_reserved(raw) {
            None
        } else {
            Some(V::unpack(raw))
        }
    }

    /// Returns `true` if the map holds a value for `key`.
    pub fn contains_key(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Associates `value` with `key` unconditionally.
    pub fn put(&self, key: K, value: V) -> bool {
        self.update(key, check_value(value), PutCondition::Always)
    }

    /// Associates `value` with `key` iff no value is currently associated.
    ///
    /// Returns whether the value was installed.
    pub fn put_if_absent(&self, key: K, value: V) -> bool {
        self.update(key, check_value(value), PutCondition::IfAbsent)
    }

    /// Associates `value` with `key` iff some value is currently
    /// associated.
    ///
    /// Returns whether the value was installed.
    pub fn put_if_exists(&self, key: K, value: V) -> bool {
        self.update(key, check_value(value), PutCondition::IfExists)
    }

    /// Associates `new` with `key` iff the current value equals `old`.
    ///
    /// Returns whether the value was installed.
    pub fn put_if_match(&self, key: K, new: V, old: V) -> bool {
        self.update(
            key,
            check_value(new),
            PutCondition::IfMatches(check_value(old)),
        )
    }

    /// Removes the value associated with `key`.
    ///
    /// Returns whether a value was actually removed.
    pub fn remove(&self, key: K) -> bool {
        self.update(key, word::NONE, PutCondition::IfExists)
    }

    /// Removes the value associated with `key` iff it equals `old`.
    ///
    /// Returns whether the value was removed.
    pub fn remove_if_match(&self, key: K, old: V) -> bool {
        self.update(key, word::NONE, PutCondition::IfMatches(check_value(old)))
    }

    /// Returns the number of live entries by walking the chain.
    ///
    /// Exact when no other thread is writing; otherwise a snapshot-free
    /// estimate.
    pub fn len(&self) -> usize {
        let mut count = 0;
        self.map.raw.for_each(self.guard(), |_, _| count += 1);
        count
    }

    /// Returns `true` if the map holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, key: K, value_raw: usize, cond: PutCondition) -> bool {
        self.map.raw.put(check_key(key), value_raw, cond, self.guard())
    }
}

/// Keys must not collide with the empty-slot word.
#[inline]
fn check_key<K: Word>(key: K) -> K {
    assert!(
        key.pack() != word::KEY_NONE,
        "key packs to the reserved empty-slot word"
    );
    key
}

/// Values must stay out of the sentinel range.
#[inline]
fn check_value<V: Word>(value: V) -> usize {
    let raw = value.pack();
    assert!(
        word::is_good(raw),
        "value packs into the reserved sentinel range"
    );
    raw
}

/// An iterator over the entries of a [`HashMap`].
///
/// Obtained through [`HashMap::iter`], which requires exclusive access.
pub struct Iter<'map, K, V> {
    table: *mut Table,
    index: usize,
    _map: PhantomData<&'map mut (K, V)>,
}

impl<K, V> Iterator for Iter<'_, K, V>
where
    K: Word,
    V: Word,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        while !self.table.is_null() {
            // Safety: the iterator holds the map exclusively, so no table
            // can be freed or migrated while it lives.
            let table = unsafe { &*self.table };

            while self.index < table.len() {
                let entry = table.entry(self.index);
                self.index += 1;

                let key = entry.key.load(Ordering::Relaxed);
                if key == word::KEY_NONE {
                    continue;
                }

                let value = entry.value.load(Ordering::Relaxed);
                if word::is_copying(value) || word::is_reserved(value) {
                    continue;
                }

                return Some((K::unpack(key), V::unpack(value)));
            }

            self.table = table.next.load(Ordering::Relaxed);
            self.index = 0;
        }

        None
    }
}
