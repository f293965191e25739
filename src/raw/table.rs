//! A single fixed-capacity table and its slot protocol.

use std::hash::{BuildHasher, Hash};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::guard::Guard;
use crate::lifecycle::Lifecycle;
use crate::raw::{PutCondition, PutResult, RawMap, RETRY_LIMIT};
use crate::word::{self, Word};

/// One slot: a key word and a value word.
pub(crate) struct Entry {
    pub(crate) key: AtomicUsize,
    pub(crate) value: AtomicUsize,
}

impl Entry {
    fn new() -> Entry {
        Entry {
            key: AtomicUsize::new(word::KEY_NONE),
            value: AtomicUsize::new(word::BABY),
        }
    }
}

/// A fixed-capacity open-addressed array in the generation chain.
pub(crate) struct Table {
    /// Length minus one; the length is a power of two.
    mask: usize,

    /// Fullness threshold on the approximate installed-key count.
    max_keys: usize,

    /// The lowest remaining probe budget any lookup has observed.
    min_probes: AtomicUsize,

    /// Monotone: set once the table cannot accept new keys.
    full: AtomicBool,

    /// Slots claimed by copiers. The table is fully copied once this
    /// reaches the length.
    copy_claim: AtomicUsize,

    /// Slots per copy task. Published before `next`.
    copy_chunk: AtomicUsize,

    /// The successor table. Set exactly once.
    pub(crate) next: AtomicPtr<Table>,

    /// Link in the facade's retired list.
    pub(crate) next_retired: AtomicPtr<Table>,

    /// Serializes successor allocation.
    allocating: Mutex<()>,

    entries: Box<[Entry]>,
}

impl Table {
    /// Allocates a table able to hold `capacity` entries at the given
    /// density.
    pub(crate) fn alloc(capacity: usize, density: f64) -> *mut Table {
        let requested = (capacity.max(1) as f64 / density).ceil() as usize;
        let len = requested.max(1).next_power_of_two();

        if len > isize::MAX as usize / mem::size_of::<Entry>() {
            panic!("hash table exceeded maximum capacity");
        }

        // A table counts as full well before every slot is claimed, or
        // probe sequences degenerate.
        let too_dense = (2.0 * density).min(0.7);
        let max_keys = len.min((too_dense * len as f64).ceil() as usize);

        let entries = (0..len).map(|_| Entry::new()).collect();

        Box::into_raw(Box::new(Table {
            mask: len - 1,
            max_keys,
            min_probes: AtomicUsize::new(len),
            full: AtomicBool::new(false),
            copy_claim: AtomicUsize::new(0),
            copy_chunk: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            next_retired: AtomicPtr::new(ptr::null_mut()),
            allocating: Mutex::new(()),
            entries,
        }))
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    pub(crate) fn entry(&self, i: usize) -> &Entry {
        &self.entries[i]
    }

    /// The fullness flag is a monotone heuristic; relaxed accesses suffice.
    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.full.load(Ordering::Relaxed)
    }

    #[inline]
    fn mark_full(&self) {
        self.full.store(true, Ordering::Relaxed);
    }
}

/// A table bundled with its owning facade, so slot operations can reach the
/// hasher, the lifecycle manager, and the guard machinery.
pub(crate) struct TableRef<'a, K, V, S, M> {
    pub(crate) table: &'a Table,
    pub(crate) map: &'a RawMap<K, V, S, M>,
}

impl<K, V, S, M> Clone for TableRef<'_, K, V, S, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V, S, M> Copy for TableRef<'_, K, V, S, M> {}

/// Outcome of locating the slot for a put.
enum Fetch<'a> {
    /// The slot is ours; proceed to the value update.
    Continue(&'a Entry),

    /// The probe result went stale; walk the probe sequence again.
    Retry,

    /// The condition requires a key that is not present.
    Failed,

    /// This table cannot serve the request; move to the successor.
    Full,
}

/// Outcome of one value-update attempt.
enum UpdateStatus {
    Succeeded,
    Failed,
    Full,

    /// Lost the value CAS; re-read and try again.
    Retry,
}

impl<'a, K, V, S, M> TableRef<'a, K, V, S, M>
where
    K: Word + Hash + Eq,
    V: Word + Eq,
    S: BuildHasher,
    M: Lifecycle<K, V>,
{
    /// Returns the successor, if it has been created.
    pub(crate) fn next_ref(&self) -> Option<TableRef<'a, K, V, S, M>> {
        let next = self.table.next.load(Ordering::Acquire);
        if next.is_null() {
            return None;
        }

        // Safety: the caller's guard publishes a generation at or below the
        // head's, which keeps every table in the chain alive.
        Some(TableRef {
            table: unsafe { &*next },
            map: self.map,
        })
    }

    /// Locates the slot for `key`: the first slot in the probe sequence
    /// whose key equals `key`, or the first unclaimed slot. Returns the
    /// slot and whether the key was already installed in it.
    ///
    /// With `CHECK_FULL`, also maintains the minimum probe budget and the
    /// fullness flag.
    fn lookup<const CHECK_FULL: bool>(&self, key: K, hash: u64) -> (Option<&'a Entry>, bool) {
        let table = self.table;

        let mut i = (hash as usize) & table.mask;
        let mut budget = table.len();
        let mut found = None;
        let mut key_set = false;

        loop {
            let entry = table.entry(i);
            let raw = entry.key.load(Ordering::Acquire);

            if raw == word::KEY_NONE {
                found = Some(entry);
                break;
            }
            if K::unpack(raw) == key {
                found = Some(entry);
                key_set = true;
                break;
            }

            i = (i + 1) & table.mask;
            budget -= 1;
            if budget == 0 {
                break;
            }
        }

        if CHECK_FULL {
            let mut min = table.min_probes.load(Ordering::Relaxed);
            while !table.is_full() && budget < min {
                match table.min_probes.compare_exchange_weak(
                    min,
                    budget,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // The installed-key count is approximate, so the
                        // bound is consulted whenever a new minimum is
                        // recorded.
                        if self.map.guards.total_keys() >= table.max_keys {
                            table.mark_full();
                        }
                        break;
                    }
                    Err(current) => min = current,
                }
            }

            // A scan that found neither the key nor an unclaimed slot means
            // the table is completely full, whatever the key count says.
            if found.is_none() && !table.is_full() {
                table.mark_full();
            }
        }

        (found, key_set)
    }

    /// Reads a slot's value, assisting an in-progress copy first. Returns
    /// the pure value word.
    fn read_entry(&self, entry: &Entry, guard: &Guard) -> usize {
        if word::is_copying(entry.value.load(Ordering::Acquire)) {
            self.copy_slot(entry, guard);
        }

        self.map.manager.load_value(&entry.value)
    }

    /// One-table lookup. `Some` holds a terminal pure value word; `None`
    /// means the slot's information lives in the successor chain.
    pub(crate) fn get(&self, key: K, hash: u64, guard: &Guard) -> Option<usize> {
        let (entry, key_set) = self.lookup::<false>(key, hash);

        match entry {
            Some(entry) if key_set => {
                let raw = self.read_entry(entry, guard);
                if raw == word::COPIED || raw == word::DELETED {
                    None
                } else {
                    Some(raw)
                }
            }
            // No slot holds the key. Unless the table filled up, the
            // successors cannot hold it either.
            _ => {
                if self.table.is_full() {
                    None
                } else {
                    Some(word::NONE)
                }
            }
        }
    }

    /// The per-table conditional update.
    pub(crate) fn put(
        &self,
        key: K,
        key_raw: usize,
        value_raw: usize,
        cond: PutCondition,
        key_installed: &mut bool,
        update_alive: bool,
        guard: &Guard,
    ) -> PutResult {
        let hash = self.map.hash(key);

        let entry = {
            let mut retries = 0;
            loop {
                assert!(retries < RETRY_LIMIT, "slot fetch did not settle");
                retries += 1;

                let (entry, key_set) = self.lookup::<true>(key, hash);
                match self.fetch_entry(key_raw, entry, key_set, cond, key_installed, guard) {
                    Fetch::Continue(entry) => break entry,
                    Fetch::Retry => continue,
                    Fetch::Failed => return PutResult::Failed,
                    Fetch::Full => return PutResult::FullTable,
                }
            }
        };

        let mut retries = 0;
        loop {
            assert!(retries < RETRY_LIMIT, "value update did not settle");
            retries += 1;

            match self.update_entry(entry, value_raw, cond, update_alive, guard) {
                UpdateStatus::Retry => continue,
                UpdateStatus::Succeeded => return PutResult::Succeeded,
                UpdateStatus::Failed => return PutResult::Failed,
                UpdateStatus::Full => return PutResult::FullTable,
            }
        }
    }

    /// Claims the slot's key for the request, or reports why it cannot be
    /// claimed.
    fn fetch_entry(
        &self,
        key_raw: usize,
        entry: Option<&'a Entry>,
        there_was_key: bool,
        cond: PutCondition,
        key_installed: &mut bool,
        guard: &Guard,
    ) -> Fetch<'a> {
        *key_installed = false;

        let Some(entry) = entry else {
            return Fetch::Full;
        };

        if self.table.is_full() {
            self.copy_slot(entry, guard);
            return Fetch::Full;
        }

        if there_was_key {
            return Fetch::Continue(entry);
        }

        let raw = entry.key.load(Ordering::Acquire);
        if raw == word::KEY_NONE {
            if matches!(cond, PutCondition::IfExists | PutCondition::IfMatches(_)) {
                return Fetch::Failed;
            }

            if entry
                .key
                .compare_exchange(word::KEY_NONE, key_raw, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Lost the claim race; the winner may even have installed
                // the same key.
                return Fetch::Retry;
            }

            *key_installed = true;
            guard.keys.fetch_add(1, Ordering::Relaxed);
            return Fetch::Continue(entry);
        }

        // Another key claimed the slot since the lookup; the probe sequence
        // has to be walked again.
        if K::unpack(raw) != K::unpack(key_raw) {
            return Fetch::Retry;
        }

        Fetch::Continue(entry)
    }

    /// One attempt at the conditional value CAS.
    fn update_entry(
        &self,
        entry: &Entry,
        value_raw: usize,
        cond: PutCondition,
        update_alive: bool,
        guard: &Guard,
    ) -> UpdateStatus {
        if word::is_copying(entry.value.load(Ordering::Acquire)) {
            self.copy_slot(entry, guard);
            return UpdateStatus::Full;
        }

        // IF_MATCHES compares against the old value, which must stay
        // referenced until the comparison is done.
        let compares_old = matches!(cond, PutCondition::IfMatches(_));
        let (success_refs, other_refs) = if compares_old { (2, 1) } else { (1, 0) };

        let manager = &self.map.manager;
        let old = if compares_old {
            manager.load_value(&entry.value)
        } else {
            word::pure(entry.value.load(Ordering::Acquire))
        };

        if old == word::DELETED || old == word::COPIED {
            return UpdateStatus::Full;
        }

        match cond {
            // Matches only a slot the user never wrote. Cheaper than
            // IF_MATCHES(BABY): no referenced read is needed.
            PutCondition::Copying => {
                if old != word::BABY {
                    return UpdateStatus::Failed;
                }
            }
            PutCondition::IfAbsent => {
                if old != word::NONE && old != word::BABY {
                    return UpdateStatus::Failed;
                }
            }
            PutCondition::IfExists => {
                if old == word::NONE || old == word::BABY {
                    return UpdateStatus::Failed;
                }
            }
            PutCondition::IfMatches(expected) => {
                if !word::value_eq::<V>(old, expected) {
                    manager.release_value(old, other_refs);
                    return UpdateStatus::Failed;
                }
            }
            PutCondition::Always => {}
        }

        if entry
            .value
            .compare_exchange(old, value_raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if update_alive {
                let old_alive = old != word::NONE && old != word::BABY;
                let new_alive = value_raw != word::NONE && value_raw != word::BABY;
                if old_alive && !new_alive {
                    guard.alive.fetch_sub(1, Ordering::Relaxed);
                }
                if new_alive && !old_alive {
                    guard.alive.fetch_add(1, Ordering::Relaxed);
                }
            }

            manager.release_value(old, success_refs);
            return UpdateStatus::Succeeded;
        }

        manager.release_value(old, other_refs);
        UpdateStatus::Retry
    }

    /// Migrates one slot to the successor chain. Idempotent: the slot ends
    /// terminal, and repeated calls on a settled slot do nothing.
    pub(crate) fn copy_slot(&self, entry: &Entry, guard: &Guard) {
        entry.value.fetch_or(word::COPYING, Ordering::AcqRel);
        // The slot is now closed: no writer CASes a value carrying the
        // COPYING flag.

        let value = word::pure(entry.value.load(Ordering::Acquire));
        if value == word::DELETED || value == word::COPIED {
            return;
        }
        if value == word::BABY {
            // Nothing user-visible ever lived here.
            entry.value.store(word::COPIED, Ordering::Release);
            return;
        }
        if value == word::NONE {
            // Deleted before migration; successors need not carry the key.
            entry.value.store(word::DELETED, Ordering::Release);
            return;
        }

        let key_raw = entry.key.load(Ordering::Acquire);
        let key = K::unpack(key_raw);

        let mut current = *self;
        while word::pure(entry.value.load(Ordering::Acquire)) != word::COPIED {
            if current.table.next.load(Ordering::Acquire).is_null() {
                current.create_next();
            }
            let target = current.next_ref().unwrap();

            let mut installed = false;
            match target.put(
                key,
                key_raw,
                value,
                PutCondition::Copying,
                &mut installed,
                false,
                guard,
            ) {
                // Either this thread moved the value, or another migrator
                // already settled the key there. Both close the slot.
                PutResult::Succeeded | PutResult::Failed => {
                    entry.value.store(word::COPIED, Ordering::Release);
                }
                PutResult::FullTable => current = target,
            }
        }
    }

    /// Allocates the successor table, sized from the approximate live
    /// count.
    pub(crate) fn create_next(&self) {
        debug_assert!(self.table.is_full());

        let _allocating = self.table.allocating.lock().unwrap();
        if !self.table.next.load(Ordering::Acquire).is_null() {
            return;
        }

        let guards = &self.map.guards;
        let alive = guards.total_alive().max(1) as usize;
        // The next generation restarts the installed-key count.
        guards.zero_keys();

        let next = Table::alloc(alive, self.map.density);
        self.map.counters.created.fetch_add(1, Ordering::Relaxed);

        let len = self.table.len();
        // Safety: freshly allocated and unpublished.
        let next_len = unsafe { (*next).len() };
        let divisor = (self.map.density * next_len as f64 + 1.0) as usize;
        let chunk = (len.ilog2() as usize + 1).max(2 * (len / divisor));

        // Publish the chunk before the table so no copier claims an empty
        // range.
        self.table.copy_chunk.store(chunk, Ordering::Release);
        self.table.next.store(next, Ordering::Release);
    }

    /// Claims and copies one chunk of this table, and retires the table
    /// once every slot has been claimed and copied.
    pub(crate) fn do_copy_task(&self, guard: &Guard) {
        let raw = self.table as *const Table as *mut Table;
        if self.map.head.load(Ordering::Acquire) != raw {
            return;
        }

        let len = self.table.len();
        if self.table.copy_claim.load(Ordering::Acquire) >= len {
            if self.map.guards.can_retire_head() {
                self.retire_head();
            }
            return;
        }

        // Pin the head: it must not be unlinked while this chunk is being
        // copied into its successor.
        guard.forbid_retire();
        if self.map.head.load(Ordering::Acquire) != raw {
            guard.allow_retire();
            return;
        }

        let chunk = self.table.copy_chunk.load(Ordering::Acquire);
        let start = self.table.copy_claim.fetch_add(chunk, Ordering::AcqRel);
        let finish = (start + chunk).min(len);
        for i in start..finish {
            self.copy_slot(self.table.entry(i), guard);
        }

        guard.allow_retire();

        if self.table.copy_claim.load(Ordering::Acquire) >= len
            && self.map.guards.can_retire_head()
        {
            self.retire_head();
        }
    }

    /// Unlinks this table from the head of the chain and pushes it onto the
    /// retired list.
    fn retire_head(&self) {
        let raw = self.table as *const Table as *mut Table;
        let map = self.map;

        let next = self.table.next.load(Ordering::Acquire);

        if map.head.load(Ordering::Acquire) == raw
            && map
                .head
                .compare_exchange(raw, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // This thread unlinked the table; no new operation can reach it
            // from the head. The increment serializes unlink numbering, so
            // any guard that saw this table as head published a generation
            // at or below the recorded one.
            let generation = map.generation.fetch_add(1, Ordering::AcqRel);
            map.retired_generation.fetch_max(generation, Ordering::AcqRel);

            loop {
                let retired = map.retired.load(Ordering::Acquire);
                self.table.next_retired.store(retired, Ordering::Relaxed);
                if map
                    .retired
                    .compare_exchange(retired, raw, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }
}
