//! The facade internals: the generation chain, guard installation, and
//! reclamation of retired tables.

pub(crate) mod table;

use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{self, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::guard::{Guard, Guards};
use crate::lifecycle::Lifecycle;
use crate::word::{self, Word};

use self::table::{Table, TableRef};

/// Retry ceiling for every internal retry loop. Exceeding it means a loop
/// bug, not contention, and is surfaced as a panic.
pub(crate) const RETRY_LIMIT: usize = 100_000;

/// Condition under which a value CAS may go ahead.
#[derive(Clone, Copy)]
pub(crate) enum PutCondition {
    Always,
    IfAbsent,
    IfExists,
    /// Payload is the packed expected value.
    IfMatches(usize),
    /// Migrator-only: matches a slot the user never wrote.
    Copying,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutResult {
    Succeeded,
    Failed,
    FullTable,
}

/// Table lifetime accounting, shared out so it can outlive the map.
#[doc(hidden)]
#[derive(Default)]
pub struct TableCounters {
    pub created: AtomicUsize,
    pub freed: AtomicUsize,
}

pub(crate) struct RawMap<K, V, S, M> {
    /// The oldest live table; operations walk from here toward newer
    /// generations.
    pub(crate) head: AtomicPtr<Table>,

    /// Tables unlinked from the chain but possibly still guarded.
    pub(crate) retired: AtomicPtr<Table>,

    /// The head table's number; incremented at every unlink.
    pub(crate) generation: AtomicU64,

    /// The highest generation at which a retired table was unlinked.
    /// Meaningful only while the retired list is non-empty.
    pub(crate) retired_generation: AtomicU64,

    pub(crate) guards: Arc<Guards>,
    pub(crate) hasher: S,
    pub(crate) manager: M,
    pub(crate) density: f64,
    pub(crate) counters: Arc<TableCounters>,

    /// Process-unique, never reused; keys the per-thread guard registry.
    pub(crate) id: u64,

    _kv: PhantomData<(K, V)>,
}

impl<K, V, S, M> RawMap<K, V, S, M> {
    pub(crate) fn new(capacity: usize, density: f64, hasher: S, manager: M) -> RawMap<K, V, S, M> {
        assert!(capacity >= 1, "capacity must be at least 1");
        assert!(
            density > 0.0 && density < 1.0,
            "density must lie strictly between 0 and 1"
        );

        static NEXT_ID: AtomicU64 = AtomicU64::new(0);

        let counters = Arc::new(TableCounters::default());
        let head = Table::alloc(capacity, density);
        counters.created.fetch_add(1, Ordering::Relaxed);

        RawMap {
            head: AtomicPtr::new(head),
            retired: AtomicPtr::new(ptr::null_mut()),
            generation: AtomicU64::new(0),
            retired_generation: AtomicU64::new(0),
            guards: Arc::new(Guards::new()),
            hasher,
            manager,
            density,
            counters,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            _kv: PhantomData,
        }
    }

    /// The number of tables sitting on the retired list. Diagnostic;
    /// requires exclusive access.
    pub(crate) fn retired_len(&mut self) -> usize {
        let mut count = 0;
        let mut table = *self.retired.get_mut();
        while !table.is_null() {
            count += 1;
            // Safety: exclusive access keeps the list intact.
            table = unsafe { (*table).next_retired.load(Ordering::Relaxed) };
        }
        count
    }
}

impl<K, V, S, M> RawMap<K, V, S, M>
where
    K: Word + Hash + Eq,
    V: Word + Eq,
    S: BuildHasher,
    M: Lifecycle<K, V>,
{
    #[inline]
    pub(crate) fn hash(&self, key: K) -> u64 {
        self.hasher.hash_one(key)
    }

    fn head_ref(&self) -> TableRef<'_, K, V, S, M> {
        // Safety: the head is never null, and the caller's installed guard
        // keeps every table at or above its generation alive.
        TableRef {
            table: unsafe { &*self.head.load(Ordering::Acquire) },
            map: self,
        }
    }

    /// Publishes the current generation in the guard, looping until the
    /// publication is known to precede any concurrent unlink.
    fn start_guarding(&self, guard: &Guard) {
        let mut retries = 0;
        loop {
            assert!(retries < RETRY_LIMIT, "guard install did not settle");
            retries += 1;

            let generation = self.generation.load(Ordering::Acquire);
            guard.protect(generation);
            atomic::fence(Ordering::SeqCst);

            if self.generation.load(Ordering::Acquire) == generation {
                return;
            }
        }
    }

    fn stop_guarding(&self, guard: &Guard) {
        guard.clear();
    }

    /// Looks the key up across the generation chain. Returns the pure value
    /// word; any reserved word means the key is absent.
    pub(crate) fn get(&self, key: K, guard: &Guard) -> usize {
        self.start_guarding(guard);

        let hash = self.hash(key);
        let mut result = word::DELETED;
        let mut crossed = 0;

        let mut current = Some(self.head_ref());
        while let Some(table) = current {
            crossed += 1;
            assert!(crossed < RETRY_LIMIT, "generation chain walk did not terminate");

            match table.get(key, hash, guard) {
                Some(raw) => {
                    result = raw;
                    break;
                }
                None => current = table.next_ref(),
            }
        }

        self.stop_guarding(guard);
        result
    }

    /// Applies the conditional update across the generation chain,
    /// allocating successors and helping the migration as needed.
    pub(crate) fn put(&self, key: K, value_raw: usize, cond: PutCondition, guard: &Guard) -> bool {
        let key_raw = key.pack();

        self.start_guarding(guard);

        // Writers help an in-progress migration along on every operation.
        let head = self.head_ref();
        if !head.table.next.load(Ordering::Acquire).is_null() {
            head.do_copy_task(guard);
        }

        let mut key_installed = false;
        let mut crossed = 0;

        let mut table = self.head_ref();
        let result = loop {
            crossed += 1;
            assert!(crossed < RETRY_LIMIT, "generation chain walk did not terminate");

            let result = table.put(
                key,
                key_raw,
                value_raw,
                cond,
                &mut key_installed,
                true,
                guard,
            );
            if result != PutResult::FullTable {
                break result;
            }

            if table.table.next.load(Ordering::Acquire).is_null() {
                table.create_next();
            }
            table.do_copy_task(guard);
            table = table.next_ref().unwrap();
        };

        if !key_installed {
            self.manager.release_key(key, 1);
        }
        if result == PutResult::Failed {
            self.manager.release_value(value_raw, 1);
        }

        self.stop_guarding(guard);
        self.try_reclaim();

        result == PutResult::Succeeded
    }

    /// Frees the retired tables if no guard can still reach them.
    pub(crate) fn try_reclaim(&self) {
        let retired = self.retired.load(Ordering::Acquire);
        if retired.is_null() {
            return;
        }

        let old_head = self.head.load(Ordering::Acquire);
        let first_guarded = self.guards.first_guarded_generation();

        if self.retired_generation.load(Ordering::Acquire) >= first_guarded {
            return;
        }

        if self
            .retired
            .compare_exchange(retired, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if self.head.load(Ordering::Acquire) == old_head {
            // Sole owner of the snapshot: free it.
            let mut table = retired;
            while !table.is_null() {
                // Safety: the watermark proves no guard can reach the
                // snapshot, and the CAS made this thread its only holder.
                let next = unsafe { (*table).next_retired.load(Ordering::Relaxed) };
                drop(unsafe { Box::from_raw(table) });
                self.counters.freed.fetch_add(1, Ordering::Relaxed);
                table = next;
            }
        } else {
            // The head moved while the snapshot was popped, so the CAS does
            // not prove sole ownership of these tables. Push the whole
            // snapshot back and let a later pass retry.
            let mut tail = retired;
            loop {
                // Safety: the snapshot is unreachable by other reclaimers
                // until it is pushed back below.
                let next = unsafe { (*tail).next_retired.load(Ordering::Relaxed) };
                if next.is_null() {
                    break;
                }
                tail = next;
            }

            loop {
                let current = self.retired.load(Ordering::Acquire);
                unsafe { (*tail).next_retired.store(current, Ordering::Relaxed) };
                if self
                    .retired
                    .compare_exchange(current, retired, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    /// Walks every live entry in the chain under the caller's guard.
    /// Entries mutated concurrently may be observed in either state; the
    /// walk is a diagnostic, not a snapshot.
    pub(crate) fn for_each(&self, guard: &Guard, mut f: impl FnMut(K, V)) {
        self.start_guarding(guard);

        let mut current = Some(self.head_ref());
        while let Some(table) = current {
            for i in 0..table.table.len() {
                let entry = table.table.entry(i);

                let key = entry.key.load(Ordering::Acquire);
                if key == word::KEY_NONE {
                    continue;
                }

                let value = entry.value.load(Ordering::Acquire);
                if word::is_copying(value) || word::is_reserved(value) {
                    continue;
                }

                f(K::unpack(key), V::unpack(value));
            }
            current = table.next_ref();
        }

        self.stop_guarding(guard);
    }
}

impl<K, V, S, M> Drop for RawMap<K, V, S, M> {
    fn drop(&mut self) {
        // Safety: exclusive access; no guard can be installed any more.
        let mut table = *self.head.get_mut();
        while !table.is_null() {
            let boxed = unsafe { Box::from_raw(table) };
            table = boxed.next.load(Ordering::Relaxed);
            self.counters.freed.fetch_add(1, Ordering::Relaxed);
        }

        let mut table = *self.retired.get_mut();
        while !table.is_null() {
            let boxed = unsafe { Box::from_raw(table) };
            table = boxed.next_retired.load(Ordering::Relaxed);
            self.counters.freed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
