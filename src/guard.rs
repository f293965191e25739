//! Per-thread guards and their manager.
//!
//! A guard publishes the table generation its owning thread may still
//! dereference. The manager keeps every guard ever created on an intrusive
//! lock-free list; released guards are reused by later threads and freed
//! only when the manager itself drops. The minimum published generation
//! across owned guards is the watermark below which retired tables are safe
//! to free.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;

/// The generation published by an idle guard.
pub(crate) const NO_TABLE: u64 = u64::MAX;

/// The owner word of a free guard.
const NO_OWNER: usize = usize::MAX;

/// Guards are padded so that two threads' hot counters never share a cache
/// line.
pub(crate) type Node = CachePadded<Guard>;

pub(crate) struct Guard {
    /// Intrusive link in the manager's list. Set once, before publication.
    next: AtomicPtr<Node>,

    /// The id of the owning thread, or `NO_OWNER`.
    owner: AtomicUsize,

    /// The generation the owning thread is operating on, or `NO_TABLE`.
    generation: AtomicU64,

    /// Set while the owner copies a chunk; blocks head retirement.
    forbid: AtomicBool,

    /// This thread's contribution to the approximate live-entry count.
    pub(crate) alive: AtomicIsize,

    /// Keys installed by this thread into the current generation.
    pub(crate) keys: AtomicUsize,
}

impl Guard {
    fn new(owner: usize) -> Guard {
        Guard {
            next: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicUsize::new(owner),
            generation: AtomicU64::new(NO_TABLE),
            forbid: AtomicBool::new(false),
            alive: AtomicIsize::new(0),
            keys: AtomicUsize::new(0),
        }
    }

    /// Publishes the generation this thread is about to dereference.
    #[inline]
    pub(crate) fn protect(&self, generation: u64) {
        self.generation.store(generation, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn clear(&self) {
        self.generation.store(NO_TABLE, Ordering::Release);
    }

    #[inline]
    pub(crate) fn forbid_retire(&self) {
        self.forbid.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn allow_retire(&self) {
        self.forbid.store(false, Ordering::Release);
    }

    fn release(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
    }
}

/// The intrusive list of every guard created for one map.
pub(crate) struct Guards {
    head: AtomicPtr<Node>,
}

impl Guards {
    pub(crate) fn new() -> Guards {
        Guards {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Hands out a free guard, allocating one if every guard is owned.
    pub(crate) fn acquire(&self, owner: usize) -> *mut Node {
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            // Safety: nodes are only freed when the manager drops.
            let guard: &Guard = unsafe { &**node };

            if guard.owner.load(Ordering::Relaxed) == NO_OWNER
                && guard
                    .owner
                    .compare_exchange(NO_OWNER, owner, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return node;
            }

            node = guard.next.load(Ordering::Acquire);
        }

        self.push(owner)
    }

    fn push(&self, owner: usize) -> *mut Node {
        let node = Box::into_raw(Box::new(CachePadded::new(Guard::new(owner))));
        loop {
            let head = self.head.load(Ordering::Acquire);
            // Safety: the node is unpublished; this thread is its only user.
            unsafe { (&(*node)).next.store(head, Ordering::Relaxed) };

            if self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return node;
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Guard> + '_ {
        let mut node = self.head.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            if node.is_null() {
                return None;
            }

            // Safety: nodes are only freed when the manager drops, and the
            // returned borrow is tied to the manager.
            let guard: &Guard = unsafe { &**node };
            node = guard.next.load(Ordering::Acquire);
            Some(guard)
        })
    }

    /// The minimum generation published by any owned guard; a strict lower
    /// bound on the generations that may still be dereferenced.
    pub(crate) fn first_guarded_generation(&self) -> u64 {
        let mut min = NO_TABLE;
        for guard in self.iter() {
            if guard.owner.load(Ordering::Acquire) != NO_OWNER {
                min = min.min(guard.generation.load(Ordering::Acquire));
            }
        }
        min
    }

    /// Approximate live-entry count. Summing the list is not atomic, so the
    /// result can be stale or even negative.
    pub(crate) fn total_alive(&self) -> isize {
        self.iter().map(|guard| guard.alive.load(Ordering::Relaxed)).sum()
    }

    /// Approximate count of keys installed into the current generation.
    pub(crate) fn total_keys(&self) -> usize {
        self.iter().map(|guard| guard.keys.load(Ordering::Relaxed)).sum()
    }

    /// Restarts the installed-key count for a new generation.
    pub(crate) fn zero_keys(&self) {
        for guard in self.iter() {
            guard.keys.store(0, Ordering::Relaxed);
        }
    }

    /// True iff no guard is pinning the head with an in-flight copy chunk.
    pub(crate) fn can_retire_head(&self) -> bool {
        self.iter().all(|guard| !guard.forbid.load(Ordering::Acquire))
    }
}

impl Drop for Guards {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // Safety: exclusive access; registries only hold weak pointers.
            let mut boxed = unsafe { Box::from_raw(node) };
            node = *boxed.next.get_mut();
        }
    }
}

fn thread_id() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);

    thread_local! {
        static ID: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }

    ID.with(|id| *id)
}

struct Registered {
    manager: Weak<Guards>,
    guard: *mut Node,
}

/// The per-thread registry mapping map identities to this thread's guard for
/// that map. Guards are released when the thread exits.
struct Registry {
    guards: HashMap<u64, Registered>,
}

impl Drop for Registry {
    fn drop(&mut self) {
        for registered in self.guards.values() {
            // Keep the manager alive across the release; maps that are
            // already gone freed their guards with the manager.
            if let Some(_manager) = registered.manager.upgrade() {
                unsafe { (*registered.guard).release() };
            }
        }
    }
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry {
        guards: HashMap::new(),
    });
}

/// Returns this thread's guard for the given map, acquiring one on first
/// use. Map ids are process-unique and never reused, so a stale entry for a
/// dropped map can never be returned.
pub(crate) fn guard_for(map: u64, manager: &Arc<Guards>) -> *mut Node {
    REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        match registry.guards.entry(map) {
            Entry::Occupied(entry) => entry.get().guard,
            Entry::Vacant(entry) => {
                let guard = manager.acquire(thread_id());
                entry.insert(Registered {
                    manager: Arc::downgrade(manager),
                    guard,
                });
                guard
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_released_guards() {
        let guards = Guards::new();

        let first = guards.acquire(1);
        unsafe { (*first).release() };

        let second = guards.acquire(2);
        assert_eq!(first, second);

        let third = guards.acquire(3);
        assert_ne!(second, third);
    }

    #[test]
    fn watermark_is_min_over_owned_guards() {
        let guards = Guards::new();
        let a = guards.acquire(1);
        let b = guards.acquire(2);

        assert_eq!(guards.first_guarded_generation(), NO_TABLE);

        unsafe {
            (*a).protect(7);
            (*b).protect(3);
        }
        assert_eq!(guards.first_guarded_generation(), 3);

        unsafe { (*b).clear() };
        assert_eq!(guards.first_guarded_generation(), 7);

        // A released guard's stale generation does not hold the watermark.
        unsafe {
            (*b).protect(3);
            (*b).release();
        }
        assert_eq!(guards.first_guarded_generation(), 7);
    }

    #[test]
    fn key_counts_aggregate_and_zero() {
        let guards = Guards::new();
        let a = guards.acquire(1);
        let b = guards.acquire(2);

        unsafe {
            (&(*a)).keys.fetch_add(2, Ordering::Relaxed);
            (&(*b)).keys.fetch_add(3, Ordering::Relaxed);
        }
        assert_eq!(guards.total_keys(), 5);

        guards.zero_keys();
        assert_eq!(guards.total_keys(), 0);
    }

    #[test]
    fn alive_count_may_go_negative() {
        let guards = Guards::new();
        let a = guards.acquire(1);
        let b = guards.acquire(2);

        unsafe {
            (&(*a)).alive.fetch_sub(2, Ordering::Relaxed);
            (&(*b)).alive.fetch_add(5, Ordering::Relaxed);
        }
        assert_eq!(guards.total_alive(), 3);

        unsafe { (&(*b)).alive.fetch_sub(7, Ordering::Relaxed) };
        assert_eq!(guards.total_alive(), -4);
    }

    #[test]
    fn forbid_blocks_retirement() {
        let guards = Guards::new();
        let a = guards.acquire(1);

        assert!(guards.can_retire_head());

        unsafe { (*a).forbid_retire() };
        assert!(!guards.can_retire_head());

        unsafe { (*a).allow_retire() };
        assert!(guards.can_retire_head());
    }
}
