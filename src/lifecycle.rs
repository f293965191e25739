//! The key/value lifecycle capability.
//!
//! Maps holding reference-counted or otherwise managed keys and values plug
//! in a [`Lifecycle`] implementation; the default `()` manager is a no-op
//! over trivially copyable words.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::word;

/// Hooks invoked by the table at the points where a managed key or value
/// gains or loses a reference.
///
/// The word arguments may be reserved sentinel words; implementations must
/// treat those as no-ops.
pub trait Lifecycle<K, V> {
    /// Acquires an additional reference to a key about to be re-inserted.
    #[inline]
    fn clone_key(&self, key: K) -> K {
        key
    }

    /// Acquires an additional reference to a value about to be re-inserted.
    #[inline]
    fn clone_value(&self, value: V) -> V {
        value
    }

    /// Atomically reads a value slot, acquiring a reference to the value
    /// read. Returns the pure word.
    #[inline]
    fn load_value(&self, slot: &AtomicUsize) -> usize {
        word::pure(slot.load(Ordering::Acquire))
    }

    /// Releases `refs` references to a key.
    #[inline]
    fn release_key(&self, _key: K, _refs: usize) {}

    /// Releases `refs` references to a value word.
    #[inline]
    fn release_value(&self, _raw: usize, _refs: usize) {}
}

impl<K, V> Lifecycle<K, V> for () {}
