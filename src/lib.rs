//! A lock-free hash table that grows by molting.
//!
//! [`HashMap`] maps word-sized keys to word-sized values and supports any
//! number of concurrent readers and writers without a mutex on the common
//! path. When a table fills up, a larger successor is allocated and every
//! writer migrates a small chunk of entries on its way through; the old
//! table is retired once the copy completes and freed once no thread can
//! still observe it, tracked by per-thread guards.
//!
//! Keys and values are packed into atomic machine words via the [`Word`]
//! trait, which is implemented for unsigned integers and raw pointers.
//! Reference-counted payloads plug in through the [`Lifecycle`] capability.
//!
//! # Usage
//!
//! Operations go through a pinned handle, which ties the calling thread to
//! the map's reclamation machinery:
//!
//! ```
//! use moult::HashMap;
//!
//! let map = HashMap::new();
//! let m = map.pin();
//!
//! m.put(1usize, 10usize);
//! m.put_if_absent(2, 20);
//! assert_eq!(m.get(1), Some(10));
//! assert!(m.put_if_match(1, 11, 10));
//! assert!(m.remove(2));
//! assert_eq!(m.len(), 1);
//! ```

mod guard;
mod lifecycle;
mod map;
mod raw;
mod word;

pub use lifecycle::Lifecycle;
pub use map::{HashMap, HashMapBuilder, HashMapRef, Iter};
pub use word::Word;

#[doc(hidden)]
pub use raw::TableCounters;
