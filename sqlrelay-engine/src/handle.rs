//! Opaque handle allocation and the tables keyed by them: statement handles
//! and the reader (cursor) handles nested under them.
//!
//! Cross-process objects are identified by an opaque `Handle<T>` stored in
//! a per-kind map, the same shape as `ffi/src/file.rs`'s `state.files.insert/
//! get/remove`. Handles here are widened to 128 bits so a cryptographic or
//! random allocation scheme could replace the monotonic counter without
//! changing the wire representation.

use rand::RngCore;
use std::{
    collections::HashMap,
    hash::Hash,
    sync::atomic::{AtomicU64, Ordering},
};

/// Allocates handle values that are unique for the lifetime of the process:
/// a random 64-bit session nonce (generated once) in the upper half, and a
/// strictly monotonic counter in the lower half. Collisions across the
/// counter's range are impossible in practice; we assert rather than wrap.
pub struct HandleAllocator {
    session: u64,
    counter: AtomicU64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self {
            session: rand::thread_rng().next_u64(),
            counter: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> u128 {
        let low = self.counter.fetch_add(1, Ordering::Relaxed);
        assert!(low != 0, "statement handle counter wrapped around");
        ((self.session as u128) << 64) | low as u128
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! define_handle {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u128);

        impl $name {
            pub fn as_u128(self) -> u128 {
                self.0
            }
        }

        impl From<u128> for $name {
            fn from(raw: u128) -> Self {
                Self(raw)
            }
        }
    };
}

define_handle!(StatementHandle);
define_handle!(ReaderHandle);

/// A map from opaque handle to a live server-side object, following the
/// `registry::Handle<T>` pattern in `ffi/src/file.rs`: `insert`
/// allocates the handle, `get`/`remove` operate on a previously allocated
/// one. Every handle returned by `insert` is distinct from every handle
/// previously returned, even across `remove` calls.
pub struct HandleMap<H, V> {
    allocator: HandleAllocator,
    entries: HashMap<H, V>,
}

impl<H, V> HandleMap<H, V>
where
    H: From<u128> + Eq + Hash + Copy,
{
    pub fn new() -> Self {
        Self {
            allocator: HandleAllocator::new(),
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, value: V) -> H {
        let handle = H::from(self.allocator.allocate());
        let previous = self.entries.insert(handle, value);
        assert!(previous.is_none(), "handle collision, should be impossible");
        handle
    }

    pub fn get(&self, handle: H) -> Option<&V> {
        self.entries.get(&handle)
    }

    pub fn get_mut(&mut self, handle: H) -> Option<&mut V> {
        self.entries.get_mut(&handle)
    }

    /// Idempotent: removing an absent handle is a no-op that returns `None`.
    pub fn remove(&mut self, handle: H) -> Option<V> {
        self.entries.remove(&handle)
    }

    pub fn contains(&self, handle: H) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&H, &V)> {
        self.entries.iter()
    }
}

impl<H, V> Default for HandleMap<H, V>
where
    H: From<u128> + Eq + Hash + Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_never_reused() {
        let mut map: HandleMap<StatementHandle, &'static str> = HandleMap::new();
        let h1 = map.insert("one");
        map.remove(h1);
        let h2 = map.insert("two");
        assert_ne!(h1, h2);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut map: HandleMap<StatementHandle, &'static str> = HandleMap::new();
        let h1 = map.insert("one");
        assert!(map.remove(h1).is_some());
        assert!(map.remove(h1).is_none());
    }
}
