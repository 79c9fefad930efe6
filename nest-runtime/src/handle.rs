//! Service identity registry.
//!
//! Allocates 24-bit local handles out of an open-addressed slot array
//! (initial capacity 4, doubling on collision up to the 2^24 handle
//! space), and maintains a sorted name table for by-name lookup. One
//! read/write lock protects both structures; the storage is generic over
//! the slotted value so the registry itself stays free of service
//! lifecycle concerns.
//!
//! The registry holds one strong reference per registered value. `grab`
//! hands out additional clones; a value is dropped only when the slot
//! reference and every outstanding grab are gone.

use std::sync::{Arc, RwLock};

use crate::message::{Handle, HANDLE_MASK, HANDLE_REMOTE_SHIFT};

const DEFAULT_SLOT_SIZE: usize = 4;

/// One occupied slot: the allocated handle plus the registry's reference.
#[derive(Debug)]
struct Slot<T> {
    handle: Handle,
    value: Arc<T>,
}

#[derive(Debug)]
struct Storage<T> {
    /// Open-addressed slot array; index = handle & (len - 1).
    slot: Vec<Option<Slot<T>>>,
    /// Next local handle to probe from.
    handle_index: u32,
    /// Sorted (name, handle) pairs; names are append-only.
    name: Vec<(Box<str>, Handle)>,
}

/// Identity registry: handle allocation, slot lookup, name binding.
#[derive(Debug)]
pub struct HandleStorage<T> {
    /// Node id pre-shifted into the high byte of every returned handle.
    harbor: Handle,
    inner: RwLock<Storage<T>>,
}

impl<T> HandleStorage<T> {
    /// Create a registry stamping `node_id` into the high byte of every
    /// allocated handle.
    #[must_use]
    pub fn new(node_id: u8) -> HandleStorage<T> {
        HandleStorage {
            harbor: Handle::from(node_id) << HANDLE_REMOTE_SHIFT,
            inner: RwLock::new(Storage {
                slot: (0..DEFAULT_SLOT_SIZE).map(|_| None).collect(),
                handle_index: 1,
                name: Vec::new(),
            }),
        }
    }

    /// Register `value`, allocating a fresh handle.
    ///
    /// Probes forward from the allocation cursor; on a full array the
    /// array doubles and every live entry rehashes to its new modulo.
    /// Returns `None` once the full 2^24 handle space is occupied.
    pub fn register(&self, value: Arc<T>) -> Option<Handle> {
        let mut s = self.inner.write().unwrap_or_else(|e| e.into_inner());
        loop {
            let slot_size = s.slot.len();
            let mut handle = s.handle_index;
            for _ in 0..slot_size {
                if handle > HANDLE_MASK {
                    // 0 is reserved.
                    handle = 1;
                }
                let hash = (handle as usize) & (slot_size - 1);
                if s.slot[hash].is_none() {
                    s.slot[hash] = Some(Slot {
                        handle,
                        value,
                    });
                    s.handle_index = handle + 1;
                    return Some(handle | self.harbor);
                }
                handle += 1;
            }
            // Array full: double and rehash, unless the handle space is
            // exhausted, which is a clean registration failure.
            if slot_size * 2 - 1 > HANDLE_MASK as usize {
                return None;
            }
            let mut new_slot: Vec<Option<Slot<T>>> = (0..slot_size * 2).map(|_| None).collect();
            for old in s.slot.drain(..).flatten() {
                let hash = (old.handle as usize) & (slot_size * 2 - 1);
                debug_assert!(new_slot[hash].is_none());
                new_slot[hash] = Some(old);
            }
            s.slot = new_slot;
        }
    }

    /// Remove `handle` from the registry, dropping its name bindings.
    ///
    /// The registry's reference is returned to the caller so the final
    /// drop (and any destructor re-entrancy) happens outside the lock.
    pub fn retire(&self, handle: Handle) -> Option<Arc<T>> {
        let local = handle & HANDLE_MASK;
        let mut s = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let hash = (local as usize) & (s.slot.len() - 1);
        let matches = s.slot[hash]
            .as_ref()
            .is_some_and(|slot| slot.handle | self.harbor == handle);
        if !matches {
            return None;
        }
        let taken = s.slot[hash].take();
        s.name.retain(|(_, h)| *h != handle);
        drop(s);
        taken.map(|slot| slot.value)
    }

    /// Retire every registered handle. Rescans until a pass retires
    /// nothing, since destructor side effects may register new services.
    pub fn retire_all<F>(&self, mut on_retire: F)
    where
        F: FnMut(Handle, Arc<T>),
    {
        loop {
            let handles: Vec<Handle> = {
                let s = self.inner.read().unwrap_or_else(|e| e.into_inner());
                s.slot
                    .iter()
                    .flatten()
                    .map(|slot| slot.handle | self.harbor)
                    .collect()
            };
            if handles.is_empty() {
                return;
            }
            let mut retired = 0usize;
            for handle in handles {
                if let Some(value) = self.retire(handle) {
                    retired += 1;
                    on_retire(handle, value);
                }
            }
            if retired == 0 {
                return;
            }
        }
    }

    /// Resolve `handle` to its value, taking an additional reference.
    #[must_use]
    pub fn grab(&self, handle: Handle) -> Option<Arc<T>> {
        let local = handle & HANDLE_MASK;
        let s = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let hash = (local as usize) & (s.slot.len() - 1);
        let slot = s.slot[hash].as_ref()?;
        if slot.handle | self.harbor == handle {
            Some(Arc::clone(&slot.value))
        } else {
            None
        }
    }

    /// Bind `name` to `handle`. Names are append-only; a duplicate bind
    /// fails and leaves the original in place.
    pub fn bind_name(&self, name: &str, handle: Handle) -> bool {
        let mut s = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match s.name.binary_search_by(|(n, _)| n.as_ref().cmp(name)) {
            Ok(_) => false,
            Err(at) => {
                s.name.insert(at, (name.into(), handle));
                true
            }
        }
    }

    /// Binary-search the name table.
    #[must_use]
    pub fn find_name(&self, name: &str) -> Option<Handle> {
        let s = self.inner.read().unwrap_or_else(|e| e.into_inner());
        s.name
            .binary_search_by(|(n, _)| n.as_ref().cmp(name))
            .ok()
            .map(|at| s.name[at].1)
    }

    /// Number of live registrations.
    #[must_use]
    pub fn live(&self) -> usize {
        let s = self.inner.read().unwrap_or_else(|e| e.into_inner());
        s.slot.iter().flatten().count()
    }
}
