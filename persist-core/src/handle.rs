//! Generational Handle Arena
//!
//! Every entity a [`Runtime`](crate::Runtime) hands out (code units,
//! environment contexts, argument lists, I/O handles) lives in a
//! [`HandleTable`] owned by that runtime.  Callers only ever hold small
//! `Copy` handles: a runtime id plus a generational slot key.
//!
//! # Design:
//! - Freed slots are recycled, and their generation is bumped so stale keys miss
//! - Insertion order is tracked, so teardown can walk entities oldest first
//! - Handles carry their runtime id, so foreign handles are rejected

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a single [`Runtime`](crate::Runtime) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuntimeId(u64);

impl RuntimeId {
    /// Allocate a process-unique runtime id.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rt#{}", self.0)
    }
}

/// Slot key inside a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    order: u64,
    value: Option<T>,
}

/// Arena of entities addressed by generational [`Key`]s.
pub(crate) struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    next_order: u64,
    live: usize,
}

impl<T> HandleTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_order: 0,
            live: 0,
        }
    }

    /// Store `value` and return its key.
    pub(crate) fn insert(&mut self, value: T) -> Key {
        let order = self.next_order;
        self.next_order += 1;
        self.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.order = order;
            slot.value = Some(value);
            return Key {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            order,
            value: Some(value),
        });
        Key {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, key: Key) -> Option<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Remove and return the entity behind `key`, invalidating the key.
    pub(crate) fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.live -= 1;
        Some(value)
    }

    /// Keys of all live entities, oldest first.
    pub(crate) fn keys_in_order(&self) -> Vec<Key> {
        let mut live: Vec<(u64, Key)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| {
                (
                    slot.order,
                    Key {
                        index: index as u32,
                        generation: slot.generation,
                    },
                )
            })
            .collect();
        live.sort_by_key(|(order, _)| *order);
        live.into_iter().map(|(_, key)| key).collect()
    }

    /// Drop every entity, invalidating all outstanding keys.
    pub(crate) fn clear(&mut self) {
        for key in self.keys_in_order() {
            self.remove(key);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            pub(crate) runtime: RuntimeId,
            pub(crate) key: Key,
        }

        impl $name {
            pub(crate) const KIND: &'static str = $kind;

            pub(crate) fn new(runtime: RuntimeId, key: Key) -> Self {
                Self { runtime, key }
            }

            /// Runtime this handle belongs to.
            pub fn runtime(&self) -> RuntimeId {
                self.runtime
            }
        }
    };
}

define_handle!(
    /// A compiled code unit, runnable many times until unloaded.
    CodeUnit,
    "code unit"
);
define_handle!(
    /// An environment context usable for any number of runs.
    EnvContext,
    "environment"
);
define_handle!(
    /// An argument list usable for any number of runs.
    ArgList,
    "argument list"
);
define_handle!(
    /// A named I/O handle backed by host callbacks.
    IoHandle,
    "I/O handle"
);
