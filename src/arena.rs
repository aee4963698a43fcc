//! Generational slot arena.
//!
//! Kexts and repositories live in arenas owned by the manager. Everything else
//! refers to them through typed handles carrying a generation tag, so a handle
//! to a removed kext can never alias a kext later stored in the same slot.

use std::fmt;
use std::marker::PhantomData;

/// A slot index plus the generation the slot had when the handle was issued.
///
/// Layout: [32-bit slot index | 32-bit generation]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationalHandle {
    packed: u64,
}

impl GenerationalHandle {
    #[inline]
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self {
            packed: ((generation as u64) << 32) | (slot as u64),
        }
    }

    #[inline]
    pub const fn slot(&self) -> u32 {
        self.packed as u32
    }

    #[inline]
    pub const fn generation(&self) -> u32 {
        (self.packed >> 32) as u32
    }
}

impl fmt::Debug for GenerationalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot(), self.generation())
    }
}

/// Implemented by the typed handles stored in an [`Arena`].
pub trait ArenaKey: Copy + Eq {
    fn from_handle(handle: GenerationalHandle) -> Self;
    fn handle(&self) -> GenerationalHandle;
}

macro_rules! arena_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(GenerationalHandle);

        impl ArenaKey for $name {
            fn from_handle(handle: GenerationalHandle) -> Self {
                $name(handle)
            }

            fn handle(&self) -> GenerationalHandle {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }
    };
}

arena_key!(
    /// Handle to a kext owned by the manager.
    KextId
);
arena_key!(
    /// Handle to a repository owned by the manager.
    RepositoryId
);

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Owning collection addressed by generational handles.
pub struct Arena<K: ArenaKey, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    _key: PhantomData<K>,
}

impl<K: ArenaKey, T> Default for Arena<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ArenaKey, T> Arena<K, T> {
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _key: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store a value built from its own future handle.
    pub fn insert_with(&mut self, build: impl FnOnce(K) -> T) -> K {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let entry = &mut self.slots[slot as usize];
        let key = K::from_handle(GenerationalHandle::new(slot, entry.generation));
        entry.value = Some(build(key));
        self.len += 1;
        key
    }

    pub fn insert(&mut self, value: T) -> K {
        self.insert_with(|_| value)
    }

    pub fn remove(&mut self, key: K) -> Option<T> {
        let handle = key.handle();
        let entry = self.slots.get_mut(handle.slot() as usize)?;
        if entry.generation != handle.generation() || entry.value.is_none() {
            return None;
        }
        let value = entry.value.take();
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.slot());
        self.len -= 1;
        value
    }

    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: K) -> Option<&T> {
        let handle = key.handle();
        self.slots
            .get(handle.slot() as usize)
            .filter(|entry| entry.generation == handle.generation())
            .and_then(|entry| entry.value.as_ref())
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let handle = key.handle();
        self.slots
            .get_mut(handle.slot() as usize)
            .filter(|entry| entry.generation == handle.generation())
            .and_then(|entry| entry.value.as_mut())
    }

    /// Live entries in slot order (not insertion order once slots are reused).
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, entry)| {
            entry.value.as_ref().map(|value| {
                (
                    K::from_handle(GenerationalHandle::new(index as u32, entry.generation)),
                    value,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, entry)| {
            let generation = entry.generation;
            entry.value.as_mut().map(|value| {
                (
                    K::from_handle(GenerationalHandle::new(index as u32, generation)),
                    value,
                )
            })
        })
    }

    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(key, _)| key).collect()
    }
}
