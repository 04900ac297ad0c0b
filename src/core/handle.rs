//! Handle tables
//!
//! Nothing that crosses the host boundary is a native address. VFS instances
//! are named by [`HandleKey`]s into a generation-checked arena, and open files
//! are tracked in a [`FileTable`] that maps adapter-local keys to the
//! identifiers the host assigned.
//!
//! A key carries the generation of the slot it was issued from. Removing an
//! entry bumps the generation, so a stale key can never resolve to whatever
//! reuses the slot later.

use crate::error::{BridgeError, Result};
use ahash::AHashMap;
use std::fmt;
use std::num::NonZeroU32;

/// Key into a [`HandleTable`]
///
/// Generations start at 1, so the all-zero key (what a zeroed engine
/// allocation holds) is never live.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HandleKey {
    index: u32,
    generation: u32,
}

impl HandleKey {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of owned values addressed by generation-checked keys
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> HandleKey {
        self.insert_with(|_| value)
    }

    /// Insert a value that needs to know its own key.
    pub fn insert_with(&mut self, make: impl FnOnce(HandleKey) -> T) -> HandleKey {
        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let key = HandleKey {
                    index,
                    generation: slot.generation,
                };
                slot.value = Some(make(key));
                key
            }
            None => {
                let key = HandleKey {
                    index: self.slots.len() as u32,
                    generation: 1,
                };
                self.slots.push(Slot {
                    generation: 1,
                    value: Some(make(key)),
                });
                key
            }
        };
        self.len += 1;
        key
    }

    pub fn get(&self, key: HandleKey) -> Option<&T> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, key: HandleKey) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, key: HandleKey) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: HandleKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        // Skip 0 on wrap so a zeroed key stays dead.
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (HandleKey, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    HandleKey {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn keys(&self) -> Vec<HandleKey> {
        self.iter().map(|(key, _)| key).collect()
    }
}

/// File identifier assigned by the host; zero is reserved for "no handle"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostFileId(NonZeroU32);

impl HostFileId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(HostFileId)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for HostFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Open files of one VFS instance
///
/// A host identifier is bound to exactly one adapter-local key between open
/// and close.
#[derive(Default)]
pub struct FileTable {
    handles: HandleTable<HostFileId>,
    live: AHashMap<HostFileId, HandleKey>,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a raw identifier reported by the host.
    ///
    /// Zero and identifiers that are already bound are protocol violations.
    pub fn bind(&mut self, raw: u32) -> Result<(HandleKey, HostFileId)> {
        let id = HostFileId::new(raw)
            .ok_or_else(|| BridgeError::misuse("host returned file id 0"))?;
        if self.live.contains_key(&id) {
            return Err(BridgeError::Misuse(format!(
                "host returned file id {} which is already open",
                id
            )));
        }
        let key = self.handles.insert(id);
        self.live.insert(id, key);
        Ok((key, id))
    }

    pub fn resolve(&self, key: HandleKey) -> Result<HostFileId> {
        self.handles
            .get(key)
            .copied()
            .ok_or_else(|| BridgeError::Misuse(format!("file handle {} is not open", key)))
    }

    pub fn release(&mut self, key: HandleKey) -> Result<HostFileId> {
        let id = self
            .handles
            .remove(key)
            .ok_or_else(|| BridgeError::Misuse(format!("file handle {} is not open", key)))?;
        self.live.remove(&id);
        Ok(id)
    }

    pub fn is_bound(&self, id: HostFileId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
