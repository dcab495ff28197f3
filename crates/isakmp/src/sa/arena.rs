//! Generation-checked storage for SAs
//!
//! Handles are an index plus a generation. Freeing a slot bumps its
//! generation, so a handle kept by a timer or a caller across an
//! asynchronous boundary can never reach a reused slot: it simply stops
//! resolving.

use std::fmt;

use super::SecurityAssociation;

/// Handle to an SA stored in the table
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaHandle {
    index: u32,
    generation: u32,
}

impl fmt::Debug for SaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SaHandle({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for SaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Outcome of dropping one reference
#[derive(Debug)]
pub enum Released {
    /// Other owners remain; carries the new count
    Alive(u32),
    /// That was the last reference; the SA is handed back for teardown
    Freed(SecurityAssociation),
}

struct Entry {
    sa: SecurityAssociation,
    refcnt: u32,
    bucket: Option<usize>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Slot storage with per-SA reference counts
#[derive(Default)]
pub struct SaArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl SaArena {
    /// Create empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `sa` with a reference count of zero
    pub fn insert(&mut self, sa: SecurityAssociation) -> SaHandle {
        let entry = Entry {
            sa,
            refcnt: 0,
            bucket: None,
        };
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                SaHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                SaHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn entry(&self, h: SaHandle) -> Option<&Entry> {
        self.slots
            .get(h.index as usize)
            .filter(|slot| slot.generation == h.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn entry_mut(&mut self, h: SaHandle) -> Option<&mut Entry> {
        self.slots
            .get_mut(h.index as usize)
            .filter(|slot| slot.generation == h.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    /// SA behind `h`, if still alive
    pub fn get(&self, h: SaHandle) -> Option<&SecurityAssociation> {
        self.entry(h).map(|e| &e.sa)
    }

    /// Mutable SA behind `h`, if still alive
    pub fn get_mut(&mut self, h: SaHandle) -> Option<&mut SecurityAssociation> {
        self.entry_mut(h).map(|e| &mut e.sa)
    }

    /// Current reference count
    pub fn refcnt(&self, h: SaHandle) -> Option<u32> {
        self.entry(h).map(|e| e.refcnt)
    }

    /// Add a reference, returning the new count
    pub fn reference(&mut self, h: SaHandle) -> Option<u32> {
        let entry = self.entry_mut(h)?;
        entry.refcnt += 1;
        Some(entry.refcnt)
    }

    /// Drop a reference; the slot is freed when the count reaches zero
    pub fn release(&mut self, h: SaHandle) -> Option<Released> {
        let entry = self.entry_mut(h)?;
        entry.refcnt = entry.refcnt.saturating_sub(1);
        if entry.refcnt > 0 {
            return Some(Released::Alive(entry.refcnt));
        }
        self.remove(h).map(Released::Freed)
    }

    /// Take the SA out regardless of its reference count
    pub(crate) fn remove(&mut self, h: SaHandle) -> Option<SecurityAssociation> {
        let slot = self
            .slots
            .get_mut(h.index as usize)
            .filter(|slot| slot.generation == h.generation)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(h.index);
        self.live -= 1;
        Some(entry.sa)
    }

    /// Bucket the SA is linked into, if any
    pub(crate) fn bucket(&self, h: SaHandle) -> Option<usize> {
        self.entry(h).and_then(|e| e.bucket)
    }

    pub(crate) fn set_bucket(&mut self, h: SaHandle, bucket: Option<usize>) {
        if let Some(entry) = self.entry_mut(h) {
            entry.bucket = bucket;
        }
    }

    /// Number of SAs alive, linked or not
    pub fn len(&self) -> usize {
        self.live
    }

    /// Is the arena empty?
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::{Cookies, MessageId};
    use crate::doi::isakmp::IsakmpDoi;
    use std::sync::Arc;

    fn sa() -> SecurityAssociation {
        SecurityAssociation::new(
            Cookies::new([1; 16]),
            MessageId::ZERO,
            Arc::new(IsakmpDoi::new()),
        )
    }

    #[test]
    fn test_reference_release_round_trip() {
        let mut arena = SaArena::new();
        let h = arena.insert(sa());
        assert_eq!(arena.reference(h), Some(1));

        let before = arena.refcnt(h);
        arena.reference(h);
        assert!(matches!(arena.release(h), Some(Released::Alive(1))));
        assert_eq!(arena.refcnt(h), before);
        assert!(arena.get(h).is_some());
    }

    #[test]
    fn test_last_release_frees_slot() {
        let mut arena = SaArena::new();
        let h = arena.insert(sa());
        arena.reference(h);
        assert!(matches!(arena.release(h), Some(Released::Freed(_))));
        assert!(arena.get(h).is_none());
        assert!(arena.release(h).is_none());
        assert!(arena.is_empty());
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut arena = SaArena::new();
        let old = arena.insert(sa());
        arena.remove(old);

        let new = arena.insert(sa());
        assert_ne!(old, new);
        assert!(arena.get(old).is_none());
        assert!(arena.get(new).is_some());
        assert_eq!(arena.len(), 1);
    }
}
