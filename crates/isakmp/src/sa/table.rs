//! The SA table
//!
//! All live SAs are indexed here, in an array of buckets addressed by the
//! cookie fold hash (see [`crate::cookie`]). Bucket lists are
//! most-recent-first. Each SA remembers the bucket it was linked into, so it
//! can always be unlinked even if the table has grown since.
//!
//! # Resizing
//!
//! Growing the table doubles the bucket count. Under
//! [`ResizePolicy::KeepBuckets`] existing entries stay where they are; a
//! later lookup hashes with the larger mask and may miss them. Under
//! [`ResizePolicy::Rehash`] every entry is moved to its new bucket.

use std::collections::VecDeque;

use super::arena::{Released, SaArena, SaHandle};
use super::{Phase, SecurityAssociation};
use crate::cookie::{bucket_index, Cookies, MessageId};
use crate::{Error, Result};

/// How [`SaTable::resize`] treats entries already in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResizePolicy {
    /// Only add empty buckets; existing entries may become unreachable by
    /// keyed lookup until they are removed
    #[default]
    KeepBuckets,
    /// Move every entry to the bucket the new mask selects
    Rehash,
}

/// Hash table of SAs keyed on cookies and message ID
pub struct SaTable {
    arena: SaArena,
    buckets: Vec<VecDeque<SaHandle>>,
    mask: u16,
    max_mask: u16,
    policy: ResizePolicy,
    linked: usize,
}

fn key_bucket(sa: &SecurityAssociation, mask: u16) -> usize {
    // Phase 1 message IDs are zero, folding them changes nothing
    let message_id = match sa.phase() {
        Phase::One => None,
        Phase::Two => Some(sa.message_id()),
    };
    bucket_index(sa.cookies(), message_id, mask)
}

impl SaTable {
    /// Create a table of `1 << bucket_bits` buckets that may grow to
    /// `1 << max_bucket_bits`
    pub fn new(bucket_bits: u8, max_bucket_bits: u8, policy: ResizePolicy) -> Result<Self> {
        if bucket_bits == 0 || bucket_bits > max_bucket_bits || max_bucket_bits > 16 {
            return Err(Error::Config(format!(
                "invalid bucket bits {} (max {})",
                bucket_bits, max_bucket_bits
            )));
        }
        let size = 1usize << bucket_bits;
        Ok(SaTable {
            arena: SaArena::new(),
            buckets: (0..size).map(|_| VecDeque::new()).collect(),
            mask: (size - 1) as u16,
            max_mask: ((1u32 << max_bucket_bits) - 1) as u16,
            policy,
            linked: 0,
        })
    }

    /// Store an SA without linking it; its reference count starts at zero
    pub fn alloc(&mut self, sa: SecurityAssociation) -> SaHandle {
        self.arena.insert(sa)
    }

    /// Link `h` at the head of its bucket, taking one reference for table
    /// membership
    pub fn insert(&mut self, h: SaHandle) -> Result<()> {
        if self.arena.bucket(h).is_some() {
            return Err(Error::InvalidState(format!("SA {} already in table", h)));
        }
        let sa = self
            .arena
            .get(h)
            .ok_or_else(|| Error::SaNotFound(h.to_string()))?;
        let bucket = key_bucket(sa, self.mask);
        self.link(h, bucket);
        self.arena.reference(h);
        Ok(())
    }

    fn link(&mut self, h: SaHandle, bucket: usize) {
        self.buckets[bucket].push_front(h);
        self.arena.set_bucket(h, Some(bucket));
        self.linked += 1;
    }

    fn unlink(&mut self, h: SaHandle) -> bool {
        let Some(bucket) = self.arena.bucket(h) else {
            return false;
        };
        let list = &mut self.buckets[bucket];
        if let Some(pos) = list.iter().position(|&x| x == h) {
            list.remove(pos);
        }
        self.arena.set_bucket(h, None);
        self.linked -= 1;
        true
    }

    /// Find an SA by key
    ///
    /// With `message_id` the SA must match it exactly (phase 2). Without it
    /// only SAs whose message ID is all-zero match (phase 1). The reference
    /// count is not touched.
    pub fn lookup(&self, cookies: &Cookies, message_id: Option<&MessageId>) -> Option<SaHandle> {
        let bucket = bucket_index(cookies, message_id, self.mask);
        self.buckets[bucket].iter().copied().find(|&h| {
            self.arena.get(h).map_or(false, |sa| {
                sa.cookies() == cookies
                    && match message_id {
                        Some(id) => sa.message_id() == id,
                        None => sa.message_id().is_zero(),
                    }
            })
        })
    }

    /// Linear scan over every bucket
    pub fn find<F>(&self, mut pred: F) -> Option<SaHandle>
    where
        F: FnMut(&SecurityAssociation) -> bool,
    {
        self.iter().find(|(_, sa)| pred(sa)).map(|(h, _)| h)
    }

    /// All linked SAs, bucket by bucket
    pub fn iter(&self) -> impl Iterator<Item = (SaHandle, &SecurityAssociation)> + '_ {
        self.buckets
            .iter()
            .flat_map(|list| list.iter().copied())
            .filter_map(move |h| self.arena.get(h).map(|sa| (h, sa)))
    }

    /// Handles of all linked SAs
    pub fn handles(&self) -> Vec<SaHandle> {
        self.iter().map(|(h, _)| h).collect()
    }

    /// Unlink `h` and drop the table's reference
    pub fn remove(&mut self, h: SaHandle) -> Result<Released> {
        if !self.unlink(h) {
            return Err(Error::SaNotFound(format!("{} not in table", h)));
        }
        self.arena
            .release(h)
            .ok_or_else(|| Error::Internal(format!("linked SA {} has no slot", h)))
    }

    /// Re-key a linked SA in place: unlink, apply `update`, link again
    ///
    /// The reference count is unchanged. Changing the cookies of a linked
    /// SA any other way would leave it in the wrong bucket.
    pub fn relink<F>(&mut self, h: SaHandle, update: F) -> Result<()>
    where
        F: FnOnce(&mut SecurityAssociation),
    {
        if !self.unlink(h) {
            return Err(Error::SaNotFound(format!("{} not in table", h)));
        }
        let sa = self
            .arena
            .get_mut(h)
            .ok_or_else(|| Error::SaNotFound(h.to_string()))?;
        update(sa);
        let bucket = key_bucket(sa, self.mask);
        self.link(h, bucket);
        Ok(())
    }

    /// Add a reference
    pub fn reference(&mut self, h: SaHandle) -> Result<u32> {
        self.arena
            .reference(h)
            .ok_or_else(|| Error::SaNotFound(h.to_string()))
    }

    /// Drop a reference
    ///
    /// Releasing the last reference of an SA that is still linked also
    /// unlinks it, so the table never holds a freed SA.
    pub fn release(&mut self, h: SaHandle) -> Result<Released> {
        if self.arena.refcnt(h) == Some(1) && self.unlink(h) {
            tracing::warn!(sa = %h, "last reference released while SA still in table");
        }
        self.arena
            .release(h)
            .ok_or_else(|| Error::SaNotFound(h.to_string()))
    }

    /// Double the number of buckets
    pub fn resize(&mut self) -> Result<()> {
        if self.mask >= self.max_mask {
            return Err(Error::ResourceExhausted(format!(
                "SA table already at {} buckets",
                self.buckets.len()
            )));
        }
        let new_mask = self.mask * 2 + 1;
        self.buckets
            .resize_with(new_mask as usize + 1, VecDeque::new);
        self.mask = new_mask;

        if self.policy == ResizePolicy::Rehash {
            for h in self.handles() {
                if let Some(sa) = self.arena.get(h) {
                    let bucket = key_bucket(sa, self.mask);
                    if Some(bucket) != self.arena.bucket(h) {
                        self.unlink(h);
                        self.link(h, bucket);
                    }
                }
            }
        }
        Ok(())
    }

    /// SA behind `h`
    pub fn get(&self, h: SaHandle) -> Option<&SecurityAssociation> {
        self.arena.get(h)
    }

    /// Mutable SA behind `h`
    pub fn get_mut(&mut self, h: SaHandle) -> Option<&mut SecurityAssociation> {
        self.arena.get_mut(h)
    }

    /// Reference count of `h`
    pub fn refcnt(&self, h: SaHandle) -> Option<u32> {
        self.arena.refcnt(h)
    }

    /// Is `h` linked into the table?
    pub fn contains(&self, h: SaHandle) -> bool {
        self.arena.bucket(h).is_some()
    }

    /// Number of buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket mask (`bucket_count() - 1`)
    pub fn mask(&self) -> u16 {
        self.mask
    }

    /// Number of linked SAs
    pub fn len(&self) -> usize {
        self.linked
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.linked == 0
    }

    /// Number of SAs alive, including unlinked ones still referenced
    pub fn live(&self) -> usize {
        self.arena.len()
    }
}
