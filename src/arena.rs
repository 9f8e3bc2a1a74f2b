//! Arenas: thread-affine allocator front-ends (spec §4.6).
//!
//! Each arena owns one persistent info slot (for guard up/down) and a
//! private set of buckets, one per registered size class. A thread picks
//! one arena (and sticks to it, via a thread-local cache) so that most
//! allocations never contend with another thread's bucket locks; only the
//! shared backend and the global fallback buckets in
//! [`crate::pool::Pool`] are contended across arenas.

use crate::backend::Backend;
use crate::bucket::{Bucket, SizeClass};
use crate::container::Block;
use crate::error::Result;
use crate::layout::InfoSlotPayload;

/// One allocator arena: a private bucket per size class plus the id of
/// this arena's persistent info slot (spec §4.6).
pub struct Arena {
    pub id: usize,
    buckets: Vec<Bucket>,
}

impl Arena {
    pub fn new(id: usize, classes: &[SizeClass]) -> Self {
        Arena {
            id,
            buckets: classes.iter().map(|&c| Bucket::new(c)).collect(),
        }
    }

    pub fn bucket(&self, class_id: u8) -> Option<&Bucket> {
        self.buckets.iter().find(|b| b.class_id() == class_id)
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Raises this arena's info-slot guard before mutating chunk headers
    /// (spec §4.4 step 1, §4.6 "arenas own the guard they raise").
    pub fn guard_up(&self, backend: &mut Backend, payload: InfoSlotPayload) {
        backend.guard_up(self.id, payload);
    }

    /// Lowers this arena's info-slot guard once the operation's visible
    /// effects are durable (spec §4.4 step 3).
    pub fn guard_down(&self, backend: &mut Backend) {
        backend.guard_down(self.id);
    }

    /// Crash-atomically publishes the pool-offset a caller will see
    /// (spec §4.6 `set_alloc_ptr`).
    pub fn set_alloc_ptr(&self, backend: &mut Backend, dest_offset: u64, value: u64) -> Result<()> {
        backend.publish_pointer(dest_offset, value)
    }

    /// Tries to satisfy `units` of `class_id` from this arena's own
    /// bucket only — callers fall back to the pool's global bucket or to
    /// draining other arenas when this returns `Ok(None)`.
    pub fn try_get(&self, class_id: u8, units: u32, backend: &mut Backend) -> Result<Option<Block>> {
        match self.bucket(class_id) {
            Some(bucket) => bucket.get_object(units, backend),
            None => Ok(None),
        }
    }

    /// Returns a freed block to this arena's own bucket.
    pub fn add(&self, class_id: u8, block: Block, backend: &mut Backend) -> Result<crate::bucket::FreeOutcome> {
        let bucket = self
            .bucket(class_id)
            .ok_or_else(|| crate::error::Error::invalid(format!("unknown size class {}", class_id)))?;
        bucket.add_object(block, backend)
    }
}
