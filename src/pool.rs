//! The top-level allocator handle (spec §2, §4.6, §4.7): opens a
//! [`Backend`], registers size classes, and dispatches `pmalloc`/`pfree`/
//! `prealloc` to a thread-affine [`Arena`], falling back to a shared
//! global bucket set and then to draining other arenas before giving up
//! with `NoMem`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::arena::Arena;
use crate::backend::{self, Backend};
use crate::bucket::{Bucket, FreeOutcome, HeaderKind, SizeClass, HUGE_CLASS_ID};
use crate::container::Block;
use crate::error::{Error, Result};
use crate::layout::{InfoSlotKind, INFO_SLOT_COUNT};

/// Statistics surfaced through the CTL `stats.heap.*` leaves (spec §4.8).
/// `allocated`/`freed` are byte-granular down to a single unit for
/// sub-chunk ("run") classes (spec §8 S2/S3) — tracked here, not derived
/// from chunk headers, since a chunk header only records whether its host
/// chunk is used at all, not how many bytes within it are occupied.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    /// Bytes currently live (handed out and not yet freed).
    pub allocated: u64,
    /// Cumulative bytes ever returned via `pfree`/`prealloc`'s old side,
    /// for the lifetime of this open pool handle.
    pub freed: u64,
    pub active_zones: u64,
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static ARENA_CACHE: RefCell<HashMap<usize, Arc<Arena>>> = RefCell::new(HashMap::new());
}

/// Default size-class ladder registered by every freshly-opened pool:
/// one "huge" class (whole chunks) plus a geometric run of small classes
/// from 16 bytes up to a quarter of the chunk size, each subdividing one
/// host chunk into as many units as fit (spec §4.5, §4.8
/// `heap.alloc_class.<id>.desc`).
fn default_classes() -> Vec<SizeClass> {
    let mut classes = vec![SizeClass::huge()];
    let mut unit_size: u32 = 16;
    let mut id = 1u8;
    while (unit_size as usize) <= crate::layout::CHUNK_SIZE / 4 {
        classes.push(SizeClass {
            id,
            unit_size,
            units_per_block: (crate::layout::CHUNK_SIZE as u32) / unit_size,
            header_kind: HeaderKind::Minimal,
        });
        unit_size *= 2;
        id += 1;
    }
    classes
}

/// Ascending `(max_size_inclusive, class_id)` table used to pick a class
/// for a requested size; anything larger than the last entry goes to the
/// huge class.
fn default_ranges(classes: &[SizeClass]) -> Vec<(usize, u8)> {
    classes
        .iter()
        .filter(|c| !c.is_huge())
        .map(|c| (c.unit_size as usize, c.id))
        .collect()
}

pub struct Pool {
    pool_id: usize,
    backend: Mutex<Backend>,
    classes: RwLock<Vec<SizeClass>>,
    ranges: RwLock<Vec<(usize, u8)>>,
    global: Vec<Bucket>,
    arenas: Mutex<Vec<Option<Arc<Arena>>>>,
    arena_threads: Mutex<Vec<u32>>,
    allocated_bytes: AtomicU64,
    freed_bytes: AtomicU64,
    path: PathBuf,
}

impl Pool {
    /// Opens (creating if absent) a pool file at `path` with at least
    /// `size` bytes and rebuilds the volatile free-list state from the
    /// persistent chunk headers (spec §4.3, §4.6).
    pub fn open(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        crate::logging::init();
        let path = path.as_ref();
        let backend = if path.exists() && path.metadata().map(|m| m.len() > 0).unwrap_or(false) {
            Backend::open(path)?
        } else {
            Backend::create(path, size)?
        };

        let classes = default_classes();
        let ranges = default_ranges(&classes);
        let global: Vec<Bucket> = classes.iter().map(|&c| Bucket::new(c)).collect();

        let huge_idx = classes.iter().position(|c| c.is_huge()).expect("huge class always present");
        for (zone_id, chunk_idx, size_idx) in backend.free_spans() {
            global[huge_idx].seed_chunk(zone_id, chunk_idx, size_idx);
        }

        // Seed the live-byte counter from whatever is already marked
        // `USED` on disk. Exact for huge allocations; for any run chunk
        // that survives a reopen this is a coarse (whole-host-chunk)
        // upper bound, since interior occupancy is not persisted (see
        // `Backend::used_chunk_bytes`, DESIGN.md).
        let allocated_bytes = AtomicU64::new(backend.used_chunk_bytes());

        let pool_id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        info!(pool_id, path = %path.display(), "pool opened");

        Ok(Pool {
            pool_id,
            backend: Mutex::new(backend),
            classes: RwLock::new(classes),
            ranges: RwLock::new(ranges),
            global,
            arenas: Mutex::new((0..INFO_SLOT_COUNT).map(|_| None).collect()),
            arena_threads: Mutex::new(vec![0u32; INFO_SLOT_COUNT]),
            allocated_bytes,
            freed_bytes: AtomicU64::new(0),
            path: path.to_path_buf(),
        })
    }

    /// Verifies an existing pool file without opening it for allocation
    /// (spec §6 standalone `check()`).
    pub fn check(path: impl AsRef<Path>) -> Result<()> {
        backend::check_pool(path.as_ref())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            allocated: self.allocated_bytes.load(Ordering::Relaxed),
            freed: self.freed_bytes.load(Ordering::Relaxed),
            active_zones: self.backend.lock().active_zones(),
        }
    }

    /// Reports whether the chunk backing `offset` is currently marked
    /// `USED`, for callers (tests, diagnostics) that need to see past the
    /// allocator's own bookkeeping into the raw chunk-header state.
    pub fn chunk_is_used(&self, offset: u64) -> Result<bool> {
        let backend = self.backend.lock();
        let (zone_id, chunk_idx) = backend
            .locate(offset)
            .ok_or_else(|| Error::invalid(format!("offset {} is not within any zone", offset)))?;
        Ok(backend.chunk_is_used(zone_id, chunk_idx))
    }

    /// Flushes and marks the pool cleanly `CLOSED` (spec §4.3 `close`).
    /// Refuses while any arena has an info slot still pending.
    pub fn close(&self) -> Result<()> {
        self.backend.lock().close()
    }

    fn class_for_size(&self, size: usize) -> u8 {
        let ranges = self.ranges.read();
        ranges
            .iter()
            .find(|&&(max, _)| size <= max)
            .map(|&(_, id)| id)
            .unwrap_or(HUGE_CLASS_ID)
    }

    fn class(&self, id: u8) -> Option<SizeClass> {
        self.classes.read().iter().find(|c| c.id == id).copied()
    }

    fn global_bucket(&self, id: u8) -> Option<&Bucket> {
        self.global.iter().find(|b| b.class_id() == id)
    }

    fn units_for(&self, class_id: u8, size: usize) -> u32 {
        self.class(class_id).map(|c| c.calc_units(size)).unwrap_or(0)
    }

    fn arena_for_current_thread(&self) -> Arc<Arena> {
        if let Some(a) = ARENA_CACHE.with(|c| c.borrow().get(&self.pool_id).cloned()) {
            return a;
        }
        let arena = self.assign_arena();
        ARENA_CACHE.with(|c| c.borrow_mut().insert(self.pool_id, arena.clone()));
        arena
    }

    /// Assigns the calling thread to the arena with the fewest associated
    /// threads, creating a fresh arena while a free info-slot id remains
    /// (spec §4.6: "the arena with the fewest associated threads is
    /// selected").
    fn assign_arena(&self) -> Arc<Arena> {
        let mut arenas = self.arenas.lock();
        let mut counts = self.arena_threads.lock();

        if let Some(idx) = arenas.iter().position(|s| s.is_none()) {
            let classes = self.classes.read().clone();
            let arena = Arc::new(Arena::new(idx, &classes));
            arenas[idx] = Some(arena.clone());
            counts[idx] = 1;
            return arena;
        }

        let (idx, _) = counts
            .iter()
            .enumerate()
            .min_by_key(|&(_, &c)| c)
            .expect("info slot table is never empty");
        counts[idx] += 1;
        arenas[idx].clone().expect("selected arena slot must be populated")
    }

    /// Allocates `size` bytes, returning the pool-offset of the new
    /// object (spec §4.7 `pmalloc`).
    pub fn pmalloc(&self, size: usize) -> Result<u64> {
        if size == 0 {
            return Err(Error::invalid("pmalloc size must be non-zero"));
        }
        let arena = self.arena_for_current_thread();
        let mut backend = self.backend.lock();

        let (class_id, block, dest_offset) = self.find_block(&arena, size, &mut backend)?;
        arena.guard_up(&mut backend, crate::layout::InfoSlotPayload::Alloc { offset: dest_offset });
        self.mark_allocated(&arena, class_id, &block, &mut backend);
        arena.guard_down(&mut backend);
        self.allocated_bytes.fetch_add(self.block_usable_bytes(class_id, &block), Ordering::Relaxed);
        Ok(dest_offset)
    }

    /// Bytes a `block` of `class_id` actually reserves: `size_idx` chunks
    /// for the huge class, `size_idx` units of `unit_size` otherwise (spec
    /// §8 S2/S3 byte-granular accounting for sub-chunk classes).
    fn block_usable_bytes(&self, class_id: u8, block: &Block) -> u64 {
        self.class(class_id)
            .map(|c| c.usable_size(block.size_idx as u32) as u64)
            .unwrap_or(0)
    }

    /// Splits/carves a free block for `size` and computes the pool-offset
    /// it would live at, without yet flipping any `USED` flag — that
    /// mutation happens only once a guard is raised around it (spec
    /// §4.4 step 1).
    fn find_block(&self, arena: &Arena, size: usize, backend: &mut Backend) -> Result<(u8, Block, u64)> {
        let class_id = self.class_for_size(size);
        let units = self.units_for(class_id, size);

        let block = self.obtain_block(arena, class_id, units, backend)?;
        let block = match block {
            Some(b) => b,
            None => return Err(Error::NoMem { requested: size }),
        };

        let dest_offset = backend.chunk_data_offset(block.zone_id as u32, block.chunk_idx as u32)
            + block.block_off as u64 * self.class(class_id).unwrap().unit_size as u64;

        Ok((class_id, block, dest_offset))
    }

    fn mark_allocated(&self, arena: &Arena, class_id: u8, block: &Block, backend: &mut Backend) {
        if let Some(bucket) = arena.bucket(class_id) {
            bucket.mark_allocated(block, backend);
        }
    }

    /// Tries, in order: this thread's arena, the global fallback bucket,
    /// then every other arena's private bucket of the same class (spec
    /// §4.7 failure-mode escalation before `NoMem`).
    fn obtain_block(
        &self,
        arena: &Arena,
        class_id: u8,
        units: u32,
        backend: &mut Backend,
    ) -> Result<Option<Block>> {
        if let Some(block) = arena.try_get(class_id, units, backend)? {
            return Ok(Some(block));
        }
        if let Some(bucket) = self.global_bucket(class_id) {
            if let Some(block) = bucket.get_object(units, backend)? {
                return Ok(Some(block));
            }
        }
        warn!(class_id, units, "arena and global bucket empty, draining other arenas");
        let others: Vec<Arc<Arena>> = self
            .arenas
            .lock()
            .iter()
            .filter_map(|s| s.clone())
            .filter(|a| a.id != arena.id)
            .collect();
        for other in others {
            if let Some(block) = other.try_get(class_id, units, backend)? {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    /// Releases a previously-allocated pool-offset (spec §4.7 `pfree`).
    pub fn pfree(&self, offset: u64) -> Result<()> {
        if offset == 0 {
            return Ok(());
        }
        let arena = self.arena_for_current_thread();
        let mut backend = self.backend.lock();

        let (zone_id, chunk_idx) = backend
            .locate(offset)
            .ok_or_else(|| Error::invalid(format!("pool-offset 0x{:x} is not inside a chunk", offset)))?;

        #[cfg(any(feature = "check_double_free", debug_assertions))]
        if !backend.chunk_is_used(zone_id, chunk_idx) {
            return Err(Error::DoubleFree { offset });
        }

        let class_id = self.class_for_freed(zone_id, chunk_idx, offset, &backend);
        let block = self.block_for_offset(zone_id, chunk_idx, offset, class_id, &backend);
        let freed_bytes = self.block_usable_bytes(class_id, &block);

        arena.guard_up(&mut backend, crate::layout::InfoSlotPayload::Free { offset });
        self.release_block(&arena, class_id, block, &mut backend)?;
        arena.guard_down(&mut backend);
        self.allocated_bytes.fetch_sub(freed_bytes, Ordering::Relaxed);
        self.freed_bytes.fetch_add(freed_bytes, Ordering::Relaxed);
        Ok(())
    }

    fn class_for_freed(&self, zone_id: u32, chunk_idx: u32, _offset: u64, backend: &Backend) -> u8 {
        match backend.chunk_kind(zone_id, chunk_idx) {
            crate::layout::ChunkType::Run => backend.chunk_header_type_word(zone_id, chunk_idx) as u8,
            _ => HUGE_CLASS_ID,
        }
    }

    fn block_for_offset(&self, zone_id: u32, chunk_idx: u32, offset: u64, class_id: u8, backend: &Backend) -> Block {
        if class_id == HUGE_CLASS_ID {
            let size_idx = backend.chunk_size_idx(zone_id, chunk_idx);
            Block::new(zone_id as u16, chunk_idx as u16, 0, size_idx)
        } else {
            let unit_size = self.class(class_id).map(|c| c.unit_size as u64).unwrap_or(1);
            let data_start = backend.chunk_data_offset(zone_id, chunk_idx);
            let block_off = ((offset - data_start) / unit_size) as u16;
            let units = self.units_for(class_id, 1);
            Block::new(zone_id as u16, chunk_idx as u16, block_off, units.max(1) as u16)
        }
    }

    fn release_block(&self, arena: &Arena, class_id: u8, block: Block, backend: &mut Backend) -> Result<()> {
        match arena.add(class_id, block, backend)? {
            FreeOutcome::Retained => Ok(()),
            FreeOutcome::ChunkFreed => {
                if let Some(global) = self.global_bucket(HUGE_CLASS_ID) {
                    let merged_size = backend.chunk_size_idx(block.zone_id as u32, block.chunk_idx as u32);
                    global.seed_chunk(block.zone_id, block.chunk_idx, merged_size);
                }
                Ok(())
            }
        }
    }

    /// Resizes the object at `offset` to `new_size`, preserving its
    /// content and growing in place when the trailing chunk is free and
    /// large enough (spec §4.7 `prealloc`).
    pub fn prealloc(&self, offset: u64, new_size: usize) -> Result<u64> {
        if offset == 0 {
            return self.pmalloc(new_size);
        }
        if new_size == 0 {
            self.pfree(offset)?;
            return Ok(0);
        }

        let arena = self.arena_for_current_thread();
        let mut backend = self.backend.lock();
        let (zone_id, chunk_idx) = backend
            .locate(offset)
            .ok_or_else(|| Error::invalid(format!("pool-offset 0x{:x} is not inside a chunk", offset)))?;

        let old_class = self.class_for_freed(zone_id, chunk_idx, offset, &backend);
        let new_class = self.class_for_size(new_size);

        if old_class == HUGE_CLASS_ID && new_class == HUGE_CLASS_ID {
            let have = backend.chunk_size_idx(zone_id, chunk_idx);
            let need = self.units_for(HUGE_CLASS_ID, new_size) as u16;
            if need <= have {
                return Ok(offset);
            }
            let grown = backend.try_merge_next(zone_id, chunk_idx, have);
            if grown >= need {
                let delta = (grown - have) as u64 * crate::layout::CHUNK_SIZE as u64;
                self.allocated_bytes.fetch_add(delta, Ordering::Relaxed);
                return Ok(offset);
            }
        }

        // Fall back to alloc-copy-free, as one guarded Realloc: recovery
        // keeps whichever side actually reached `USED` before a crash
        // (spec §4.4, §4.7).
        let (new_class, new_block, new_offset) = self.find_block(&arena, new_size, &mut backend)?;
        arena.guard_up(
            &mut backend,
            crate::layout::InfoSlotPayload::Realloc { old_offset: offset, new_offset },
        );
        self.mark_allocated(&arena, new_class, &new_block, &mut backend);
        let new_bytes = self.block_usable_bytes(new_class, &new_block);
        self.allocated_bytes.fetch_add(new_bytes, Ordering::Relaxed);

        let old_size = self.object_usable_size(zone_id, chunk_idx, old_class, &backend);
        let copy_len = old_size.min(new_size);
        unsafe {
            let src = backend.chunk_data_ptr(zone_id, chunk_idx);
            let (dst_zone, dst_chunk) = backend.locate(new_offset).unwrap();
            let dst_base = backend.chunk_data_ptr(dst_zone, dst_chunk);
            let dst = dst_base.add((new_offset - backend.chunk_data_offset(dst_zone, dst_chunk)) as usize);
            std::ptr::copy_nonoverlapping(src, dst, copy_len);
            crate::ll::persist(dst as *const u8, copy_len);
        }

        let old_block = self.block_for_offset(zone_id, chunk_idx, offset, old_class, &backend);
        let old_bytes = self.block_usable_bytes(old_class, &old_block);
        self.release_block(&arena, old_class, old_block, &mut backend)?;
        arena.guard_down(&mut backend);
        self.allocated_bytes.fetch_sub(old_bytes, Ordering::Relaxed);
        self.freed_bytes.fetch_add(old_bytes, Ordering::Relaxed);

        Ok(new_offset)
    }

    fn object_usable_size(&self, zone_id: u32, chunk_idx: u32, class_id: u8, backend: &Backend) -> usize {
        if class_id == HUGE_CLASS_ID {
            backend.chunk_size_idx(zone_id, chunk_idx) as usize * crate::layout::CHUNK_SIZE
        } else {
            self.class(class_id).map(|c| c.unit_size as usize).unwrap_or(0)
        }
    }

    /// Direct, unbucketed access to a previously-allocated region for
    /// in-place mutation without going through `prealloc` (spec §4.7
    /// `pdirect`, SPEC_FULL bounds-check supplement).
    pub fn pdirect(&self, offset: u64, len: usize) -> Result<*mut u8> {
        let mut backend = self.backend.lock();
        let (zone_id, chunk_idx) = backend
            .locate(offset)
            .ok_or_else(|| Error::invalid(format!("pool-offset 0x{:x} is not inside a chunk", offset)))?;
        let data_start = backend.chunk_data_offset(zone_id, chunk_idx);
        let chunk_bytes = backend.chunk_size_idx(zone_id, chunk_idx) as u64 * crate::layout::CHUNK_SIZE as u64;
        if offset < data_start || offset + len as u64 > data_start + chunk_bytes {
            return Err(Error::invalid(format!(
                "pdirect range [0x{:x}, len {}) escapes its chunk",
                offset, len
            )));
        }
        let base = backend.chunk_data_ptr(zone_id, chunk_idx);
        Ok(unsafe { base.add((offset - data_start) as usize) })
    }

    pub fn classes(&self) -> Vec<SizeClass> {
        self.classes.read().clone()
    }

    pub fn set_range_mapping(&self, max_size: usize, class_id: u8) -> Result<()> {
        if self.class(class_id).is_none() {
            return Err(Error::invalid(format!("unknown allocation class {}", class_id)));
        }
        let mut ranges = self.ranges.write();
        ranges.retain(|&(m, _)| m != max_size);
        ranges.push((max_size, class_id));
        ranges.sort_by_key(|&(m, _)| m);
        Ok(())
    }

    pub fn reset_range_mapping(&self) {
        let mut ranges = self.ranges.write();
        *ranges = default_ranges(&self.classes.read());
    }

    /// Applies a new `{unit_size, units_per_block, header_kind}` to a
    /// registered size class (spec §4.8 `heap.alloc_class.<id>.desc`
    /// write; scenario S3 sets a class's desc before ever allocating from
    /// it). Updates the class table and that class's global bucket; only
    /// meaningful to call before the class has any live allocations — a
    /// bucket's already-carved `RunBitmap`s are not resized to match a new
    /// `units_per_block`, and any arena created before this call keeps its
    /// own private bucket's old snapshot until that arena is recreated.
    pub fn set_class_desc(
        &self,
        class_id: u8,
        unit_size: u32,
        units_per_block: u32,
        header_kind: HeaderKind,
    ) -> Result<()> {
        if class_id == HUGE_CLASS_ID {
            return Err(Error::invalid("the huge class's descriptor is fixed"));
        }
        let mut classes = self.classes.write();
        let class = classes
            .iter_mut()
            .find(|c| c.id == class_id)
            .ok_or_else(|| Error::invalid(format!("unknown alloc_class id {}", class_id)))?;
        class.unit_size = unit_size;
        class.units_per_block = units_per_block;
        class.header_kind = header_kind;
        drop(classes);

        if let Some(bucket) = self.global_bucket(class_id) {
            bucket.set_desc(unit_size, units_per_block, header_kind);
        }
        Ok(())
    }

    /// `true` if every arena's info slot is clear (spec §4.4 invariant:
    /// "close refuses while a slot is pending").
    pub fn has_pending_guards(&self) -> bool {
        (0..INFO_SLOT_COUNT).any(|idx| self.backend.lock().info_slot_kind(idx) != InfoSlotKind::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const POOL_SIZE: u64 = crate::layout::FIRST_ZONE_OFFSET + crate::layout::FULL_ZONE_SIZE;

    fn pool_path() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.bin");
        (dir, path)
    }

    #[test]
    fn alloc_free_realloc_cycle_reuses_space() {
        let (_dir, path) = pool_path();
        let pool = Pool::open(&path, POOL_SIZE).unwrap();

        let a = pool.pmalloc(64).unwrap();
        assert_ne!(a, 0);
        let b = pool.pmalloc(64).unwrap();
        assert_ne!(b, 0);
        assert_ne!(a, b);

        pool.pfree(a).unwrap();
        let c = pool.pmalloc(64).unwrap();
        assert_eq!(c, a, "freed small-class slot should be reused before carving a new one");

        let grown = pool.prealloc(b, 4096).unwrap();
        assert_ne!(grown, 0);

        pool.pfree(c).unwrap();
        pool.pfree(grown).unwrap();
        pool.close().unwrap();
    }

    #[test]
    fn huge_allocation_round_trips_through_reopen() {
        let (_dir, path) = pool_path();
        let offset = {
            let pool = Pool::open(&path, POOL_SIZE).unwrap();
            let off = pool.pmalloc(crate::layout::CHUNK_SIZE * 2).unwrap();
            pool.close().unwrap();
            off
        };

        let pool = Pool::open(&path, POOL_SIZE).unwrap();
        let stats = pool.stats();
        assert!(stats.allocated >= (crate::layout::CHUNK_SIZE * 2) as u64);
        pool.pfree(offset).unwrap();
        pool.close().unwrap();
    }

    #[test]
    fn pdirect_rejects_out_of_range_access() {
        let (_dir, path) = pool_path();
        let pool = Pool::open(&path, POOL_SIZE).unwrap();
        let offset = pool.pmalloc(64).unwrap();
        assert!(pool.pdirect(offset, 64).is_ok());
        assert!(pool.pdirect(offset, 1_000_000).is_err());
        pool.close().unwrap();
    }
}
