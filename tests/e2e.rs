//! End-to-end scenarios exercising the public allocator surface and the
//! crash-recovery protocol from outside the crate, the way a consumer
//! would use it.

use pmalloc_core::backend::Backend;
use pmalloc_core::ctl::{ctl_get, ctl_set, CtlValue};
use pmalloc_core::layout::{self, InfoSlotPayload};
use pmalloc_core::{Error, Pool};
use tempfile::tempdir;

const ONE_ZONE: u64 = layout::FIRST_ZONE_OFFSET + layout::FULL_ZONE_SIZE;

/// A pool small enough (32 chunks) that exhausting it in a test is fast.
const SMALL_POOL: u64 = layout::FIRST_ZONE_OFFSET
    + layout::POOL_HEADER_SIZE as u64
    + 32 * (layout::CHUNK_HEADER_SIZE + layout::CHUNK_SIZE) as u64;

fn pool_path() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pool.bin");
    (dir, path)
}

/// S1: a fresh pool, closed cleanly, reopens with its allocations intact
/// and readable back through `pdirect`.
#[test]
fn fresh_create_then_reopen_preserves_data() {
    let (_dir, path) = pool_path();

    let offset = {
        let pool = Pool::open(&path, ONE_ZONE).unwrap();
        let off = pool.pmalloc(128).unwrap();
        let ptr = pool.pdirect(off, 128).unwrap();
        unsafe { std::ptr::write_bytes(ptr, 0xab, 128) };
        pool.close().unwrap();
        off
    };

    let pool = Pool::open(&path, ONE_ZONE).unwrap();
    let ptr = pool.pdirect(offset, 128).unwrap();
    let byte = unsafe { std::ptr::read(ptr) };
    assert_eq!(byte, 0xab);
    assert!(
        pool.chunk_is_used(offset).unwrap(),
        "a clean close/reopen must not reclaim a live chunk"
    );
    pool.close().unwrap();
}

/// S2: alloc/free/realloc cycles reuse freed space rather than growing
/// the heap without bound.
#[test]
fn alloc_free_realloc_cycle_bounds_heap_growth() {
    let (_dir, path) = pool_path();
    let pool = Pool::open(&path, ONE_ZONE).unwrap();

    let baseline = pool.stats().allocated;
    let mut live = Vec::new();
    for _ in 0..64 {
        live.push(pool.pmalloc(256).unwrap());
    }
    for off in live.drain(..32) {
        pool.pfree(off).unwrap();
    }
    for _ in 0..32 {
        live.push(pool.pmalloc(256).unwrap());
    }
    let after = pool.stats().allocated;
    // 64 live objects worth of growth, not 96 - the freed half was reused.
    assert!(after - baseline < (96 * 256) as u64);

    for off in live {
        pool.pfree(off).unwrap();
    }
    pool.close().unwrap();
}

/// S3: mapping a size range to a non-default allocation class takes
/// effect for subsequent allocations in that range.
#[test]
fn ctl_class_map_changes_which_class_serves_a_size() {
    let (_dir, path) = pool_path();
    let pool = Pool::open(&path, ONE_ZONE).unwrap();

    ctl_set(&pool, "heap.alloc_class.map.range", CtlValue::Range(512, 1)).unwrap();
    let offset = pool.pmalloc(400).unwrap();
    assert_ne!(offset, 0);

    ctl_set(&pool, "heap.alloc_class.reset", CtlValue::Bool(true)).unwrap();
    pool.pfree(offset).unwrap();
    pool.close().unwrap();
}

/// S4a: a crash in the middle of `pmalloc`, after the info slot is
/// raised but before the caller ever learns the offset, rolls back to
/// free on the next open.
#[test]
fn crash_during_alloc_rolls_back_on_reopen() {
    let (_dir, path) = pool_path();
    let offset = {
        let mut backend = Backend::create(&path, ONE_ZONE).unwrap();
        let have = backend.chunk_size_idx(0, 0);
        backend.split_chunk(0, 0, have, 1);
        let offset = backend.chunk_data_offset(0, 0);
        backend.guard_up(0, InfoSlotPayload::Alloc { offset });
        backend.set_used(0, 0, true);
        // No guard_down, no clean close: simulates a crash before the
        // allocation was ever handed back to the caller.
        offset
    };

    let backend = Backend::open(&path).unwrap();
    let (zone_id, chunk_idx) = backend.locate(offset).unwrap();
    assert!(!backend.chunk_is_used(zone_id, chunk_idx));
}

/// S4b: a crash in the middle of `pfree`, after the info slot is raised
/// but before the chunk header mutation, is rolled back: the chunk is
/// restored to `USED`, since the free was never actually applied.
#[test]
fn crash_during_free_rolls_back_on_reopen() {
    let (_dir, path) = pool_path();
    let offset = {
        let mut backend = Backend::create(&path, ONE_ZONE).unwrap();
        let have = backend.chunk_size_idx(0, 0);
        backend.split_chunk(0, 0, have, 1);
        backend.set_used(0, 0, true);
        let offset = backend.chunk_data_offset(0, 0);
        backend.guard_up(0, InfoSlotPayload::Free { offset });
        // No chunk mutation performed yet, no guard_down, no clean close.
        offset
    };

    let backend = Backend::open(&path).unwrap();
    let (zone_id, chunk_idx) = backend.locate(offset).unwrap();
    assert!(backend.chunk_is_used(zone_id, chunk_idx));
}

/// S4c: a crash during `prealloc`'s alloc-copy-free path, after the new
/// side was marked used but before the old side was freed, keeps the
/// new side and frees the old one.
#[test]
fn crash_during_realloc_keeps_the_committed_side() {
    let (_dir, path) = pool_path();
    let (old_offset, new_offset) = {
        let mut backend = Backend::create(&path, ONE_ZONE).unwrap();
        let have = backend.chunk_size_idx(0, 0);
        let (remainder_idx, remainder_size) = backend.split_chunk(0, 0, have, 1).unwrap();
        backend.set_used(0, 0, true);
        let old_offset = backend.chunk_data_offset(0, 0);

        let (new_remainder_idx, _) = backend
            .split_chunk(0, remainder_idx, remainder_size, 1)
            .unwrap();
        let new_offset = backend.chunk_data_offset(0, remainder_idx);

        backend.guard_up(
            0,
            InfoSlotPayload::Realloc { old_offset, new_offset },
        );
        backend.set_used(0, remainder_idx, true);
        // Old side never freed, no guard_down, no clean close.
        let _ = new_remainder_idx;
        (old_offset, new_offset)
    };

    let backend = Backend::open(&path).unwrap();
    let (old_zone, old_chunk) = backend.locate(old_offset).unwrap();
    let (new_zone, new_chunk) = backend.locate(new_offset).unwrap();
    assert!(!backend.chunk_is_used(old_zone, old_chunk), "old side must be freed");
    assert!(backend.chunk_is_used(new_zone, new_chunk), "new side must be kept");
}

/// S5: a pool sized for exactly one zone reports `NoMem` once every
/// chunk is handed out, rather than silently growing or corrupting
/// state.
#[test]
fn exhausted_pool_reports_nomem() {
    let (_dir, path) = pool_path();
    let pool = Pool::open(&path, SMALL_POOL).unwrap();

    let mut live = Vec::new();
    let result = loop {
        match pool.pmalloc(layout::CHUNK_SIZE) {
            Ok(off) => live.push(off),
            Err(e) => break e,
        }
    };
    assert!(matches!(result, Error::NoMem { .. }));

    for off in live {
        pool.pfree(off).unwrap();
    }
    pool.close().unwrap();
}

/// S6: the CTL parser rejects malformed and unknown dotted paths rather
/// than silently treating them as some default leaf.
#[test]
fn ctl_parser_rejects_malformed_paths() {
    let (_dir, path) = pool_path();
    let pool = Pool::open(&path, ONE_ZONE).unwrap();

    assert!(ctl_get(&pool, "").is_err());
    assert!(ctl_get(&pool, "...").is_err());
    assert!(ctl_get(&pool, "heap.alloc_class.not_a_number.desc").is_err());
    assert!(ctl_set(&pool, "stats.heap.allocated", CtlValue::U64(0)).is_err());

    pool.close().unwrap();
}

/// S7: `close` refuses while a guard is still raised, matching the
/// invariant that a pool must never be marked `CLOSED` with pending
/// recovery state.
#[test]
fn close_refuses_with_pending_guard() {
    let (_dir, path) = pool_path();
    let mut backend = Backend::create(&path, ONE_ZONE).unwrap();
    backend.guard_up(0, InfoSlotPayload::Alloc { offset: backend.chunk_data_offset(0, 0) });
    assert!(backend.close().is_err());
    backend.guard_down(0);
    assert!(backend.close().is_ok());
}
