//! Free-function shims over [`Pool`] matching the public allocator
//! surface named in spec §6 (`open`/`close`/`check`/`pmalloc`/`pfree`/
//! `prealloc`/`pdirect`). `Pool`'s own methods do the real work; these
//! just give callers who hold a `&Pool` handle the exact names spec §6
//! lists, without forcing every caller through `Pool::` qualification.

use std::path::Path;

use crate::error::Result;
use crate::pool::Pool;

/// Opens (creating if absent) a pool file at `path` with at least `size`
/// bytes.
pub fn open(path: impl AsRef<Path>, size: u64) -> Result<Pool> {
    Pool::open(path, size)
}

/// Verifies an existing pool file without opening it for allocation.
pub fn check(path: impl AsRef<Path>) -> Result<()> {
    Pool::check(path)
}

/// Flushes and marks `pool` cleanly closed.
pub fn close(pool: &Pool) -> Result<()> {
    pool.close()
}

/// Allocates `size` bytes from `pool`, returning the new object's
/// pool-offset.
pub fn pmalloc(pool: &Pool, size: usize) -> Result<u64> {
    pool.pmalloc(size)
}

/// Releases the object at `offset` back to `pool`.
pub fn pfree(pool: &Pool, offset: u64) -> Result<()> {
    pool.pfree(offset)
}

/// Resizes the object at `offset` to `new_size`, returning its
/// (possibly unchanged) pool-offset.
pub fn prealloc(pool: &Pool, offset: u64, new_size: usize) -> Result<u64> {
    pool.prealloc(offset, new_size)
}

/// Direct, unbucketed access to `len` bytes at `offset`.
pub fn pdirect(pool: &Pool, offset: u64, len: usize) -> Result<*mut u8> {
    pool.pdirect(offset, len)
}
