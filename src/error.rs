//! Error taxonomy for the allocator core (spec §7).
//!
//! The teacher crate (`corundum`) returns `Result<T, String>` everywhere.
//! That is too coarse for a crash-consistency story where the caller needs
//! to distinguish "try again with a bigger pool" from "the pool is
//! corrupt, stop touching it" from "this is a programming error". We use a
//! typed enum instead, following the ambient-stack crates the rest of the
//! retrieved corpus reaches for (`thiserror`).

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported at the allocator API boundary.
///
/// Each variant corresponds to one row of the error taxonomy table in
/// spec §7. `Io` wraps the underlying mmap/file error; everything else is
/// a small integer kind at heart and could be converted to an errno-style
/// code by a C-facing shim, but internally we keep the context around.
#[derive(Debug, Error)]
pub enum Error {
    /// The allocator could not satisfy a request even after falling back
    /// to auxiliary buckets and draining per-arena caches.
    #[error("out of memory: unable to satisfy a request of {requested} bytes")]
    NoMem { requested: usize },

    /// Malformed CTL name, wrong read/write argument combination, a zero
    /// size passed to `pmalloc`, a non-null output pointer passed to
    /// `pmalloc`, an unknown allocation-class id, an out-of-range
    /// pool-offset, or a version mismatch on open.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// No valid primary or backup header was found, a chunk header in the
    /// middle of a zone does not carry the chunk magic, the live chunk
    /// headers of a zone do not tile `[0, zone_size_idx)` exactly, or an
    /// info slot still names an unknown type after recovery.
    #[error("pool is corrupt: {0}")]
    Corrupt(String),

    /// The underlying mmap/file operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `pfree`'s target chunk was not `USED`. Reported only when the
    /// `check_double_free` feature (or a debug build) is active; release
    /// builds absorb this into a no-op per spec §7.
    #[error("double free detected at pool-offset 0x{offset:x}")]
    DoubleFree { offset: u64 },
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }
}
