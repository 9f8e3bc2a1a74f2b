//! A crash-consistent persistent-memory allocator core.
//!
//! This crate turns a memory-mapped file into a recoverable,
//! multi-threaded heap: `pmalloc`/`pfree`/`prealloc`/`pdirect` hand out
//! and reclaim pool-offsets (not pointers — a pool can be remapped at a
//! different base address on every open) backed by a zoned, chunked
//! layout that survives an arbitrary power failure between any two
//! instructions.
//!
//! # Layout
//!
//! [`layout`] defines the bit-exact on-media structures (pool header,
//! info-slot table, zones of fixed-size chunks). [`backend`] owns the
//! memory map and is the only thing that ever writes into it — every
//! higher layer reaches the persistent region through a `&mut Backend`.
//! [`redo`] is a small fixed-capacity redo-log primitive for atomic
//! multi-word publishes.
//!
//! # Frontend
//!
//! [`container`] is the volatile ordered free-block index one
//! [`bucket::Bucket`] keeps per size class. [`arena::Arena`] groups one
//! bucket per class behind one persistent info slot and is what a
//! worker thread is actually pinned to. [`pool::Pool`] opens a backend,
//! registers the default size-class ladder, and dispatches allocation
//! requests to the calling thread's arena, falling back to a shared
//! global bucket set and then to draining other arenas before reporting
//! out-of-memory.
//!
//! # Everything else
//!
//! [`ctl`] is the dotted-name runtime parameter tree. [`error`] and
//! [`logging`] are the ambient error/tracing plumbing. [`ll`] holds the
//! low-level persistence primitives (flush/fence, checksums) everything
//! else is built on.
//!
//! There is no transaction API, root-pointer system, or user-facing CLI
//! here — those sit above this allocator core in a complete PMem
//! library and are out of scope for this crate.

pub mod api;
pub mod arena;
pub mod backend;
pub mod bucket;
pub mod container;
pub mod ctl;
pub mod error;
pub mod layout;
pub mod ll;
pub mod logging;
pub mod pool;
pub mod redo;

pub use api::{check, close, open, pdirect, pfree, pmalloc, prealloc};
pub use ctl::{ctl_get, ctl_set, CtlValue};
pub use error::{Error, Result};
pub use pool::Pool;
