//! The persistent backend (spec §4.3, §4.4): owns the mapped pool region,
//! verifies and (re)writes headers, recovers info slots on open, and
//! performs the actual chunk splitting/merging/flag flips that the
//! frontend ([`crate::pool::Pool`], [`crate::bucket::Bucket`],
//! [`crate::arena::Arena`]) drives.
//!
//! Grounded on the teacher crate's `alloc::MemPool::open`/`format`
//! contract (`src/alloc/pool.rs`: `apply_flags`, `create_file`,
//! `pre_alloc`/`pre_dealloc`/`perform`) generalized from Corundum's buddy
//! allocator to the zone/chunk layout this spec describes.

use std::fs::OpenOptions;
use std::path::Path;

use memmap::MmapMut;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::layout::{
    locate_chunk, zones_for_pool_size, ChunkHeader, ChunkType, InfoSlot, InfoSlotKind,
    InfoSlotPayload, PoolHeader, PoolState, ZoneGeometry, CHUNKS_PER_ZONE, CHUNK_SIZE,
    FIRST_ZONE_OFFSET, FORMAT_MAJOR, INFO_SLOT_COUNT, INFO_SLOT_SIZE, INFO_SLOT_TABLE_OFFSET,
    MIN_POOL_SIZE, POOL_HEADER_SIZE, REDO_LOG_BYTES, REDO_LOG_OFFSET,
};
use crate::ll::persist;
use crate::redo::{RedoEntry, RedoLog, RedoOp};

/// Owns the mapped pool file and all raw access into it. Every other
/// frontend component (`Arena`, `Bucket`, `Pool`) reaches the persistent
/// region exclusively through a `&mut Backend` — spec §5: "Only the
/// owning backend writes into the persistent region."
pub struct Backend {
    mmap: MmapMut,
    pool_size: u64,
    zones: Vec<ZoneGeometry>,
}

impl Backend {
    /// Creates (or reuses) the backing file at `path` with `size` bytes
    /// and opens it, performing a fresh format if the region is
    /// zero-initialised (spec §4.3 step 5).
    pub fn create(path: &Path, size: u64) -> Result<Self> {
        if size < MIN_POOL_SIZE {
            return Err(Error::invalid(format!(
                "pool size {} is below the minimum of {} bytes",
                size, MIN_POOL_SIZE
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(size)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mut backend = Backend { mmap, pool_size: size, zones: zones_for_pool_size(size) };
        backend.open_or_format()?;
        Ok(backend)
    }

    /// Opens an existing pool file, verifying it is well-formed and
    /// running crash recovery if it was left `OPEN` (spec §4.3).
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        if size < MIN_POOL_SIZE {
            return Err(Error::invalid(format!(
                "pool size {} is below the minimum of {} bytes",
                size, MIN_POOL_SIZE
            )));
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mut backend = Backend { mmap, pool_size: size, zones: zones_for_pool_size(size) };
        backend.open_or_format()?;
        Ok(backend)
    }

    fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn pool_size(&self) -> u64 {
        self.pool_size
    }

    pub fn zones(&self) -> &[ZoneGeometry] {
        &self.zones
    }

    fn at<T>(&self, offset: u64) -> *const T {
        (self.base_ptr() as u64 + offset) as *const T
    }

    fn at_mut<T>(&mut self, offset: u64) -> *mut T {
        (self.base_ptr() as u64 + offset) as *mut T
    }

    fn header(&self) -> &PoolHeader {
        unsafe { &*self.at::<PoolHeader>(0) }
    }

    fn header_mut(&mut self) -> &mut PoolHeader {
        unsafe { &mut *self.at_mut::<PoolHeader>(0) }
    }

    fn backup_header_mut(&mut self, zone_idx: usize) -> &mut PoolHeader {
        let off = self.zones[zone_idx].backup_header_offset();
        unsafe { &mut *self.at_mut::<PoolHeader>(off) }
    }

    fn write_header(&mut self, header: PoolHeader) {
        let h = self.header_mut();
        *h = header;
        persist(h as *const PoolHeader as *const u8, POOL_HEADER_SIZE);
    }

    fn write_backup(&mut self, zone_idx: usize, header: PoolHeader) {
        let h = self.backup_header_mut(zone_idx);
        *h = header;
        persist(h as *const PoolHeader as *const u8, POOL_HEADER_SIZE);
    }

    /// Copies the primary header into every zone's backup slot. Spec §9
    /// resolves the open question about backup timing in favor of
    /// "copy on every state transition" rather than only after a fresh
    /// format.
    fn sync_backups(&mut self) {
        let header = *self.header();
        for zone_idx in 0..self.zones.len() {
            self.write_backup(zone_idx, header);
        }
    }

    /// Primary/backup header verification, factored out so both `open`
    /// and the standalone [`crate::pool::check`] entry point share it
    /// (SPEC_FULL supplement).
    fn verify_headers(&mut self) -> Result<PoolHeader> {
        let primary = *self.header();
        if primary.magic_valid() && primary.checksum_valid() {
            return Ok(primary);
        }
        warn!("primary pool header failed verification, scanning backups");
        for zone_idx in 0..self.zones.len() {
            let backup = *self.backup_header_mut(zone_idx);
            if backup.magic_valid() && backup.checksum_valid() {
                info!(zone = zone_idx, "recovered primary header from backup");
                self.write_header(backup);
                return Ok(backup);
            }
        }
        Err(Error::corrupt(
            "no valid primary or backup pool header found",
        ))
    }

    fn is_zero_initialized(&self) -> bool {
        let primary = self.header();
        primary.magic == [0u8; 16]
    }

    fn redo_log_mut(&mut self) -> &mut RedoLog {
        unsafe { &mut *self.at_mut::<RedoLog>(REDO_LOG_OFFSET) }
    }

    /// Applies the shared redo log if it was left committed by a crash
    /// mid-`split_chunk`, otherwise discards a torn/uncommitted one (spec
    /// §4.2 `recover`).
    fn recover_redo_log(&mut self) {
        let base = self.base_ptr();
        let log = self.redo_log_mut();
        unsafe { log.recover(base) };
    }

    fn open_or_format(&mut self) -> Result<()> {
        if self.is_zero_initialized() {
            self.format_fresh();
            return Ok(());
        }

        let mut header = self.verify_headers()?;

        if header.major != FORMAT_MAJOR {
            return Err(Error::invalid(format!(
                "incompatible pool format version {}.{}",
                header.major, header.minor
            )));
        }
        if header.pool_size != self.pool_size {
            return Err(Error::invalid(format!(
                "pool size mismatch: header says {}, file is {}",
                header.pool_size, self.pool_size
            )));
        }
        if header.chunk_size != CHUNK_SIZE as u64 {
            return Err(Error::invalid("chunk size mismatch with compile-time constant"));
        }
        if header.chunks_per_zone != CHUNKS_PER_ZONE as u32 {
            return Err(Error::invalid("chunks-per-zone mismatch with compile-time constant"));
        }

        // Apply (or discard) any redo log left behind by a crash mid-
        // `split_chunk`, before anything else trusts the chunk headers it
        // would have touched (spec §4.2).
        self.recover_redo_log();

        match header.state() {
            Some(PoolState::Closed) => {
                debug!("pool was cleanly closed, transitioning to OPEN");
                header.set_state(PoolState::Open);
                self.write_header(header);
                self.sync_backups();
            }
            Some(PoolState::Open) | None => {
                warn!("pool was left OPEN, running crash recovery");
                self.recover_info_slots()?;
                header = *self.header();
                header.set_state(PoolState::Open);
                self.write_header(header);
                self.sync_backups();
            }
        }
        self.reclaim_stale_runs();
        Ok(())
    }

    /// Resets every chunk tagged `Run` but not `USED` back to a free
    /// `Base` span, then coalesces adjacent free spans.
    ///
    /// A run chunk's interior occupancy bitmap (spec §4.5) is tracked only
    /// in the volatile [`crate::bucket::Bucket`] state, never written to
    /// the pool file, so on reopen there is no way to know which units
    /// inside a *live* run chunk were occupied. We do not try to guess:
    /// a `Run` chunk whose `USED` flag is still set survived close/crash
    /// recovery as live and is left exactly as-is (its host chunk, and
    /// whatever units a caller still holds pool-offsets into, stay
    /// allocated; [`crate::bucket::Bucket::add_object`] lazily reseeds a
    /// volatile all-occupied bitmap for it the first time something is
    /// freed from it). Only a `Run` chunk that is *not* `USED` — meaning
    /// its last unit was freed but the chunk itself was never handed back
    /// to `Base` before the crash/close — is orphaned and safe to
    /// reclaim.
    fn reclaim_stale_runs(&mut self) {
        for zone in self.zones.clone() {
            let mut idx = 0u32;
            while idx < zone.chunk_count {
                let (span, is_stale_run) = {
                    let header = self.chunk_header(zone.zone_id, idx);
                    (header.size_idx.max(1) as u32, header.kind() == ChunkType::Run && !header.is_used())
                };
                if is_stale_run {
                    let header = self.chunk_header_mut(zone.zone_id, idx);
                    *header = ChunkHeader::new_free(ChunkType::Base, span as u16);
                    self.persist_chunk_header(zone.zone_id, idx);
                }
                idx += span;
            }

            // Coalesce adjacent free spans left behind by the reclaim.
            let mut idx = 0u32;
            while idx < zone.chunk_count {
                let (is_free, span) = {
                    let header = self.chunk_header(zone.zone_id, idx);
                    (!header.is_used() && header.kind() == ChunkType::Base, header.size_idx.max(1) as u32)
                };
                if is_free {
                    let mut merged = span as u16;
                    loop {
                        let next = self.try_merge_next(zone.zone_id, idx, merged);
                        if next == merged {
                            break;
                        }
                        merged = next;
                    }
                    idx += merged as u32;
                } else {
                    idx += span;
                }
            }
        }
    }

    fn format_fresh(&mut self) {
        info!(size = self.pool_size, "formatting fresh pool");
        for i in 0..INFO_SLOT_COUNT {
            let off = INFO_SLOT_TABLE_OFFSET + (i * INFO_SLOT_SIZE) as u64;
            let slot = unsafe { &mut *self.at_mut::<InfoSlot>(off) };
            *slot = InfoSlot::default();
        }
        persist(
            self.at::<u8>(INFO_SLOT_TABLE_OFFSET),
            INFO_SLOT_COUNT * INFO_SLOT_SIZE,
        );

        *self.redo_log_mut() = RedoLog::default();
        persist(self.at::<u8>(REDO_LOG_OFFSET), REDO_LOG_BYTES as usize);

        for zone in self.zones.clone() {
            for chunk_idx in 0..zone.chunk_count {
                let off = zone.chunk_header_offset(chunk_idx);
                let header = unsafe { &mut *self.at_mut::<ChunkHeader>(off) };
                if chunk_idx == 0 {
                    *header = ChunkHeader::new_free(ChunkType::Base, zone.chunk_count as u16);
                } else {
                    // Not live; zeroed is fine, it is never read as a
                    // standalone header while covered by chunk 0's span.
                    *header = ChunkHeader::new_free(ChunkType::Base, 0);
                }
            }
            persist(
                self.at::<u8>(zone.chunk_header_offset(0)),
                zone.chunk_count as usize * std::mem::size_of::<ChunkHeader>(),
            );
        }

        let header = PoolHeader::fresh(self.pool_size, CHUNKS_PER_ZONE as u32);
        self.write_header(header);
        self.sync_backups();

        let mut header = *self.header();
        header.set_state(PoolState::Open);
        self.write_header(header);
        self.sync_backups();
    }

    /// Walks the info-slot table and, for each non-`Unknown` slot,
    /// performs the recovery action for its type (spec §4.4).
    fn recover_info_slots(&mut self) -> Result<()> {
        for idx in 0..INFO_SLOT_COUNT {
            let off = INFO_SLOT_TABLE_OFFSET + (idx * INFO_SLOT_SIZE) as u64;
            let payload = unsafe { (*self.at::<InfoSlot>(off)).payload() };
            if matches!(payload, InfoSlotPayload::Unknown) {
                continue;
            }
            info!(slot = idx, ?payload, "recovering in-flight allocator op");
            self.recover_slot(idx, payload)?;
        }
        Ok(())
    }

    /// Performs the recovery action for one pending slot (spec §4.4):
    /// an `Alloc` never known to have reached the caller is rolled back to
    /// free; a `Free` whose guard was raised but whose chunk mutation
    /// never happened (or never committed) is rolled back to `USED` —
    /// the caller never observed the free as complete, so the chunk must
    /// come back live; a `Realloc` keeps whichever side actually reached
    /// `USED` before the crash and frees the other.
    fn recover_slot(&mut self, idx: usize, payload: InfoSlotPayload) -> Result<()> {
        match payload {
            InfoSlotPayload::Unknown => {}
            InfoSlotPayload::Alloc { offset } => {
                if let Some((zone_id, chunk_idx)) = self.locate(offset) {
                    self.set_used(zone_id, chunk_idx, false);
                }
            }
            InfoSlotPayload::Free { offset } => {
                if let Some((zone_id, chunk_idx)) = self.locate(offset) {
                    self.set_used(zone_id, chunk_idx, true);
                }
            }
            InfoSlotPayload::Realloc { old_offset, new_offset } => {
                let new_committed = self
                    .locate(new_offset)
                    .map(|(z, c)| self.chunk_is_used(z, c))
                    .unwrap_or(false);
                if new_committed {
                    if let Some((zone_id, chunk_idx)) = self.locate(old_offset) {
                        self.set_used(zone_id, chunk_idx, false);
                    }
                } else if let Some((zone_id, chunk_idx)) = self.locate(new_offset) {
                    self.set_used(zone_id, chunk_idx, false);
                }
            }
        }
        self.clear_info_slot(idx);
        Ok(())
    }

    unsafe fn read_pool_offset(&self, offset: u64) -> u64 {
        std::ptr::read(self.at::<u64>(offset))
    }

    unsafe fn write_pool_offset(&mut self, offset: u64, value: u64) {
        let ptr = self.at_mut::<u64>(offset);
        std::ptr::write(ptr, value);
        persist(ptr as *const u8, 8);
    }

    /// Public wrapper for the 8-byte publish `*ptr = value` used by the
    /// frontend for single-word crash-atomic writes (spec §4.6
    /// `set_alloc_ptr`).
    pub fn publish_pointer(&mut self, offset: u64, value: u64) -> Result<()> {
        self.bounds_check(offset, 8)?;
        unsafe { self.write_pool_offset(offset, value) };
        Ok(())
    }

    pub fn read_pointer(&self, offset: u64) -> Result<u64> {
        self.bounds_check(offset, 8)?;
        Ok(unsafe { self.read_pool_offset(offset) })
    }

    fn bounds_check(&self, offset: u64, len: usize) -> Result<()> {
        if offset == 0 {
            return Ok(()); // null is always a valid pool-offset to read/write as "0"
        }
        if offset < FIRST_ZONE_OFFSET || offset + len as u64 > self.pool_size {
            return Err(Error::invalid(format!(
                "pool-offset 0x{:x} (len {}) is out of range",
                offset, len
            )));
        }
        Ok(())
    }

    fn clear_info_slot(&mut self, idx: usize) {
        let off = INFO_SLOT_TABLE_OFFSET + (idx * INFO_SLOT_SIZE) as u64;
        let slot = unsafe { &mut *self.at_mut::<InfoSlot>(off) };
        slot.clear();
        persist(slot as *const InfoSlot as *const u8, INFO_SLOT_SIZE);
    }

    /// Raises an info-slot guard: persists the intent before any chunk
    /// header mutation (spec §4.4 step 1).
    pub fn guard_up(&mut self, arena_id: usize, payload: InfoSlotPayload) {
        let off = INFO_SLOT_TABLE_OFFSET + (arena_id * INFO_SLOT_SIZE) as u64;
        let slot = unsafe { &mut *self.at_mut::<InfoSlot>(off) };
        slot.set(payload);
        persist(slot as *const InfoSlot as *const u8, INFO_SLOT_SIZE);
    }

    /// Lowers an info-slot guard: zero-fills and persists (spec §4.4 step 3).
    pub fn guard_down(&mut self, arena_id: usize) {
        self.clear_info_slot(arena_id);
    }

    pub fn info_slot_kind(&self, arena_id: usize) -> InfoSlotKind {
        let off = INFO_SLOT_TABLE_OFFSET + (arena_id * INFO_SLOT_SIZE) as u64;
        unsafe { (*self.at::<InfoSlot>(off)).kind() }
    }

    fn chunk_header(&self, zone_id: u32, chunk_idx: u32) -> &ChunkHeader {
        let zone = &self.zones[zone_id as usize];
        unsafe { &*self.at::<ChunkHeader>(zone.chunk_header_offset(chunk_idx)) }
    }

    fn chunk_header_mut(&mut self, zone_id: u32, chunk_idx: u32) -> &mut ChunkHeader {
        let off = self.zones[zone_id as usize].chunk_header_offset(chunk_idx);
        unsafe { &mut *self.at_mut::<ChunkHeader>(off) }
    }

    pub fn chunk_size_idx(&self, zone_id: u32, chunk_idx: u32) -> u16 {
        self.chunk_header(zone_id, chunk_idx).size_idx
    }

    pub fn chunk_is_used(&self, zone_id: u32, chunk_idx: u32) -> bool {
        self.chunk_header(zone_id, chunk_idx).is_used()
    }

    pub fn chunk_kind(&self, zone_id: u32, chunk_idx: u32) -> ChunkType {
        self.chunk_header(zone_id, chunk_idx).kind()
    }

    pub fn chunk_header_type_word(&self, zone_id: u32, chunk_idx: u32) -> u32 {
        self.chunk_header(zone_id, chunk_idx).type_word
    }

    pub fn chunk_data_offset(&self, zone_id: u32, chunk_idx: u32) -> u64 {
        self.zones[zone_id as usize].chunk_data_offset(chunk_idx)
    }

    pub fn chunk_data_ptr(&mut self, zone_id: u32, chunk_idx: u32) -> *mut u8 {
        let off = self.chunk_data_offset(zone_id, chunk_idx);
        self.at_mut::<u8>(off)
    }

    pub fn set_used(&mut self, zone_id: u32, chunk_idx: u32, used: bool) {
        let header = self.chunk_header_mut(zone_id, chunk_idx);
        header.set_used(used);
        persist(header as *const ChunkHeader as *const u8, std::mem::size_of::<ChunkHeader>());
    }

    pub fn set_run_type_word(&mut self, zone_id: u32, chunk_idx: u32, type_word: u32) {
        let header = self.chunk_header_mut(zone_id, chunk_idx);
        header.type_word = type_word;
        header.set_kind(ChunkType::Run);
        persist(header as *const ChunkHeader as *const u8, std::mem::size_of::<ChunkHeader>());
    }

    /// Splits a free chunk span of `have` chunks at `(zone_id, chunk_idx)`
    /// into a `need`-chunk span (left) and, if any remainder, a new free
    /// span starting right after it (spec §4.5 `get_object`).
    ///
    /// Both headers are published as one crash-atomic batch through the
    /// shared redo log (spec §4.2, §4.7): this runs before any info-slot
    /// guard is raised around the allocation, so without it a crash
    /// between the two header writes would leave the head shrunk but the
    /// tail still describing the old, now-overlapping span.
    ///
    /// Returns the remainder's `(chunk_idx, size_idx)` if a remainder
    /// exists.
    pub fn split_chunk(
        &mut self,
        zone_id: u32,
        chunk_idx: u32,
        have: u16,
        need: u16,
    ) -> Option<(u32, u16)> {
        debug_assert!(need <= have);
        if need == have {
            return None;
        }
        let remainder_idx = chunk_idx + need as u32;
        let remainder_size = have - need;

        let mut head = *self.chunk_header(zone_id, chunk_idx);
        head.size_idx = need;
        head.set_magic();
        let tail = ChunkHeader::new_free(ChunkType::Base, remainder_size);

        let head_off = self.zones[zone_id as usize].chunk_header_offset(chunk_idx);
        let tail_off = self.zones[zone_id as usize].chunk_header_offset(remainder_idx);
        let head_words: [u64; 2] = unsafe { std::mem::transmute(head) };
        let tail_words: [u64; 2] = unsafe { std::mem::transmute(tail) };

        let entries = [
            RedoEntry::new(head_off, RedoOp::Set, head_words[0]),
            RedoEntry::new(head_off + 8, RedoOp::Set, head_words[1]),
            RedoEntry::new(tail_off, RedoOp::Set, tail_words[0]),
            RedoEntry::new(tail_off + 8, RedoOp::Set, tail_words[1]),
        ];

        let base = self.base_ptr();
        let log = self.redo_log_mut();
        log.store(&entries);
        unsafe { log.process(base) };

        Some((remainder_idx, remainder_size))
    }

    /// Merges chunk `(zone_id, chunk_idx)` (size `size_idx`) with its
    /// immediately following neighbor if that neighbor is free, returning
    /// the new combined `size_idx`. Used both by `pfree`'s coalescing and
    /// by `prealloc`'s in-place growth path (spec §4.7).
    pub fn try_merge_next(&mut self, zone_id: u32, chunk_idx: u32, size_idx: u16) -> u16 {
        let zone_chunk_count = self.zones[zone_id as usize].chunk_count as u32;
        let next_idx = chunk_idx + size_idx as u32;
        if next_idx >= zone_chunk_count {
            return size_idx;
        }
        let next = self.chunk_header(zone_id, next_idx);
        if next.is_used() || !next.magic_valid() {
            return size_idx;
        }
        let combined = size_idx + next.size_idx;
        let head = self.chunk_header_mut(zone_id, chunk_idx);
        head.size_idx = combined;
        self.persist_chunk_header(zone_id, chunk_idx);
        combined
    }

    fn persist_chunk_header(&mut self, zone_id: u32, chunk_idx: u32) {
        let off = self.zones[zone_id as usize].chunk_header_offset(chunk_idx);
        persist(self.at::<u8>(off), std::mem::size_of::<ChunkHeader>());
    }

    pub fn locate(&self, pool_offset: u64) -> Option<(u32, u32)> {
        locate_chunk(&self.zones, pool_offset)
    }

    /// Every free `Base`-kind chunk span in the pool, as `(zone_id,
    /// chunk_idx, size_idx)`. Used once at [`crate::pool::Pool`] open
    /// time to seed the volatile free-list container, since only the
    /// chunk headers themselves are persistent (spec §5).
    pub fn free_spans(&self) -> Vec<(u32, u32, u16)> {
        let mut spans = Vec::new();
        for zone in &self.zones {
            let mut idx = 0u32;
            while idx < zone.chunk_count {
                let header = self.chunk_header(zone.zone_id, idx);
                let span = header.size_idx.max(1) as u32;
                if !header.is_used() && header.kind() == ChunkType::Base {
                    spans.push((zone.zone_id, idx, span as u16));
                }
                idx += span;
            }
        }
        spans
    }

    /// Number of zones with at least one `USED` chunk header, used by the
    /// CTL `stats.heap.active_zones` leaf. Chunk-header granularity is
    /// exact for this purpose regardless of size class, since a zone is
    /// "active" the moment any of its chunks is used at all — unlike
    /// `stats.heap.allocated`/`freed`, which need byte, not chunk,
    /// granularity for sub-chunk ("run") classes and are tracked instead
    /// by [`crate::pool::Pool`] at the unit level (spec §8 S2/S3).
    pub fn active_zones(&self) -> u64 {
        let mut active_zones = 0u64;
        for zone in &self.zones {
            let mut zone_active = false;
            let mut chunk_idx = 0u32;
            while chunk_idx < zone.chunk_count {
                let header = self.chunk_header(zone.zone_id, chunk_idx);
                if header.is_used() {
                    zone_active = true;
                }
                chunk_idx += header.size_idx.max(1) as u32;
            }
            if zone_active {
                active_zones += 1;
            }
        }
        active_zones
    }

    /// Sum of `size_idx * CHUNK_SIZE` across every `USED` chunk header.
    /// Exact for huge allocations; used only to seed [`crate::pool::Pool`]'s
    /// live-byte counter at open time, where it is a coarse upper bound
    /// for any live run chunks still holding one of their host chunk's
    /// units (see DESIGN.md: run-chunk occupancy is not persisted, so the
    /// exact byte count of a pre-existing run allocation cannot be
    /// recovered across a reopen).
    pub fn used_chunk_bytes(&self) -> u64 {
        let mut allocated = 0u64;
        for zone in &self.zones {
            let mut chunk_idx = 0u32;
            while chunk_idx < zone.chunk_count {
                let header = self.chunk_header(zone.zone_id, chunk_idx);
                if header.is_used() {
                    allocated += header.size_idx as u64 * CHUNK_SIZE as u64;
                }
                chunk_idx += header.size_idx.max(1) as u32;
            }
        }
        allocated
    }

    /// Asserts no pending info slots, flips the state word (and its
    /// checksum) to `CLOSED`, and propagates into backups (spec §4.3
    /// `close`).
    pub fn close(&mut self) -> Result<()> {
        for idx in 0..INFO_SLOT_COUNT {
            if self.info_slot_kind(idx) != InfoSlotKind::Unknown {
                debug_assert!(false, "closing pool with outstanding info slot {}", idx);
                return Err(Error::corrupt(format!(
                    "cannot close: info slot {} still pending",
                    idx
                )));
            }
        }
        let mut header = *self.header();
        header.set_state(PoolState::Closed);
        self.write_header(header);
        self.sync_backups();
        self.mmap.flush()?;
        Ok(())
    }
}

/// Verifies an already-mapped pool without taking ownership of it for
/// allocation use — the standalone `check()` entry point (spec §6),
/// reusing the same header-verification path `open` does (SPEC_FULL
/// supplement).
pub fn check_pool(path: &Path) -> Result<()> {
    let backend = Backend::open(path)?;
    backend_consistency_check(&backend)
}

fn backend_consistency_check(backend: &Backend) -> Result<()> {
    let header = backend.header();
    if !header.magic_valid() || !header.checksum_valid() {
        return Err(Error::corrupt("header verification failed"));
    }
    for zone in backend.zones() {
        let mut covered = 0u32;
        while covered < zone.chunk_count {
            let header = backend.chunk_header(zone.zone_id, covered);
            if !header.magic_valid() {
                return Err(Error::corrupt(format!(
                    "zone {} chunk {} missing chunk magic",
                    zone.zone_id, covered
                )));
            }
            let span = header.size_idx.max(1) as u32;
            covered += span;
        }
        if covered != zone.chunk_count {
            return Err(Error::corrupt(format!(
                "zone {} chunk headers do not tile [0, {})",
                zone.zone_id, zone.chunk_count
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_pool_path() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.bin");
        (dir, path)
    }

    #[test]
    fn fresh_create_then_reopen_round_trips() {
        let (_dir, path) = small_pool_path();
        let size = FIRST_ZONE_OFFSET + crate::layout::FULL_ZONE_SIZE;
        {
            let mut backend = Backend::create(&path, size).unwrap();
            backend.close().unwrap();
        }
        let backend = Backend::open(&path).unwrap();
        assert_eq!(backend.pool_size(), size);
        backend_consistency_check(&backend).unwrap();
    }

    #[test]
    fn split_then_merge_restores_single_free_span() {
        let (_dir, path) = small_pool_path();
        let size = FIRST_ZONE_OFFSET + crate::layout::FULL_ZONE_SIZE;
        let mut backend = Backend::create(&path, size).unwrap();

        let total = backend.chunk_size_idx(0, 0);
        let remainder = backend.split_chunk(0, 0, total, 1).unwrap();
        assert_eq!(remainder.0, 1);
        assert_eq!(backend.chunk_size_idx(0, 0), 1);

        backend.set_used(0, 0, true);
        backend.set_used(0, 0, false);
        let merged = backend.try_merge_next(0, 0, 1);
        assert_eq!(merged, total);
    }

    #[test]
    fn corrupt_primary_recovers_from_backup() {
        let (_dir, path) = small_pool_path();
        let size = FIRST_ZONE_OFFSET + crate::layout::FULL_ZONE_SIZE;
        {
            let mut backend = Backend::create(&path, size).unwrap();
            backend.close().unwrap();
        }
        {
            // Corrupt the primary header directly on disk.
            use std::io::{Seek, SeekFrom, Write};
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(0)).unwrap();
            file.write_all(&[0xff; 16]).unwrap();
        }
        let backend = Backend::open(&path).unwrap();
        backend_consistency_check(&backend).unwrap();
    }
}
