//! Bit-exact on-media layout (spec §6).
//!
//! ```text
//! 0         Primary pool header (1024 B)
//! 1024      Info-slot table (1024 * 32 B = 32 KiB)
//! 33 KiB    Redo log (one cacheline-aligned `RedoLog`, spec §4.2)
//! ~33 KiB   First zone: backup header (1024 B)
//!                      + 65535 chunk headers (16 B each)
//!                      + 65535 chunk data areas (256 KiB each)
//! ...       Additional zones, identical layout; the last zone may be short
//! ```
//!
//! The redo log's home is not named by the spec's own byte table (which
//! predates the §4.2 redo-log requirement); it is carved out of the gap
//! between the info-slot table and the first zone, keeping every other
//! offset in the table symbolic rather than hardcoded (see DESIGN.md).
//!
//! Every struct here is `#[repr(C)]` and every field is a fixed-width
//! integer or byte array so that `size_of` matches the spec's byte counts
//! exactly (tested below) and the layout is endianness-explicit: all
//! multi-byte fields are read/written in native endianness consistently by
//! both halves of the same process, which is all the spec requires (there
//! is no cross-architecture portability goal here).

use crate::ll::checksum64;

/// Size of the primary/backup pool header, in bytes.
pub const POOL_HEADER_SIZE: usize = 1024;
/// Size of one info slot, in bytes.
pub const INFO_SLOT_SIZE: usize = 32;
/// Number of info slots in the table (bounds the arena count, spec §4.6).
pub const INFO_SLOT_COUNT: usize = 1024;
/// Size of the info-slot table, in bytes.
pub const INFO_SLOT_TABLE_SIZE: usize = INFO_SLOT_SIZE * INFO_SLOT_COUNT;
/// Size of one chunk header, in bytes.
pub const CHUNK_HEADER_SIZE: usize = 16;
/// Size of one chunk's data area, in bytes (256 KiB, compile-time constant).
pub const CHUNK_SIZE: usize = 256 * 1024;
/// Maximum number of chunks in one zone.
pub const CHUNKS_PER_ZONE: usize = 65535;
/// Minimum total pool size accepted by `open`/`format`.
pub const MIN_POOL_SIZE: u64 = 2 * 1024 * 1024;
/// Zones shorter than this (the final, possibly-truncated zone) are rejected.
pub const MIN_ZONE_SIZE: u64 = 32 * CHUNK_SIZE as u64;

/// Offset of the info-slot table from the pool base.
pub const INFO_SLOT_TABLE_OFFSET: u64 = POOL_HEADER_SIZE as u64;
/// Offset of the allocator's single shared redo log (spec §4.2), placed
/// right after the info-slot table.
pub const REDO_LOG_OFFSET: u64 = INFO_SLOT_TABLE_OFFSET + INFO_SLOT_TABLE_SIZE as u64;
/// Size of the redo-log region, in bytes (the cacheline-aligned
/// [`crate::redo::RedoLog`] struct's actual size, padding included).
pub const REDO_LOG_BYTES: u64 = std::mem::size_of::<crate::redo::RedoLog>() as u64;
/// Offset of the first zone from the pool base ("33 KiB" in spec §6).
pub const FIRST_ZONE_OFFSET: u64 = REDO_LOG_OFFSET + REDO_LOG_BYTES;

/// Metadata (backup header + chunk header array) size of one full zone.
pub const ZONE_METADATA_SIZE: u64 =
    POOL_HEADER_SIZE as u64 + (CHUNK_HEADER_SIZE * CHUNKS_PER_ZONE) as u64;
/// Total size (metadata + chunk data) of one full zone.
pub const FULL_ZONE_SIZE: u64 = ZONE_METADATA_SIZE + (CHUNK_SIZE * CHUNKS_PER_ZONE) as u64;

/// 16-byte magic signature identifying a formatted pool header.
pub const POOL_MAGIC: [u8; 16] = *b"PMALLOC_POOL_HDR";
/// Magic word identifying a live chunk header.
pub const CHUNK_MAGIC: u32 = 0x504D_4348; // "PMCH"

/// Pool lifecycle state, recorded in the header and mirrored in backups.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Closed = 0,
    Open = 1,
}

impl PoolState {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(PoolState::Closed),
            1 => Some(PoolState::Open),
            _ => None,
        }
    }
}

/// The on-disk pool header. One primary copy lives at offset 0; one backup
/// copy lives at the start of every zone (spec invariant 3: "the primary
/// header or at least one backup header has a valid checksum").
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PoolHeader {
    pub magic: [u8; 16],
    pub flags: u64,
    pub state: u32,
    pub major: u16,
    pub minor: u16,
    pub pool_size: u64,
    pub chunk_size: u64,
    pub chunks_per_zone: u32,
    reserved: [u8; 964],
    pub checksum: u64,
}

const _: () = assert_pool_header_size();
const fn assert_pool_header_size() {
    if std::mem::size_of::<PoolHeader>() != POOL_HEADER_SIZE {
        panic!("PoolHeader must be exactly POOL_HEADER_SIZE bytes");
    }
}

/// Current on-disk format version. Bumping `MAJOR` is a breaking layout
/// change; `open` rejects a pool whose major version differs (spec §4.3.2).
pub const FORMAT_MAJOR: u16 = 1;
pub const FORMAT_MINOR: u16 = 0;

impl PoolHeader {
    pub fn fresh(pool_size: u64, chunks_per_zone: u32) -> Self {
        let mut h = PoolHeader {
            magic: POOL_MAGIC,
            flags: 0,
            state: PoolState::Closed as u32,
            major: FORMAT_MAJOR,
            minor: FORMAT_MINOR,
            pool_size,
            chunk_size: CHUNK_SIZE as u64,
            chunks_per_zone,
            reserved: [0; 964],
            checksum: 0,
        };
        h.recompute_checksum();
        h
    }

    /// Bytes of `self` with the checksum field zeroed, for (re)computing
    /// or verifying the checksum. Invariant 3 requires every checksummed
    /// struct to exclude its own checksum field from the sum.
    fn checksum_bytes(&self) -> Vec<u8> {
        let mut copy = *self;
        copy.checksum = 0;
        let ptr = &copy as *const PoolHeader as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, POOL_HEADER_SIZE).to_vec() }
    }

    pub fn recompute_checksum(&mut self) {
        self.checksum = checksum64(&self.checksum_bytes());
    }

    pub fn checksum_valid(&self) -> bool {
        checksum64(&self.checksum_bytes()) == self.checksum
    }

    pub fn magic_valid(&self) -> bool {
        self.magic == POOL_MAGIC
    }

    pub fn state(&self) -> Option<PoolState> {
        PoolState::from_u32(self.state)
    }

    pub fn set_state(&mut self, state: PoolState) {
        self.state = state as u32;
        self.recompute_checksum();
    }
}

/// Tag discriminating the payload of an [`InfoSlot`] (spec §3, §4.4).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoSlotKind {
    Unknown = 0,
    Alloc = 1,
    Realloc = 2,
    Free = 3,
}

impl InfoSlotKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(InfoSlotKind::Unknown),
            1 => Some(InfoSlotKind::Alloc),
            2 => Some(InfoSlotKind::Realloc),
            3 => Some(InfoSlotKind::Free),
            _ => None,
        }
    }
}

/// One 32-byte persistent crash-recovery record, indexed by arena id.
///
/// The spec's own "Design notes" (§9) call for replacing the source's
/// `char data[28]` union overlay with a tagged sum type marshalled to a
/// fixed 32-byte layout. We keep the on-media shape (`kind` tag + two
/// `u64` payload words) and expose a typed [`InfoSlotPayload`] view over
/// it rather than overlaying an actual Rust union, so every access goes
/// through an explicit, checked conversion.
///
/// There is no above-allocator root/transaction layer in this crate's
/// scope, so a slot never names a persistent pointer *variable* to patch
/// up — it names the chunk(s) the in-flight operation touched, and
/// recovery's only job is to decide whether that touch should be kept or
/// undone.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct InfoSlot {
    kind: u8,
    _pad: [u8; 7],
    /// `ALLOC`: pool-offset just marked `USED`. `FREE`: pool-offset being
    /// marked free. `REALLOC`: the new (candidate) pool-offset.
    primary: u64,
    /// `REALLOC` only: the old pool-offset being superseded.
    secondary: u64,
    _reserved: [u8; 8],
}

const _: () = assert_info_slot_size();
const fn assert_info_slot_size() {
    if std::mem::size_of::<InfoSlot>() != INFO_SLOT_SIZE {
        panic!("InfoSlot must be exactly INFO_SLOT_SIZE bytes");
    }
}

/// Typed view over an [`InfoSlot`]'s payload (spec §9 tagged sum type).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoSlotPayload {
    Unknown,
    /// A chunk was just marked `USED`; not yet known to have reached the
    /// caller.
    Alloc { offset: u64 },
    /// A chunk is being marked free.
    Free { offset: u64 },
    /// `new_offset` is a candidate replacement for `old_offset`; which
    /// one survives depends on whether `new_offset`'s chunk reached
    /// `USED` before the crash.
    Realloc { old_offset: u64, new_offset: u64 },
}

impl Default for InfoSlot {
    fn default() -> Self {
        InfoSlot {
            kind: InfoSlotKind::Unknown as u8,
            _pad: [0; 7],
            primary: 0,
            secondary: 0,
            _reserved: [0; 8],
        }
    }
}

impl InfoSlot {
    pub fn kind(&self) -> InfoSlotKind {
        InfoSlotKind::from_u8(self.kind).unwrap_or(InfoSlotKind::Unknown)
    }

    pub fn payload(&self) -> InfoSlotPayload {
        match self.kind() {
            InfoSlotKind::Unknown => InfoSlotPayload::Unknown,
            InfoSlotKind::Alloc => InfoSlotPayload::Alloc { offset: self.primary },
            InfoSlotKind::Realloc => InfoSlotPayload::Realloc {
                new_offset: self.primary,
                old_offset: self.secondary,
            },
            InfoSlotKind::Free => InfoSlotPayload::Free { offset: self.primary },
        }
    }

    pub fn set(&mut self, payload: InfoSlotPayload) {
        match payload {
            InfoSlotPayload::Unknown => {
                *self = InfoSlot::default();
            }
            InfoSlotPayload::Alloc { offset } => {
                self.kind = InfoSlotKind::Alloc as u8;
                self.primary = offset;
                self.secondary = 0;
            }
            InfoSlotPayload::Realloc { old_offset, new_offset } => {
                self.kind = InfoSlotKind::Realloc as u8;
                self.primary = new_offset;
                self.secondary = old_offset;
            }
            InfoSlotPayload::Free { offset } => {
                self.kind = InfoSlotKind::Free as u8;
                self.primary = offset;
                self.secondary = 0;
            }
        }
    }

    pub fn clear(&mut self) {
        *self = InfoSlot::default();
    }

    pub fn is_pending(&self) -> bool {
        self.kind() != InfoSlotKind::Unknown
    }
}

/// Chunk content kind (spec §3).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    /// A chunk (or run of chunks) serving one "huge" allocation directly.
    Base = 0,
    /// A chunk subdivided into fixed-size units by a bitmap, one size
    /// class per run.
    Run = 1,
    /// Raw bitmap metadata chunk (reserved for future use by the CTL
    /// allocation-class machinery; currently chunks use `Run` for
    /// bitmap-subdivided allocations and carry the bitmap inline).
    Bitmap = 2,
}

impl ChunkType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ChunkType::Base),
            1 => Some(ChunkType::Run),
            2 => Some(ChunkType::Bitmap),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Chunk header flags (spec §3).
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ChunkFlags: u8 {
        /// The chunk is currently handed out to a caller.
        const USED = 0b0000_0001;
        /// The chunk's data area is known to be zero-filled.
        const ZEROED = 0b0000_0010;
    }
}

/// A 16-byte chunk header. Only the first header of a multi-chunk span is
/// "live"; the following `size_idx - 1` headers are implicitly covered
/// (spec §3, chunk header invariants 1–2).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ChunkHeader {
    magic: u32,
    /// Type-specific word: for `Run` chunks, the size-class id the run is
    /// subdivided for; unused (zero) for `Base` chunks.
    pub type_word: u32,
    kind: u8,
    flags: u8,
    pub size_idx: u16,
    _reserved: [u8; 4],
}

const _: () = assert_chunk_header_size();
const fn assert_chunk_header_size() {
    if std::mem::size_of::<ChunkHeader>() != CHUNK_HEADER_SIZE {
        panic!("ChunkHeader must be exactly CHUNK_HEADER_SIZE bytes");
    }
}

impl ChunkHeader {
    pub fn new_free(kind: ChunkType, size_idx: u16) -> Self {
        ChunkHeader {
            magic: CHUNK_MAGIC,
            type_word: 0,
            kind: kind as u8,
            flags: 0,
            size_idx,
            _reserved: [0; 4],
        }
    }

    pub fn magic_valid(&self) -> bool {
        self.magic == CHUNK_MAGIC
    }

    pub fn set_magic(&mut self) {
        self.magic = CHUNK_MAGIC;
    }

    pub fn kind(&self) -> ChunkType {
        ChunkType::from_u8(self.kind).unwrap_or(ChunkType::Base)
    }

    pub fn set_kind(&mut self, kind: ChunkType) {
        self.kind = kind as u8;
    }

    pub fn flags(&self) -> ChunkFlags {
        ChunkFlags::from_bits_truncate(self.flags)
    }

    pub fn is_used(&self) -> bool {
        self.flags().contains(ChunkFlags::USED)
    }

    pub fn set_used(&mut self, used: bool) {
        let mut f = self.flags();
        f.set(ChunkFlags::USED, used);
        self.flags = f.bits();
    }

    pub fn is_zeroed(&self) -> bool {
        self.flags().contains(ChunkFlags::ZEROED)
    }

    pub fn set_zeroed(&mut self, zeroed: bool) {
        let mut f = self.flags();
        f.set(ChunkFlags::ZEROED, zeroed);
        self.flags = f.bits();
    }
}

/// Geometry of one zone: how many chunks it holds and where its metadata
/// and data regions sit relative to the pool base.
#[derive(Debug, Clone, Copy)]
pub struct ZoneGeometry {
    pub zone_id: u32,
    pub base_offset: u64,
    pub chunk_count: u32,
}

impl ZoneGeometry {
    pub fn backup_header_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn chunk_header_offset(&self, chunk_idx: u32) -> u64 {
        self.base_offset
            + POOL_HEADER_SIZE as u64
            + chunk_idx as u64 * CHUNK_HEADER_SIZE as u64
    }

    pub fn chunk_headers_end(&self) -> u64 {
        self.base_offset + POOL_HEADER_SIZE as u64 + self.chunk_count as u64 * CHUNK_HEADER_SIZE as u64
    }

    pub fn chunk_data_offset(&self, chunk_idx: u32) -> u64 {
        self.chunk_headers_end() + chunk_idx as u64 * CHUNK_SIZE as u64
    }

    pub fn total_size(&self) -> u64 {
        POOL_HEADER_SIZE as u64 + self.chunk_count as u64 * (CHUNK_HEADER_SIZE as u64 + CHUNK_SIZE as u64)
    }
}

/// Computes the geometry of every zone that fits (fully or partially) in a
/// pool of `pool_size` bytes.
pub fn zones_for_pool_size(pool_size: u64) -> Vec<ZoneGeometry> {
    let mut zones = Vec::new();
    let mut offset = FIRST_ZONE_OFFSET;
    let mut zone_id = 0u32;
    while offset < pool_size {
        let remaining = pool_size - offset;
        let chunk_count = if remaining >= FULL_ZONE_SIZE {
            CHUNKS_PER_ZONE as u32
        } else {
            // Short trailing zone: solve for how many whole
            // (header + data) chunk slots fit after the backup header.
            let remaining_after_header = remaining.saturating_sub(POOL_HEADER_SIZE as u64);
            let per_chunk = (CHUNK_HEADER_SIZE + CHUNK_SIZE) as u64;
            (remaining_after_header / per_chunk) as u32
        };
        if chunk_count == 0 {
            break;
        }
        let geom = ZoneGeometry {
            zone_id,
            base_offset: offset,
            chunk_count,
        };
        offset += geom.total_size();
        zones.push(geom);
        zone_id += 1;
    }
    zones
}

/// Given a pool-offset inside some chunk's data area, returns
/// `(zone_id, chunk_idx)` by pure arithmetic on the fixed layout constants
/// (spec §4.3, "Chunk-by-offset": deterministic, no metadata read
/// required) — as long as the caller supplies the zone list (which is
/// itself derived purely from `pool_size`, not from disk contents).
pub fn locate_chunk(zones: &[ZoneGeometry], pool_offset: u64) -> Option<(u32, u32)> {
    for zone in zones {
        let data_start = zone.chunk_data_offset(0);
        let data_end = zone.chunk_data_offset(zone.chunk_count);
        if pool_offset >= data_start && pool_offset < data_end {
            let chunk_idx = ((pool_offset - data_start) / CHUNK_SIZE as u64) as u32;
            return Some((zone.zone_id, chunk_idx));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_spec() {
        assert_eq!(std::mem::size_of::<PoolHeader>(), 1024);
        assert_eq!(std::mem::size_of::<InfoSlot>(), 32);
        assert_eq!(std::mem::size_of::<ChunkHeader>(), 16);
    }

    #[test]
    fn magic_is_recognized_16_byte_string() {
        assert_eq!(POOL_MAGIC.len(), 16);
        let h = PoolHeader::fresh(64 * 1024 * 1024, CHUNKS_PER_ZONE as u32);
        assert!(h.magic_valid());
    }

    #[test]
    fn header_checksum_roundtrips() {
        let mut h = PoolHeader::fresh(64 * 1024 * 1024, CHUNKS_PER_ZONE as u32);
        assert!(h.checksum_valid());
        h.set_state(PoolState::Open);
        assert!(h.checksum_valid());
        h.pool_size += 1; // simulate corruption without recomputing checksum
        assert!(!h.checksum_valid());
    }

    #[test]
    fn info_slot_payload_roundtrips() {
        let mut slot = InfoSlot::default();
        assert_eq!(slot.payload(), InfoSlotPayload::Unknown);

        slot.set(InfoSlotPayload::Alloc { offset: 0x1000 });
        assert_eq!(slot.kind(), InfoSlotKind::Alloc);
        assert_eq!(slot.payload(), InfoSlotPayload::Alloc { offset: 0x1000 });

        slot.set(InfoSlotPayload::Realloc { old_offset: 0x1000, new_offset: 0x2000 });
        assert_eq!(
            slot.payload(),
            InfoSlotPayload::Realloc { old_offset: 0x1000, new_offset: 0x2000 }
        );

        slot.clear();
        assert!(!slot.is_pending());
    }

    #[test]
    fn single_zone_geometry_matches_first_zone_offset() {
        let pool_size = FIRST_ZONE_OFFSET + FULL_ZONE_SIZE;
        let zones = zones_for_pool_size(pool_size);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].base_offset, FIRST_ZONE_OFFSET);
        assert_eq!(zones[0].chunk_count, CHUNKS_PER_ZONE as u32);
    }

    #[test]
    fn trailing_short_zone_has_fewer_chunks() {
        let pool_size = FIRST_ZONE_OFFSET + FULL_ZONE_SIZE + MIN_ZONE_SIZE;
        let zones = zones_for_pool_size(pool_size);
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].chunk_count, CHUNKS_PER_ZONE as u32);
        assert!(zones[1].chunk_count > 0);
        assert!(zones[1].chunk_count < CHUNKS_PER_ZONE as u32);
    }

    #[test]
    fn locate_chunk_is_consistent_with_geometry() {
        let pool_size = FIRST_ZONE_OFFSET + FULL_ZONE_SIZE;
        let zones = zones_for_pool_size(pool_size);
        let off = zones[0].chunk_data_offset(42) + 10;
        let (zone_id, chunk_idx) = locate_chunk(&zones, off).unwrap();
        assert_eq!(zone_id, 0);
        assert_eq!(chunk_idx, 42);
    }
}
