//! The CTL dotted-name parameter tree (spec §4.8).
//!
//! `ctl_get`/`ctl_set` split the dotted path into segments and match
//! against a small fixed table of leaves. Leaves are read-only,
//! write-only, or read-write; calling the wrong direction, or naming an
//! unknown path, is `EINVAL` (`Error::Invalid`).

use crate::bucket::HeaderKind;
use crate::error::{Error, Result};
use crate::pool::Pool;

/// The value carried across a CTL call. Leaves interpret this according
/// to their own type; `ctl_get`/`ctl_set` reject a value of the wrong
/// shape for the leaf they target.
#[derive(Debug, Clone, PartialEq)]
pub enum CtlValue {
    U64(u64),
    Str(String),
    Bool(bool),
    /// `heap.alloc_class.map.range`: `(max_size, class_id)`.
    Range(usize, u8),
    /// `heap.alloc_class.<id>.desc` write: `(unit_size, units_per_block,
    /// compact)`. `compact = false` selects `HeaderKind::Minimal`, the
    /// style scenario S3 names.
    ClassDesc(u32, u32, bool),
}

impl CtlValue {
    fn as_u64(&self) -> Result<u64> {
        match self {
            CtlValue::U64(v) => Ok(*v),
            _ => Err(Error::invalid("expected a u64 CTL value")),
        }
    }

    fn as_range(&self) -> Result<(usize, u8)> {
        match self {
            CtlValue::Range(max, id) => Ok((*max, *id)),
            _ => Err(Error::invalid("expected a (max_size, class_id) CTL value")),
        }
    }

    fn as_class_desc(&self) -> Result<(u32, u32, HeaderKind)> {
        match self {
            CtlValue::ClassDesc(unit_size, units_per_block, compact) => {
                let header_kind = if *compact { HeaderKind::Compact } else { HeaderKind::Minimal };
                Ok((*unit_size, *units_per_block, header_kind))
            }
            _ => Err(Error::invalid("expected a (unit_size, units_per_block, header_kind) CTL value")),
        }
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

/// Reads a CTL leaf (spec §4.8 `ctl_get`). Fails on an unknown path or a
/// write-only leaf.
pub fn ctl_get(pool: &Pool, path: &str) -> Result<CtlValue> {
    let segs = segments(path);
    match segs.as_slice() {
        ["stats", "heap", "allocated"] => Ok(CtlValue::U64(pool.stats().allocated)),
        ["stats", "heap", "active_zones"] => Ok(CtlValue::U64(pool.stats().active_zones)),
        ["stats", "heap", "freed"] => Ok(CtlValue::U64(pool.stats().freed)),
        ["heap", "alloc_class", id, "desc"] => {
            let class_id: u8 = id
                .parse()
                .map_err(|_| Error::invalid(format!("malformed alloc_class id '{}'", id)))?;
            let class = pool
                .classes()
                .iter()
                .find(|c| c.id == class_id)
                .ok_or_else(|| Error::invalid(format!("unknown alloc_class id {}", class_id)))?;
            Ok(CtlValue::Str(format!(
                "unit_size={},units_per_block={},header={:?}",
                class.unit_size, class.units_per_block, class.header_kind
            )))
        }
        ["prefault", "at_create"] | ["prefault", "at_open"] => {
            Err(Error::invalid(format!("'{}' is write-only", path)))
        }
        ["debug", "test_recovery"] => Err(Error::invalid("'debug.test_recovery' is write-only")),
        _ => Err(Error::invalid(format!("unknown CTL path '{}'", path))),
    }
}

/// Writes a CTL leaf (spec §4.8 `ctl_set`). Fails on an unknown path or a
/// read-only leaf.
pub fn ctl_set(pool: &Pool, path: &str, value: CtlValue) -> Result<()> {
    let segs = segments(path);
    match segs.as_slice() {
        ["heap", "alloc_class", "reset"] => {
            pool.reset_range_mapping();
            Ok(())
        }
        ["heap", "alloc_class", "map", "range"] => {
            let (max_size, class_id) = value.as_range()?;
            pool.set_range_mapping(max_size, class_id)
        }
        ["heap", "alloc_class", id, "desc"] => {
            let class_id: u8 = id
                .parse()
                .map_err(|_| Error::invalid(format!("malformed alloc_class id '{}'", id)))?;
            let (unit_size, units_per_block, header_kind) = value.as_class_desc()?;
            pool.set_class_desc(class_id, unit_size, units_per_block, header_kind)
        }
        ["prefault", "at_create"] | ["prefault", "at_open"] => {
            // Accepted and ignored: this crate always maps eagerly via
            // `memmap::MmapMut`, so prefault is already the effective
            // behavior regardless of this flag's value.
            let _ = value.as_u64().or_else(|_| match value {
                CtlValue::Bool(b) => Ok(b as u64),
                _ => Err(Error::invalid("expected a bool/u64 CTL value")),
            })?;
            Ok(())
        }
        ["debug", "test_recovery"] => Err(Error::invalid(
            "debug.test_recovery is not wired to a live fault injector in this build",
        )),
        ["stats", ..] => Err(Error::invalid(format!("'{}' is read-only", path))),
        _ => Err(Error::invalid(format!("unknown CTL path '{}'", path))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const POOL_SIZE: u64 = crate::layout::FIRST_ZONE_OFFSET + crate::layout::FULL_ZONE_SIZE;

    fn test_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.bin");
        let pool = Pool::open(&path, POOL_SIZE).unwrap();
        (dir, pool)
    }

    #[test]
    fn unknown_path_is_invalid() {
        let (_dir, pool) = test_pool();
        assert!(ctl_get(&pool, "nonexistent.leaf").is_err());
        assert!(ctl_set(&pool, "nonexistent.leaf", CtlValue::U64(1)).is_err());
    }

    #[test]
    fn read_only_and_write_only_leaves_reject_the_wrong_direction() {
        let (_dir, pool) = test_pool();
        assert!(ctl_set(&pool, "stats.heap.allocated", CtlValue::U64(0)).is_err());
        assert!(ctl_get(&pool, "prefault.at_create").is_err());
    }

    #[test]
    fn alloc_class_desc_reports_registered_classes() {
        let (_dir, pool) = test_pool();
        let desc = ctl_get(&pool, "heap.alloc_class.1.desc").unwrap();
        match desc {
            CtlValue::Str(s) => assert!(s.contains("unit_size=")),
            _ => panic!("expected a string description"),
        }
    }

    #[test]
    fn range_mapping_round_trips_and_resets() {
        let (_dir, pool) = test_pool();
        ctl_set(&pool, "heap.alloc_class.map.range", CtlValue::Range(96, 2)).unwrap();
        let offset = pool.pmalloc(90).unwrap();
        assert_ne!(offset, 0);
        ctl_set(&pool, "heap.alloc_class.reset", CtlValue::Bool(true)).unwrap();
    }

    #[test]
    fn stats_allocated_tracks_pmalloc() {
        let (_dir, pool) = test_pool();
        let before = pool.stats().allocated;
        pool.pmalloc(4096).unwrap();
        let after = pool.stats().allocated;
        assert!(after > before);
    }
}
