//!
//! Format-wide constants and the default type declarations used across the
//! engine.
//!
use once_cell::sync::Lazy;
use std::time::Duration;

use crate::common::page::PgId;

// MaxMmapStep is the largest step that can be taken when remapping the mmap.
pub(crate) const MAX_MMAP_STEP: usize = 1 << 30; // 1GB

// Version represents the data file format version.
pub(crate) const VERSION: u32 = 2;

// Magic represents a marker value to indicate that a file is a barrowdb database.
pub(crate) const MAGIC: u32 = 0xED0CDAED;

// Sentinel meaning "the freelist was not persisted"; used when
// Options::no_freelist_sync is set and the freelist is rebuilt by scan.
pub(crate) const PGID_NO_FREELIST: PgId = 0xFFFFFFFFFFFFFFFF;

// DO NOT EDIT. Copied from the "bolt" lineage.
pub(crate) const PAGE_MAX_ALLOC_SIZE: usize = 0xFFFFFFF;

// IgnoreNoSync specifies whether the NoSync field of a DB is ignored when
// syncing changes to a file. This is required as some operating systems,
// such as OpenBSD, do not have a unified buffer cache (UBC) and writes
// must be synchronized using the msync(2) syscall.
pub(crate) const IGNORE_NO_SYNC: bool = cfg!(target_os = "openbsd");

// Default values if not set in a DB instance.
pub(crate) const DEFAULT_MAX_BATCH_SIZE: usize = 1000;
pub(crate) const DEFAULT_MAX_BATCH_DELAY: Duration = Duration::from_millis(10);
pub(crate) const DEFAULT_ALLOC_SIZE: usize = 16 * 1024 * 1024;

// DefaultPageSize is the default page size for db which is set to the OS page size.
pub(crate) static DEFAULT_PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

// Txid represents the internal transaction identifier.
pub(crate) type TxId = u64;

pub type Byte = u8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_positive() {
        assert!(*DEFAULT_PAGE_SIZE > 0);
    }

    #[test]
    fn magic_and_version_are_stable() {
        assert_eq!(MAGIC, 0xED0CDAED);
        assert_eq!(VERSION, 2);
    }
}
