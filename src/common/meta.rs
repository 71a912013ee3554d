//! The meta record: a fixed-size, versioned snapshot of the database's
//! root bucket, freelist location, high water mark, and transaction id.
//! Two copies live at page 0 and page 1; recovery picks whichever
//! validates and carries the higher `txid` (spec.md §4.2).

use std::mem;
use std::{fmt, hash::Hasher};

use bytemuck::{Pod, Zeroable};
use fnv::FnvHasher;

use crate::common::bucket::InBucket;
use crate::common::page::PgId;
use crate::common::types::{TxId, MAGIC, PGID_NO_FREELIST, VERSION};
use crate::errors::{Error, Result};

use super::page::OwnedPage;

/// Meta record size, in bytes.
pub(crate) const META_PAGE_SIZE: usize = mem::size_of::<Meta>();

/// Byte offset of the `checksum` field, i.e. the length of the prefix
/// the checksum itself is computed over.
const CHECKSUM_OFFSET: usize = META_PAGE_SIZE - mem::size_of::<u64>();

#[derive(Debug, Default, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct Meta {
    magic: u32,
    version: u32,
    /// u32 so the on-disk format stays the same across 32/64-bit hosts.
    page_size: u32,
    flags: u32,
    root: InBucket,
    freelist: PgId,
    /// High water mark: one past the highest pgid ever allocated.
    pgid: PgId,
    txid: TxId,
    checksum: u64,
}

impl Meta {
    pub(crate) fn decode(buf: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&buf[..META_PAGE_SIZE])
    }

    pub(crate) fn encode(&self) -> [u8; META_PAGE_SIZE] {
        let mut out = [0u8; META_PAGE_SIZE];
        out.copy_from_slice(bytemuck::bytes_of(self));
        out
    }

    /// Checks the magic/version markers and, if a checksum was
    /// written, that it still matches.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            Err(Error::Invalid)
        } else if self.version != VERSION {
            Err(Error::VersionMismatch)
        } else if self.checksum != 0 && self.checksum != self.sum64() {
            Err(Error::Checksum)
        } else {
            Ok(())
        }
    }

    /// Writes the meta onto the given page buffer (which must already
    /// be the right page: id `txid % 2`, `META_PAGE` flag).
    pub(crate) fn write(&mut self, p: &mut OwnedPage) {
        assert!(
            self.root.root_page() < self.pgid,
            "root bucket pgid ({}) above high water mark ({})",
            self.root.root_page(),
            self.pgid
        );
        assert!(
            self.freelist < self.pgid || self.freelist == PGID_NO_FREELIST,
            "freelist pgid ({}) above high water mark ({})",
            self.freelist,
            self.pgid
        );

        self.checksum = self.sum64();
        p.write_meta(self);
    }

    /// FNV-1a 64-bit checksum over every field preceding `checksum`
    /// itself.
    pub(crate) fn sum64(&self) -> u64 {
        let mut h = FnvHasher::default();
        h.write(&self.encode()[..CHECKSUM_OFFSET]);
        h.finish()
    }

    pub(crate) fn magic(&self) -> u32 {
        self.magic
    }

    pub(crate) fn version(&self) -> u32 {
        self.version
    }

    pub(crate) fn page_size(&self) -> u32 {
        self.page_size
    }

    pub(crate) fn flags(&self) -> u32 {
        self.flags
    }

    pub(crate) fn root_bucket(&self) -> InBucket {
        self.root
    }

    pub(crate) fn freelist(&self) -> PgId {
        self.freelist
    }

    pub(crate) fn pgid(&self) -> PgId {
        self.pgid
    }

    pub(crate) fn txid(&self) -> TxId {
        self.txid
    }

    pub(crate) fn checksum(&self) -> u64 {
        self.checksum
    }

    pub(crate) fn set_magic(&mut self, v: u32) {
        self.magic = v;
    }

    pub(crate) fn set_version(&mut self, v: u32) {
        self.version = v;
    }

    pub(crate) fn set_page_size(&mut self, v: u32) {
        self.page_size = v;
    }

    pub(crate) fn set_flags(&mut self, v: u32) {
        self.flags = v;
    }

    pub(crate) fn set_root_bucket(&mut self, b: InBucket) {
        self.root = b;
    }

    pub(crate) fn set_freelist(&mut self, v: PgId) {
        self.freelist = v;
    }

    pub(crate) fn set_pgid(&mut self, id: PgId) {
        self.pgid = id;
    }

    pub(crate) fn set_txid(&mut self, id: TxId) {
        self.txid = id;
    }

    pub(crate) fn inc_txid(&mut self) {
        self.txid += 1;
    }

    pub(crate) fn copy(&self, dest: &mut Meta) {
        *dest = *self;
    }

    pub(crate) fn is_freelist_persisted(&self) -> bool {
        self.freelist != PGID_NO_FREELIST
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Meta {{ version: {}, page_size: {} bytes, flags: 0x{:08x}, root: <pgid={}>, freelist: <pgid={}>, hwm: <pgid={}>, txid: {}, checksum: 0x{:016x} }}",
            self.version,
            self.page_size,
            self.flags,
            self.root.root_page(),
            self.freelist,
            self.pgid,
            self.txid,
            self.checksum
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::page::{OwnedPage, PageFlags};
    use crate::common::types::DEFAULT_PAGE_SIZE;

    fn sample_meta() -> Meta {
        Meta {
            magic: MAGIC,
            version: VERSION,
            page_size: *DEFAULT_PAGE_SIZE as u32,
            flags: 0,
            root: InBucket::default(),
            freelist: 5,
            pgid: 10,
            txid: 2,
            checksum: 0,
        }
    }

    #[test]
    fn write_then_validate_round_trips() {
        let mut meta = sample_meta();
        let mut page = OwnedPage::new(*DEFAULT_PAGE_SIZE);
        page.set_id(meta.txid % 2);
        page.set_flags(PageFlags::META_PAGE);
        meta.write(&mut page);

        assert!(meta.validate().is_ok());
        assert_eq!(meta.pgid(), 10);
        assert!(page.as_page().is_meta_page());
        assert_eq!(page.as_page().meta().pgid(), 10);
    }

    #[test]
    fn tampered_checksum_fails_validation() {
        let mut meta = sample_meta();
        let mut page = OwnedPage::new(*DEFAULT_PAGE_SIZE);
        meta.write(&mut page);

        let mut corrupted = page.as_page().meta();
        corrupted.set_pgid(999);
        assert!(matches!(corrupted.validate(), Err(Error::Checksum)));
    }

    #[test]
    fn wrong_magic_is_invalid() {
        let mut meta = sample_meta();
        meta.set_magic(0xDEADBEEF);
        assert!(matches!(meta.validate(), Err(Error::Invalid)));
    }

    #[test]
    fn wrong_version_mismatches() {
        let mut meta = sample_meta();
        meta.set_version(VERSION + 1);
        assert!(matches!(meta.validate(), Err(Error::VersionMismatch)));
    }
}
