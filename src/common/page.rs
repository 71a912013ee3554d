//! On-disk page layout.
//!
//! Pages are never reinterpreted by casting a raw mmap pointer to a typed
//! struct. Every on-disk shape (`PageHeader`, `LeafPageElement`,
//! `BranchPageElement`) is a `bytemuck::Pod` value decoded out of a `&[u8]`
//! with bounds-checked reads; the byte slice itself carries the mmap's
//! borrow, so a decoded view cannot outlive the bytes it came from.

use std::fmt::{self, Display, Formatter};
use std::mem;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::meta::{Meta, META_PAGE_SIZE};

/// Page id.
pub(crate) type PgId = u64;

/// Page header size, in bytes.
pub(crate) const PAGE_HEADER_SIZE: usize = mem::size_of::<PageHeader>();

pub(crate) const MIN_KEYS_PER_PAGE: usize = 2;

/// BranchPageElement size.
pub(crate) const BRANCH_PAGE_ELEMENT_SIZE: usize = mem::size_of::<BranchPageElement>();

/// LeafPageElement size.
pub(crate) const LEAF_PAGE_ELEMENT_SIZE: usize = mem::size_of::<LeafPageElement>();

/// PgId size, in bytes.
pub(crate) const PGID_SIZE: usize = mem::size_of::<PgId>();

bitflags! {
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub struct PageFlags: u16 {
        const BRANCH_PAGE = 0x01;
        const LEAF_PAGE = 0x02;
        const META_PAGE = 0x04;
        const FREELIST_PAGE = 0x10;
    }
}

impl Display for PageFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:0x}", self.bits())
    }
}

pub(crate) const BUCKET_LEAF_FLAG: u32 = 0x01;

/// The fixed header every page begins with:
/// `|id(u64)|flags(u16)|count(u16)|overflow(u32)|`.
#[derive(Debug, Default, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct PageHeader {
    pub(crate) id: PgId,
    pub(crate) flags: u16,
    pub(crate) count: u16,
    pub(crate) overflow: u32,
}

impl PageHeader {
    pub(crate) fn page_flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags)
    }
}

/// A routing entry on a branch page: `{pos, ksize, pgid}`.
#[derive(Debug, Default, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct BranchPageElement {
    pub(crate) pos: u32,
    pub(crate) ksize: u32,
    pub(crate) pgid: PgId,
}

/// A node on a leaf page: `{flags, pos, ksize, vsize}`.
#[derive(Debug, Default, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct LeafPageElement {
    pub(crate) flags: u32,
    pub(crate) pos: u32,
    pub(crate) ksize: u32,
    pub(crate) vsize: u32,
}

impl LeafPageElement {
    pub(crate) fn is_bucket_entry(&self) -> bool {
        (self.flags & BUCKET_LEAF_FLAG) != 0
    }
}

/// A read-only, byte-slice-backed view over one page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Page<'a> {
    buf: &'a [u8],
}

impl<'a> Page<'a> {
    /// Wraps a byte slice as a page view. `buf` must be at least
    /// `PAGE_HEADER_SIZE` bytes.
    pub(crate) fn from_buf(buf: &'a [u8]) -> Self {
        debug_assert!(buf.len() >= PAGE_HEADER_SIZE);
        Page { buf }
    }

    pub(crate) fn header(&self) -> PageHeader {
        bytemuck::pod_read_unaligned(&self.buf[..PAGE_HEADER_SIZE])
    }

    pub(crate) fn id(&self) -> PgId {
        self.header().id
    }

    pub(crate) fn flags(&self) -> PageFlags {
        self.header().page_flags()
    }

    pub(crate) fn count(&self) -> usize {
        self.header().count as usize
    }

    pub(crate) fn overflow(&self) -> u32 {
        self.header().overflow
    }

    pub(crate) fn is_branch_page(&self) -> bool {
        self.flags().contains(PageFlags::BRANCH_PAGE)
    }

    pub(crate) fn is_leaf_page(&self) -> bool {
        self.flags().contains(PageFlags::LEAF_PAGE)
    }

    pub(crate) fn is_meta_page(&self) -> bool {
        self.flags().contains(PageFlags::META_PAGE)
    }

    pub(crate) fn is_freelist_page(&self) -> bool {
        self.flags().contains(PageFlags::FREELIST_PAGE)
    }

    pub(crate) fn typ(&self) -> &'static str {
        if self.is_branch_page() {
            "branch"
        } else if self.is_leaf_page() {
            "leaf"
        } else if self.is_meta_page() {
            "meta"
        } else if self.is_freelist_page() {
            "freelist"
        } else {
            "unknown"
        }
    }

    fn data_offset(&self) -> usize {
        PAGE_HEADER_SIZE
    }

    pub(crate) fn meta(&self) -> Meta {
        let off = self.data_offset();
        Meta::decode(&self.buf[off..off + META_PAGE_SIZE])
    }

    pub(crate) fn leaf_element(&self, index: usize) -> LeafPageElement {
        assert!(index < self.count(), "leaf element index out of bounds");
        let off = self.data_offset() + index * LEAF_PAGE_ELEMENT_SIZE;
        bytemuck::pod_read_unaligned(&self.buf[off..off + LEAF_PAGE_ELEMENT_SIZE])
    }

    pub(crate) fn branch_element(&self, index: usize) -> BranchPageElement {
        assert!(index < self.count(), "branch element index out of bounds");
        let off = self.data_offset() + index * BRANCH_PAGE_ELEMENT_SIZE;
        bytemuck::pod_read_unaligned(&self.buf[off..off + BRANCH_PAGE_ELEMENT_SIZE])
    }

    /// Key bytes for a leaf element. `pos` is relative to the start of
    /// that element's slot in the element array, matching the wire
    /// format used by the rest of the bbolt lineage.
    pub(crate) fn leaf_key(&self, index: usize) -> &'a [u8] {
        let elem = self.leaf_element(index);
        let elem_off = self.data_offset() + index * LEAF_PAGE_ELEMENT_SIZE;
        let start = elem_off + elem.pos as usize;
        &self.buf[start..start + elem.ksize as usize]
    }

    pub(crate) fn leaf_value(&self, index: usize) -> &'a [u8] {
        let elem = self.leaf_element(index);
        let elem_off = self.data_offset() + index * LEAF_PAGE_ELEMENT_SIZE;
        let start = elem_off + elem.pos as usize + elem.ksize as usize;
        &self.buf[start..start + elem.vsize as usize]
    }

    pub(crate) fn branch_key(&self, index: usize) -> &'a [u8] {
        let elem = self.branch_element(index);
        let elem_off = self.data_offset() + index * BRANCH_PAGE_ELEMENT_SIZE;
        let start = elem_off + elem.pos as usize;
        &self.buf[start..start + elem.ksize as usize]
    }

    /// Returns `(leading_elements_to_skip, count)`. A freelist whose
    /// length overflows a u16 `count` stores the real count as the
    /// first pgid-sized element instead.
    pub(crate) fn freelist_page_count(&self) -> (usize, usize) {
        let count = self.count();
        if count == 0xFFFF {
            let off = self.data_offset();
            let first: PgId = bytemuck::pod_read_unaligned(&self.buf[off..off + PGID_SIZE]);
            (1, first as usize)
        } else {
            (0, count)
        }
    }

    pub(crate) fn freelist_page_ids(&self) -> Vec<PgId> {
        let (skip, count) = self.freelist_page_count();
        if count == 0 {
            return Vec::new();
        }
        let off = self.data_offset() + skip * PGID_SIZE;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let start = off + i * PGID_SIZE;
            out.push(bytemuck::pod_read_unaligned(
                &self.buf[start..start + PGID_SIZE],
            ));
        }
        out
    }

    pub(crate) fn page_element_size(&self) -> usize {
        if self.is_leaf_page() {
            LEAF_PAGE_ELEMENT_SIZE
        } else {
            BRANCH_PAGE_ELEMENT_SIZE
        }
    }
}

impl<'a> Display for Page<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ ID: {}, Type: {}, count: {}, overflow: {} }}",
            self.id(),
            self.typ(),
            self.count(),
            self.overflow()
        )
    }
}

/// Sorted, deduplicated set of page ids, e.g. a freelist snapshot.
#[derive(Clone, Debug, Default, PartialOrd, PartialEq)]
pub(crate) struct PgIds {
    pgids: Vec<PgId>,
}

impl From<Vec<PgId>> for PgIds {
    fn from(v: Vec<PgId>) -> Self {
        PgIds { pgids: v }
    }
}

impl PgIds {
    pub(crate) fn len(&self) -> usize {
        self.pgids.len()
    }

    pub(crate) fn iter(&self) -> std::slice::Iter<'_, PgId> {
        self.pgids.iter()
    }

    pub(crate) fn sort(&mut self) {
        self.pgids.sort_unstable();
    }

    pub(crate) fn as_slice(&self) -> &[PgId] {
        &self.pgids
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pgids.is_empty()
    }

    pub(crate) fn push(&mut self, pgid: PgId) {
        self.pgids.push(pgid);
    }

    pub(crate) fn into_vec(self) -> Vec<PgId> {
        self.pgids
    }

    /// Merges another (sorted) set in, re-sorting and deduplicating.
    pub(crate) fn merge(&mut self, other: Self) {
        self.pgids.extend_from_slice(&other.pgids);
        self.pgids.sort_unstable();
        self.pgids.dedup();
    }
}

/// Human-readable page stats, as surfaced by `Bucket::stats()`.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PageInfo {
    pub(crate) id: u64,
    pub(crate) typ: &'static str,
    pub(crate) count: usize,
    pub(crate) overflow_count: usize,
}

/// A heap-owned, mutable page buffer, used to serialize a node, a meta
/// record, or a freelist at commit time.
#[derive(Clone)]
pub(crate) struct OwnedPage {
    buf: Vec<u8>,
}

impl OwnedPage {
    pub(crate) fn new(size: usize) -> Self {
        OwnedPage { buf: vec![0u8; size] }
    }

    pub(crate) fn from_vec(buf: Vec<u8>) -> Self {
        OwnedPage { buf }
    }

    pub(crate) fn as_page(&self) -> Page<'_> {
        Page::from_buf(&self.buf)
    }

    pub(crate) fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub(crate) fn size(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn header(&self) -> PageHeader {
        self.as_page().header()
    }

    pub(crate) fn set_header(&mut self, header: PageHeader) {
        self.buf[..PAGE_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
    }

    pub(crate) fn set_id(&mut self, id: PgId) {
        let mut h = self.header();
        h.id = id;
        self.set_header(h);
    }

    pub(crate) fn set_flags(&mut self, flags: PageFlags) {
        let mut h = self.header();
        h.flags = flags.bits();
        self.set_header(h);
    }

    pub(crate) fn set_count(&mut self, count: u16) {
        let mut h = self.header();
        h.count = count;
        self.set_header(h);
    }

    pub(crate) fn set_overflow(&mut self, overflow: u32) {
        let mut h = self.header();
        h.overflow = overflow;
        self.set_header(h);
    }

    pub(crate) fn write_leaf_element(&mut self, index: usize, elem: LeafPageElement) {
        let off = PAGE_HEADER_SIZE + index * LEAF_PAGE_ELEMENT_SIZE;
        self.buf[off..off + LEAF_PAGE_ELEMENT_SIZE].copy_from_slice(bytemuck::bytes_of(&elem));
    }

    pub(crate) fn write_branch_element(&mut self, index: usize, elem: BranchPageElement) {
        let off = PAGE_HEADER_SIZE + index * BRANCH_PAGE_ELEMENT_SIZE;
        self.buf[off..off + BRANCH_PAGE_ELEMENT_SIZE].copy_from_slice(bytemuck::bytes_of(&elem));
    }

    pub(crate) fn write_bytes_at(&mut self, offset: usize, bytes: &[u8]) {
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub(crate) fn write_meta(&mut self, meta: &Meta) {
        let bytes = meta.encode();
        let start = PAGE_HEADER_SIZE;
        self.buf[start..start + bytes.len()].copy_from_slice(&bytes);
    }

    /// Writes a freelist page body; `ids` must already be sorted.
    /// Uses the leading-count encoding when `ids.len() >= 0xFFFF`.
    pub(crate) fn write_freelist_ids(&mut self, ids: &[PgId]) {
        let off = PAGE_HEADER_SIZE;
        if ids.len() >= 0xFFFF {
            self.set_count(0xFFFF);
            self.write_bytes_at(off, &(ids.len() as u64).to_ne_bytes());
            for (i, id) in ids.iter().enumerate() {
                let start = off + (i + 1) * PGID_SIZE;
                self.write_bytes_at(start, &id.to_ne_bytes());
            }
        } else {
            self.set_count(ids.len() as u16);
            for (i, id) in ids.iter().enumerate() {
                let start = off + i * PGID_SIZE;
                self.write_bytes_at(start, &id.to_ne_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut owned = OwnedPage::new(128);
        owned.set_id(42);
        owned.set_flags(PageFlags::LEAF_PAGE);
        owned.set_count(3);
        owned.set_overflow(0);

        let page = owned.as_page();
        assert_eq!(page.id(), 42);
        assert!(page.is_leaf_page());
        assert_eq!(page.count(), 3);
        assert_eq!(page.typ(), "leaf");
    }

    #[test]
    fn leaf_element_key_value_offsets() {
        let mut owned = OwnedPage::new(256);
        owned.set_flags(PageFlags::LEAF_PAGE);
        owned.set_count(1);

        owned.write_leaf_element(
            0,
            LeafPageElement {
                flags: 0,
                pos: LEAF_PAGE_ELEMENT_SIZE as u32,
                ksize: 3,
                vsize: 5,
            },
        );
        let kv_off = PAGE_HEADER_SIZE + LEAF_PAGE_ELEMENT_SIZE;
        owned.write_bytes_at(kv_off, b"key");
        owned.write_bytes_at(kv_off + 3, b"value");

        let page = owned.as_page();
        assert_eq!(page.leaf_key(0), b"key");
        assert_eq!(page.leaf_value(0), b"value");
    }

    #[test]
    fn freelist_overflow_count_encoding() {
        let ids: Vec<PgId> = (0..70_000u64).map(|i| i + 2).collect();
        let mut owned = OwnedPage::new(PAGE_HEADER_SIZE + PGID_SIZE * (ids.len() + 1));
        owned.set_flags(PageFlags::FREELIST_PAGE);
        owned.write_freelist_ids(&ids);

        let page = owned.as_page();
        assert_eq!(page.freelist_page_ids(), ids);
    }

    #[test]
    fn freelist_small_count_encoding() {
        let ids: Vec<PgId> = vec![10, 20, 30];
        let mut owned = OwnedPage::new(PAGE_HEADER_SIZE + PGID_SIZE * ids.len());
        owned.set_flags(PageFlags::FREELIST_PAGE);
        owned.write_freelist_ids(&ids);

        let page = owned.as_page();
        assert_eq!(page.count(), 3);
        assert_eq!(page.freelist_page_ids(), ids);
    }

    #[test]
    fn pgids_merge_dedups_and_sorts() {
        let mut a = PgIds::from(vec![12323, 334, 3445, 4456, 333]);
        let b = PgIds::from(vec![12323, 4567, 3445, 3489, 33356]);
        a.merge(b);
        assert_eq!(a.len(), 8);
        assert_eq!(a.as_slice().windows(2).all(|w| w[0] <= w[1]), true);
    }
}
