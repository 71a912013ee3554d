//! Read-only or read/write transaction handle (spec.md §4.7).
//!
//! `Tx` owns an `Arc` clone of the database's shared state (so the mmap
//! and on-disk file stay alive for the transaction's lifetime) plus its
//! own snapshot of the meta record and, for writable transactions, a
//! dirty-page cache and per-bucket node arenas. `Bucket`/`Cursor`
//! borrow `&Tx` rather than being stored inside it, so there is no
//! self-referential owner/borrower pair to express.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use crate::bucket::{Bucket, BucketState};
use crate::common::bucket::InBucket;
use crate::common::meta::Meta;
use crate::common::page::{OwnedPage, Page, PageFlags, PgId, PAGE_HEADER_SIZE};
use crate::db::DbInner;
use crate::errors::{Error, Result};
use crate::freelist::Freelist;

pub(crate) type BucketPath = Vec<Vec<u8>>;

/// A single transaction against the database. `Tx` holds its own
/// `Arc<DbInner>` clone rather than borrowing the `DB`, so it carries
/// no lifetime parameter of its own.
pub struct Tx {
    pub(crate) db: Arc<DbInner>,
    writable: bool,
    /// Raw view of the mmap captured when the transaction began. Valid
    /// for the whole transaction because `db.mmap_gate` blocks any
    /// remap until this reader exits (see `Drop`).
    mmap_ptr: *const u8,
    mmap_len: usize,
    pub(crate) meta: RefCell<Meta>,
    pub(crate) dirty_pages: RefCell<HashMap<PgId, OwnedPage>>,
    pub(crate) freelist: RefCell<Freelist>,
    pub(crate) next_pgid: RefCell<PgId>,
    pub(crate) buckets: RefCell<HashMap<BucketPath, BucketState>>,
    pub(crate) stats: TxStats,
    done: RefCell<bool>,
}

// Safety: `mmap_ptr`/`mmap_len` describe a region the mmap gate keeps
// stable for this Tx's whole lifetime; nothing else mutates it.
unsafe impl Send for Tx {}

impl Tx {
    pub(crate) fn new_readonly(db: Arc<DbInner>, meta: Meta) -> Self {
        let (ptr, len) = db.mmap_raw_parts();
        let next_pgid = meta.pgid();
        Tx {
            db,
            writable: false,
            mmap_ptr: ptr,
            mmap_len: len,
            meta: RefCell::new(meta),
            dirty_pages: RefCell::new(HashMap::new()),
            freelist: RefCell::new(Freelist::new()),
            next_pgid: RefCell::new(next_pgid),
            buckets: RefCell::new(HashMap::new()),
            stats: TxStats::default(),
            done: RefCell::new(false),
        }
    }

    pub(crate) fn new_writable(db: Arc<DbInner>, meta: Meta, freelist: Freelist) -> Self {
        let (ptr, len) = db.mmap_raw_parts();
        let next_pgid = meta.pgid();
        Tx {
            db,
            writable: true,
            mmap_ptr: ptr,
            mmap_len: len,
            meta: RefCell::new(meta),
            dirty_pages: RefCell::new(HashMap::new()),
            freelist: RefCell::new(freelist),
            next_pgid: RefCell::new(next_pgid),
            buckets: RefCell::new(HashMap::new()),
            stats: TxStats::default(),
            done: RefCell::new(false),
        }
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Current size of the database's data, in bytes, as of this
    /// transaction's snapshot — the high-water page id times the page
    /// size. Grows only when a commit allocates past every freed page;
    /// reused pages never move it.
    pub fn size(&self) -> i64 {
        self.meta.borrow().pgid() as i64 * self.db.page_size as i64
    }

    pub(crate) fn page_size(&self) -> usize {
        self.db.page_size
    }

    pub(crate) fn txid(&self) -> crate::common::types::TxId {
        self.meta.borrow().txid()
    }

    fn check_open(&self) -> Result<()> {
        if *self.done.borrow() {
            Err(Error::TxClosed)
        } else {
            Ok(())
        }
    }

    /// Returns a view over page `id`, preferring this transaction's own
    /// dirty copy over the mmap.
    pub(crate) fn page(&self, id: PgId) -> Page<'_> {
        {
            let pages = self.dirty_pages.borrow();
            if let Some(owned) = pages.get(&id) {
                // Safety: dirty pages are only ever inserted, never
                // removed or reallocated in place, for the life of the
                // transaction, so this reference stays valid past the
                // `Ref` guard's scope.
                let buf = owned.buf();
                let slice = unsafe { std::slice::from_raw_parts(buf.as_ptr(), buf.len()) };
                return Page::from_buf(slice);
            }
        }
        let page_size = self.page_size();
        let start = id as usize * page_size;
        assert!(start + page_size <= self.mmap_len, "page id out of bounds");
        // Peek the header to find how many overflow pages (if any) this
        // page spans before slicing the full view, so a multi-page
        // freelist/leaf/branch page isn't truncated to one page.
        let header_slice =
            unsafe { std::slice::from_raw_parts(self.mmap_ptr.add(start), PAGE_HEADER_SIZE) };
        let overflow = Page::from_buf(header_slice).overflow() as usize;
        let full_len = (1 + overflow) * page_size;
        assert!(start + full_len <= self.mmap_len, "page id out of bounds");
        let slice = unsafe { std::slice::from_raw_parts(self.mmap_ptr.add(start), full_len) };
        Page::from_buf(slice)
    }

    /// Allocates `count` contiguous pages, preferring the free list and
    /// falling back to extending the high water mark.
    pub(crate) fn allocate(&self, count: usize) -> Result<PgId> {
        assert!(self.writable, "allocate on a read-only tx");

        let txid = self.txid();
        let mut pgid = self.freelist.borrow_mut().allocate(txid, count);
        if pgid == 0 {
            pgid = *self.next_pgid.borrow();
            let mut next = self.next_pgid.borrow_mut();
            *next += count as PgId;
            self.meta.borrow_mut().set_pgid(*next);
        }

        let buf_size = self.page_size() * count;
        let mut page = OwnedPage::new(buf_size);
        page.set_id(pgid);
        page.set_overflow((count - 1) as u32);
        self.dirty_pages.borrow_mut().insert(pgid, page);
        self.stats.inc_page_count();
        Ok(pgid)
    }

    pub(crate) fn free(&self, pgid: PgId) {
        assert!(self.writable, "free on a read-only tx");
        let txid = self.txid();
        let page = self.page(pgid);
        self.freelist.borrow_mut().free(txid, &page);
    }

    /// Opens the top-level bucket named `name`.
    pub fn bucket<'tx>(&'tx self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.check_open()?;
        Bucket::root(self).bucket(name)
    }

    pub fn create_bucket<'tx>(&'tx self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.check_open()?;
        Bucket::root(self).create_bucket(name)
    }

    pub fn create_bucket_if_not_exists<'tx>(&'tx self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.check_open()?;
        Bucket::root(self).create_bucket_if_not_exists(name)
    }

    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.check_open()?;
        Bucket::root(self).delete_bucket(name)
    }

    pub(crate) fn root_inbucket(&self) -> InBucket {
        self.meta.borrow().root_bucket()
    }

    pub(crate) fn set_root_inbucket(&self, b: InBucket) {
        self.meta.borrow_mut().set_root_bucket(b);
    }

    /// Runs the commit protocol (spec.md §4.7): spill every dirty
    /// bucket's nodes to pages, write the freelist, bump the txid,
    /// write whichever meta slot is now stale, and fsync.
    pub fn commit(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        self.check_open()?;

        trace!("committing tx {}", self.txid());

        self.freelist.borrow_mut().release(self.txid());

        let paths: Vec<BucketPath> = self.buckets.borrow().keys().cloned().collect();
        for path in &paths {
            Bucket::rebalance_path(self, path);
        }
        for path in &paths {
            Bucket::spill_path(self, path)?;
        }

        if self.db.opts.no_freelist_sync {
            self.meta.borrow_mut().set_freelist(crate::common::types::PGID_NO_FREELIST);
        } else {
            let size = self.freelist.borrow().estimated_write_page_size();
            let page_count = size.div_ceil(self.page_size()).max(1);
            let pgid = self.allocate(page_count)?;
            let mut pages = self.dirty_pages.borrow_mut();
            let page = pages.get_mut(&pgid).expect("just allocated");
            self.freelist.borrow().write(page);
            drop(pages);
            self.meta.borrow_mut().set_freelist(pgid);
        }

        self.meta.borrow_mut().inc_txid();
        self.write_dirty_pages()?;

        if !self.db.opts.no_sync {
            self.db.fsync_data()?;
        }
        self.write_meta()?;
        if !self.db.opts.no_sync {
            self.db.fsync_data()?;
        }

        self.db.publish_meta(*self.meta.borrow());
        self.db.store_freelist(self.freelist.borrow().clone());
        self.stats.inc_write();
        *self.done.borrow_mut() = true;
        debug!("tx {} committed", self.txid());
        Ok(())
    }

    fn write_dirty_pages(&self) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let page_size = self.page_size();
        let mut file = self.db.file.lock();
        for (pgid, page) in self.dirty_pages.borrow().iter() {
            file.seek(SeekFrom::Start(*pgid * page_size as u64))?;
            file.write_all(page.buf())?;
            self.stats.inc_write();
        }
        Ok(())
    }

    fn write_meta(&self) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let page_size = self.page_size();
        let mut meta = *self.meta.borrow();
        let mut page = OwnedPage::new(page_size);
        let slot = meta.txid() % 2;
        page.set_id(slot);
        page.set_flags(PageFlags::META_PAGE);
        meta.write(&mut page);
        *self.meta.borrow_mut() = meta;

        let mut file = self.db.file.lock();
        file.seek(SeekFrom::Start(slot * page_size as u64))?;
        file.write_all(page.buf())?;
        Ok(())
    }

    /// Discards every change this transaction made: dirty pages are
    /// dropped, and pages freed mid-tx go back to pending rather than
    /// being persisted.
    pub fn rollback(&self) -> Result<()> {
        self.check_open()?;
        if self.writable {
            let txid = self.txid();
            self.freelist.borrow_mut().rollback(txid);
        }
        *self.done.borrow_mut() = true;
        Ok(())
    }

    pub fn stats(&self) -> &TxStats {
        &self.stats
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if !*self.done.borrow() {
            let _ = self.rollback();
        }
        self.db.merge_tx_stats(&self.stats);
        if !self.writable {
            self.db.mmap_gate.exit_reader();
            self.db.remove_readonly_txid(self.txid());
        } else {
            self.db.writer_gate.unlock();
        }
    }
}

#[derive(Debug, Default)]
pub struct TxStats {
    page_count: AtomicI64,
    page_alloc: AtomicI64,
    cursor_count: AtomicI64,
    node_count: AtomicI64,
    node_deref: AtomicI64,
    rebalance: AtomicI64,
    split: AtomicI64,
    spill: AtomicI64,
    write: AtomicI64,
}

impl TxStats {
    pub fn page_count(&self) -> i64 {
        self.page_count.load(Ordering::Acquire)
    }
    pub fn inc_page_count(&self) {
        self.page_count.fetch_add(1, Ordering::Relaxed);
    }
    pub fn page_alloc(&self) -> i64 {
        self.page_alloc.load(Ordering::Acquire)
    }
    pub fn cursor_count(&self) -> i64 {
        self.cursor_count.load(Ordering::Acquire)
    }
    pub fn inc_cursor_count(&self) {
        self.cursor_count.fetch_add(1, Ordering::Relaxed);
    }
    pub fn node_count(&self) -> i64 {
        self.node_count.load(Ordering::Acquire)
    }
    pub fn inc_node_count(&self) {
        self.node_count.fetch_add(1, Ordering::Relaxed);
    }
    pub fn node_deref(&self) -> i64 {
        self.node_deref.load(Ordering::Acquire)
    }
    pub fn rebalance(&self) -> i64 {
        self.rebalance.load(Ordering::Acquire)
    }
    pub fn inc_rebalance(&self) {
        self.rebalance.fetch_add(1, Ordering::Relaxed);
    }
    pub fn split(&self) -> i64 {
        self.split.load(Ordering::Acquire)
    }
    pub fn inc_split(&self) {
        self.split.fetch_add(1, Ordering::Relaxed);
    }
    pub fn spill(&self) -> i64 {
        self.spill.load(Ordering::Acquire)
    }
    pub fn inc_spill(&self) {
        self.spill.fetch_add(1, Ordering::Relaxed);
    }
    pub fn write(&self) -> i64 {
        self.write.load(Ordering::Acquire)
    }
    pub fn inc_write(&self) {
        self.write.fetch_add(1, Ordering::Relaxed);
    }
}

impl Clone for TxStats {
    fn clone(&self) -> Self {
        TxStats {
            page_count: AtomicI64::new(self.page_count()),
            page_alloc: AtomicI64::new(self.page_alloc()),
            cursor_count: AtomicI64::new(self.cursor_count()),
            node_count: AtomicI64::new(self.node_count()),
            node_deref: AtomicI64::new(self.node_deref()),
            rebalance: AtomicI64::new(self.rebalance()),
            split: AtomicI64::new(self.split()),
            spill: AtomicI64::new(self.spill()),
            write: AtomicI64::new(self.write()),
        }
    }
}

/// Difference between two stats snapshots, for measuring activity
/// within a window. Replaces the teacher's stubbed `TxStats::sub`.
pub fn sub_tx_stats(a: &TxStats, b: &TxStats) -> TxStats {
    let out = TxStats::default();
    out.page_count
        .store(a.page_count() - b.page_count(), Ordering::Relaxed);
    out.cursor_count
        .store(a.cursor_count() - b.cursor_count(), Ordering::Relaxed);
    out.node_count
        .store(a.node_count() - b.node_count(), Ordering::Relaxed);
    out.rebalance
        .store(a.rebalance() - b.rebalance(), Ordering::Relaxed);
    out.split.store(a.split() - b.split(), Ordering::Relaxed);
    out.spill.store(a.spill() - b.spill(), Ordering::Relaxed);
    out.write.store(a.write() - b.write(), Ordering::Relaxed);
    out
}

/// Sum of two stats snapshots, used to fold a finished transaction's
/// counters into the database-wide running totals.
pub(crate) fn add_tx_stats(a: &TxStats, b: &TxStats) -> TxStats {
    let out = TxStats::default();
    out.page_count
        .store(a.page_count() + b.page_count(), Ordering::Relaxed);
    out.cursor_count
        .store(a.cursor_count() + b.cursor_count(), Ordering::Relaxed);
    out.node_count
        .store(a.node_count() + b.node_count(), Ordering::Relaxed);
    out.rebalance
        .store(a.rebalance() + b.rebalance(), Ordering::Relaxed);
    out.split.store(a.split() + b.split(), Ordering::Relaxed);
    out.spill.store(a.spill() + b.spill(), Ordering::Relaxed);
    out.write.store(a.write() + b.write(), Ordering::Relaxed);
    out
}
