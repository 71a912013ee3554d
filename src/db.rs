//! The database handle: file lifecycle, memory mapping, and the
//! transaction-management surface (`view`/`update`/`batch`) built on
//! top of `Tx` (spec.md §4.1, §4.7).

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};
use memmap2::{Mmap, MmapOptions};
use parking_lot::{Mutex, RwLock};

use crate::common::bucket::InBucket;
use crate::common::meta::Meta;
use crate::common::page::{OwnedPage, Page, PageFlags, PgId, PgIds, PAGE_HEADER_SIZE};
use crate::common::types::{
    TxId, DEFAULT_MAX_BATCH_DELAY, DEFAULT_MAX_BATCH_SIZE, DEFAULT_PAGE_SIZE, MAGIC,
    MAX_MMAP_STEP, VERSION,
};
use crate::errors::{Error, Result};
use crate::freelist::Freelist;
use crate::os::{self, MAX_MAP_SIZE};
use crate::sync_util::{MmapGate, RawGate};
use crate::tx::{sub_tx_stats, Tx, TxStats};

/// Pages below page 4 are reserved for the two meta pages, the initial
/// freelist page, and the initial (empty) root bucket leaf.
const FIRST_DATA_PAGE: PgId = 4;

/// Shared, `Arc`-wrapped database state. `Tx` holds a clone of this
/// `Arc` directly rather than borrowing `DB`, so neither carries a
/// lifetime parameter tied to the other (see `tx.rs`'s module doc).
pub(crate) struct DbInner {
    pub(crate) path: PathBuf,
    pub(crate) file: Mutex<File>,
    pub(crate) page_size: usize,
    pub(crate) opts: Options,
    read_only: bool,

    mmap: RwLock<Mmap>,
    meta: Mutex<Meta>,
    freelist: Mutex<Freelist>,

    pub(crate) writer_gate: RawGate,
    pub(crate) mmap_gate: MmapGate,

    stats: Mutex<Stats>,
    batch: Mutex<Option<Batch>>,
}

impl DbInner {
    /// Raw pointer/length of the current mmap. Safe to call from
    /// inside a `Tx` that has already registered with `mmap_gate`, or
    /// from a writer (which is the only thread that can trigger a
    /// remap and therefore can't race itself).
    pub(crate) fn mmap_raw_parts(&self) -> (*const u8, usize) {
        let guard = self.mmap.read();
        (guard.as_ptr(), guard.len())
    }

    pub(crate) fn fsync_data(&self) -> Result<()> {
        let file = self.file.lock();
        os::fdatasync(&file)
    }

    /// Grows the backing file and, if needed, remaps it, then installs
    /// `meta` as the database's current meta record. Called once per
    /// commit; infallible from the caller's perspective because a
    /// failure here is logged rather than propagated (the commit
    /// itself already made it to disk by this point).
    pub(crate) fn publish_meta(&self, meta: Meta) {
        let needed = meta.pgid() * self.page_size as PgId;
        if let Err(e) = self.grow(needed) {
            error!("failed to grow database file/mmap to {} bytes: {}", needed, e);
        }
        *self.meta.lock() = meta;
    }

    pub(crate) fn store_freelist(&self, freelist: Freelist) {
        *self.freelist.lock() = freelist;
    }

    pub(crate) fn add_readonly_txid(&self, txid: TxId) {
        self.freelist.lock().add_readonly_txid(txid);
    }

    pub(crate) fn remove_readonly_txid(&self, txid: TxId) {
        self.freelist.lock().remove_readonly_txid(txid);
    }

    /// Folds a just-closed transaction's counters into the running
    /// database-wide stats and drops the open-transaction count.
    pub(crate) fn merge_tx_stats(&self, tx_stats: &TxStats) {
        let mut stats = self.stats.lock();
        stats.open_tx_n -= 1;
        stats.tx_stats = crate::tx::add_tx_stats(&stats.tx_stats, tx_stats);
    }

    /// Ensures the file (and, if necessary, the mmap) covers at least
    /// `min_size` bytes. Mirrors the doubling growth policy used
    /// throughout the bbolt lineage: small databases double in size
    /// up to 1GB, then grow in fixed `MAX_MMAP_STEP` increments.
    fn grow(&self, min_size: PgId) -> Result<()> {
        {
            let file = self.file.lock();
            let cur_len = file.metadata()?.len();
            if cur_len < min_size {
                if !self.opts.no_grow_sync && !self.read_only {
                    file.set_len(min_size)?;
                    file.sync_all()?;
                }
            }
        }

        let cur_mmap_size = self.mmap.read().len() as u64;
        if cur_mmap_size >= min_size {
            return Ok(());
        }

        let new_size = mmap_size(min_size)?;
        debug!(
            "remapping database from {} to {} bytes",
            cur_mmap_size, new_size
        );
        self.mmap_gate.begin_remap();
        let file = self.file.lock();
        let remap_result = unsafe { MmapOptions::new().len(new_size as usize).map(&*file) };
        drop(file);
        let result = match remap_result {
            Ok(new_mmap) => {
                *self.mmap.write() = new_mmap;
                Ok(())
            }
            Err(e) => Err(Error::from(e)),
        };
        self.mmap_gate.finish_remap();
        result
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        let file = self.file.lock();
        if let Err(e) = os::funlock(&file) {
            warn!("failed to release file lock on close: {e}");
        }
    }
}

/// Views the page at `pgid`, sized to cover its overflow run. Peeks the
/// fixed-size header first to learn the overflow count before slicing
/// the full view, so a multi-page freelist/leaf/branch page isn't
/// truncated to a single page.
fn page_view(mmap: &[u8], page_size: usize, pgid: PgId) -> Page<'_> {
    let off = pgid as usize * page_size;
    let overflow = Page::from_buf(&mmap[off..off + PAGE_HEADER_SIZE]).overflow() as usize;
    let len = (1 + overflow) * page_size;
    Page::from_buf(&mmap[off..off + len])
}

/// Rounds a requested mmap size up to the next doubling step (to 1GB),
/// then to the next `MAX_MMAP_STEP` increment beyond that.
fn mmap_size(size: PgId) -> Result<u64> {
    for i in 15..=30 {
        let candidate = 1u64 << i;
        if size <= candidate {
            return Ok(candidate);
        }
    }
    if size > MAX_MAP_SIZE {
        return Err(Error::Invalid);
    }

    let step = MAX_MMAP_STEP as u64;
    let mut sz = size.div_ceil(step) * step;
    let page_size = *DEFAULT_PAGE_SIZE as u64;
    let remainder = sz % page_size;
    if remainder != 0 {
        sz += page_size - remainder;
    }
    Ok(sz)
}

/// A collection of buckets persisted to a single memory-mapped file.
/// Cheaply `Clone`-able; every clone shares the same underlying state.
#[derive(Clone)]
pub struct DB(pub(crate) Arc<DbInner>);

impl DB {
    /// Opens (creating if necessary) a database at `path` with default
    /// options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        DB::open_with(path, Options::default())
    }

    /// Opens (creating if necessary) a database at `path`.
    pub fn open_with<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let page_size = if options.page_size > 0 {
            options.page_size
        } else {
            *DEFAULT_PAGE_SIZE
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(!options.read_only)
            .create(!options.read_only)
            .open(&path)?;

        os::flock(&file, !options.read_only, options.timeout)?;

        let file_size = file.metadata()?.len();
        if file_size == 0 {
            init_file(&mut file, page_size)?;
        }

        let current_len = file.metadata()?.len();
        let map_len = if options.read_only {
            current_len.max(page_size as u64 * FIRST_DATA_PAGE)
        } else {
            let requested = current_len
                .max(options.initial_mmap_size)
                .max(page_size as u64 * FIRST_DATA_PAGE);
            let target = mmap_size(requested)?;
            if target > current_len {
                file.set_len(target)?;
                file.sync_all()?;
            }
            target
        };
        let mmap = unsafe { MmapOptions::new().len(map_len as usize).map(&file)? };

        let meta = load_meta(&mmap, page_size)?;
        if meta.page_size() as usize != page_size {
            error!(
                "database page size {} does not match this open's page size {}",
                meta.page_size(),
                page_size
            );
            return Err(Error::Invalid);
        }

        let mut freelist = Freelist::new();
        if !options.read_only || options.pre_load_freelist {
            if meta.is_freelist_persisted() {
                let page = page_view(&mmap, page_size, meta.freelist());
                freelist.reload(&page);
            } else {
                debug!("freelist was not persisted, rebuilding by reachability scan");
                freelist = rebuild_freelist_by_scan(&mmap, page_size, &meta);
            }
        }

        debug!("opened database at {:?}: {}", path, meta);

        let inner = Arc::new(DbInner {
            path,
            file: Mutex::new(file),
            page_size,
            read_only: options.read_only,
            opts: options,
            mmap: RwLock::new(mmap),
            meta: Mutex::new(meta),
            freelist: Mutex::new(freelist),
            writer_gate: RawGate::new(),
            mmap_gate: MmapGate::new(),
            stats: Mutex::new(Stats::default()),
            batch: Mutex::new(None),
        });

        Ok(DB(inner))
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }

    pub fn is_read_only(&self) -> bool {
        self.0.read_only
    }

    /// Starts a read-only transaction. Any number may be open at once.
    /// Must be closed (committed, rolled back, or dropped) promptly or
    /// the freelist cannot reclaim pages it references.
    pub fn begin(&self) -> Result<Tx> {
        self.0.mmap_gate.enter_reader();
        let meta = *self.0.meta.lock();
        self.0.add_readonly_txid(meta.txid());
        {
            let mut stats = self.0.stats.lock();
            stats.tx_n += 1;
            stats.open_tx_n += 1;
        }
        Ok(Tx::new_readonly(self.0.clone(), meta))
    }

    /// Starts the single writable transaction. Blocks until any other
    /// writer finishes.
    pub fn begin_rw(&self) -> Result<Tx> {
        if self.0.read_only {
            return Err(Error::DatabaseReadOnly);
        }
        self.0.writer_gate.lock();
        let meta = *self.0.meta.lock();
        let freelist = self.0.freelist.lock().clone();
        {
            let mut stats = self.0.stats.lock();
            stats.tx_n += 1;
            stats.open_tx_n += 1;
        }
        Ok(Tx::new_writable(self.0.clone(), meta, freelist))
    }

    /// Runs `f` in a read-only transaction. The transaction is rolled
    /// back regardless of what `f` returns (reads never commit).
    pub fn view<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Tx) -> Result<()>,
    {
        let tx = self.begin()?;
        let result = f(&tx);
        tx.rollback()?;
        result
    }

    /// Runs `f` in a writable transaction, committing if it returns
    /// `Ok` and rolling back otherwise.
    pub fn update<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Tx) -> Result<()>,
    {
        let tx = self.begin_rw()?;
        match f(&tx) {
            Ok(()) => tx.commit(),
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    /// Queues `f` alongside other concurrent `batch` callers and commits
    /// them together in as few write transactions as possible, up to
    /// `Options::max_batch_size` calls or `Options::max_batch_delay`,
    /// whichever comes first. `f` may run more than once: if the
    /// coalesced commit fails, every queued call is retried alone, so
    /// `f` must be idempotent.
    pub fn batch<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&Tx) -> Result<()> + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        let call = BatchCall {
            f: Box::new(f),
            result: result_tx,
        };

        let max_batch_size = self.0.opts.max_batch_size.max(1);
        let run_now = {
            let mut guard = self.0.batch.lock();
            let is_new_batch = guard.is_none();
            let batch = guard.get_or_insert_with(Batch::new);
            batch.calls.push(call);
            let full = batch.calls.len() >= max_batch_size;
            if is_new_batch && !full {
                let db = self.clone();
                let delay = self.0.opts.max_batch_delay;
                thread::spawn(move || {
                    thread::sleep(delay);
                    db.run_batch();
                });
            }
            full
        };
        if run_now {
            self.run_batch();
        }

        result_rx.recv().map_err(|_| Error::Invalid)?
    }

    /// Takes whatever batch is currently queued (if any) and commits it
    /// as one transaction. On failure, every queued call is re-run alone
    /// in its own transaction so a caller unrelated to the failure still
    /// gets a clean result.
    fn run_batch(&self) {
        let Some(batch) = self.0.batch.lock().take() else {
            return;
        };
        if batch.calls.is_empty() {
            return;
        }
        debug!("running batch of {} queued call(s)", batch.calls.len());

        let mut calls = batch.calls;
        let outcome = self.update(|tx| {
            for call in &mut calls {
                (call.f)(tx)?;
            }
            Ok(())
        });

        match outcome {
            Ok(()) => {
                for call in calls {
                    let _ = call.result.send(Ok(()));
                }
            }
            Err(_) => {
                warn!("batched commit failed, retrying {} call(s) individually", calls.len());
                for mut call in calls {
                    let result = self.update(|tx| (call.f)(tx));
                    let _ = call.result.send(result);
                }
            }
        }
    }

    /// Forces the database file to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.0.fsync_data()
    }

    /// A point-in-time snapshot of the database's running statistics.
    /// `free_page_n`/`pending_page_n` are read live off the current
    /// freelist rather than accumulated, matching how `bbolt` reports
    /// them.
    pub fn stats(&self) -> Stats {
        let mut stats = self.0.stats.lock().clone();
        let freelist = self.0.freelist.lock();
        stats.free_page_n = freelist.free_count() as i64;
        stats.pending_page_n = freelist.pending_count() as i64;
        stats
    }

    pub fn info(&self) -> Info {
        Info {
            page_size: self.0.page_size,
            data_size: self.0.mmap.read().len(),
        }
    }

    /// Releases the advisory file lock. Remaining resources are freed
    /// when the last clone's `Arc<DbInner>` is dropped.
    pub fn close(self) -> Result<()> {
        debug!("closing database at {:?}", self.0.path);
        Ok(())
    }
}

/// Writes the initial two meta pages, an empty freelist page, and an
/// empty root-bucket leaf page — the smallest valid database.
fn init_file(file: &mut File, page_size: usize) -> Result<()> {
    let mut buf = vec![0u8; page_size * FIRST_DATA_PAGE as usize];

    for (i, slot) in buf.chunks_mut(page_size).take(2).enumerate() {
        let mut page = OwnedPage::from_vec(vec![0u8; page_size]);
        page.set_id(i as PgId);
        page.set_flags(PageFlags::META_PAGE);

        let mut meta = Meta::default();
        meta.set_magic(MAGIC);
        meta.set_version(VERSION);
        meta.set_page_size(page_size as u32);
        meta.set_root_bucket(InBucket::new(3, 0));
        meta.set_freelist(2);
        meta.set_pgid(FIRST_DATA_PAGE);
        meta.set_txid(i as u64);
        meta.write(&mut page);

        slot.copy_from_slice(page.buf());
    }

    let mut freelist_page = OwnedPage::new(page_size);
    freelist_page.set_id(2);
    freelist_page.set_flags(PageFlags::FREELIST_PAGE);
    buf[2 * page_size..3 * page_size].copy_from_slice(freelist_page.buf());

    let mut root_page = OwnedPage::new(page_size);
    root_page.set_id(3);
    root_page.set_flags(PageFlags::LEAF_PAGE);
    buf[3 * page_size..4 * page_size].copy_from_slice(root_page.buf());

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

/// Reads both meta pages and returns whichever validates with the
/// higher `txid`; if only one validates, returns that one.
fn load_meta(mmap: &Mmap, page_size: usize) -> Result<Meta> {
    let page0 = Page::from_buf(&mmap[0..page_size]).meta();
    let page1 = Page::from_buf(&mmap[page_size..page_size * 2]).meta();
    let ok0 = page0.validate().is_ok();
    let ok1 = page1.validate().is_ok();

    match (ok0, ok1) {
        (true, true) => {
            if page1.txid() > page0.txid() {
                debug!(
                    "meta page 1 (txid {}) is newer than meta page 0 (txid {}), adopting it",
                    page1.txid(),
                    page0.txid()
                );
                Ok(page1)
            } else {
                Ok(page0)
            }
        }
        (true, false) => {
            warn!("meta page 1 failed validation, recovering from meta page 0");
            Ok(page0)
        }
        (false, true) => {
            warn!("meta page 0 failed validation, recovering from meta page 1");
            Ok(page1)
        }
        (false, false) => {
            error!("both meta pages failed validation");
            Err(Error::Invalid)
        }
    }
}

/// Rebuilds a freelist from scratch by walking every bucket's tree from
/// the root down and treating every page id between 2 and the meta's
/// high-water mark that wasn't visited as free. Used on open when
/// `Options::no_freelist_sync` left the on-disk freelist stale or
/// absent.
fn rebuild_freelist_by_scan(mmap: &Mmap, page_size: usize, meta: &Meta) -> Freelist {
    let mut visited = HashSet::new();
    walk_bucket(mmap, page_size, &meta.root_bucket(), &mut visited);

    let mut free = Vec::new();
    for pgid in 2..meta.pgid() {
        if !visited.contains(&pgid) {
            free.push(pgid);
        }
    }

    let mut freelist = Freelist::new();
    freelist.init(PgIds::from(free));
    freelist
}

fn walk_bucket(mmap: &Mmap, page_size: usize, bucket: &InBucket, visited: &mut HashSet<PgId>) {
    if bucket.is_inline() {
        return;
    }
    walk_page(mmap, page_size, bucket.root_page(), visited);
}

fn walk_page(mmap: &Mmap, page_size: usize, pgid: PgId, visited: &mut HashSet<PgId>) {
    let page = page_view(mmap, page_size, pgid);
    for i in 0..=page.overflow() as PgId {
        visited.insert(pgid + i);
    }

    if page.is_branch_page() {
        for i in 0..page.count() {
            walk_page(mmap, page_size, page.branch_element(i).pgid, visited);
        }
    } else if page.is_leaf_page() {
        for i in 0..page.count() {
            let elem = page.leaf_element(i);
            if elem.is_bucket_entry() {
                let child = InBucket::decode(page.leaf_value(i));
                walk_bucket(mmap, page_size, &child, visited);
            }
        }
    }
}

type BatchFn = Box<dyn FnMut(&Tx) -> Result<()> + Send>;

/// One caller's pending `DB::batch` closure, along with where to send
/// its eventual result.
struct BatchCall {
    f: BatchFn,
    result: mpsc::Sender<Result<()>>,
}

/// Calls queued by concurrent `DB::batch` callers, waiting to be run
/// together in one `Tx`. Mirrors `bbolt`'s `DB.batch`: a caller that
/// finds one already forming joins it; the first caller to start one
/// also arms the `max_batch_delay` timer that flushes it if it never
/// fills to `max_batch_size`.
struct Batch {
    calls: Vec<BatchCall>,
}

impl Batch {
    fn new() -> Self {
        Batch { calls: Vec::new() }
    }
}

/// Options controlling how a database file is opened.
#[derive(Debug, Clone)]
pub struct Options {
    /// How long `open` waits to acquire the advisory file lock. Zero
    /// means wait forever.
    pub timeout: Duration,
    /// Skip `set_len`+`sync_all` when growing the file. Unsafe except
    /// on filesystems that never need preallocation (see
    /// `original_source`'s note on ext3/ext4).
    pub no_grow_sync: bool,
    /// Skip persisting the freelist on commit; it's rebuilt by a full
    /// scan on next open instead. Trades write performance now for a
    /// slower recovery later.
    pub no_freelist_sync: bool,
    /// Load the freelist eagerly even for a read-only open.
    pub pre_load_freelist: bool,
    /// Open with a shared (not exclusive) file lock and reject writes.
    pub read_only: bool,
    /// Initial size to map, in bytes, useful to avoid remapping during
    /// a long-running read transaction opened right after `open`.
    pub initial_mmap_size: u64,
    /// Overrides the OS page size. Zero means use the OS default.
    pub page_size: usize,
    /// Skip `fsync` after each commit. Unsafe: a crash can lose or
    /// corrupt the most recent commits.
    pub no_sync: bool,
    /// Raw platform mmap flags (e.g. `MAP_POPULATE` on Linux). Carried
    /// for parity with the configuration surface this was ported from;
    /// `memmap2` doesn't expose a way to pass arbitrary platform flags
    /// through to `mmap(2)`, so this is currently inert.
    pub mmap_flags: i32,
    /// Target number of operations `batch` tries to coalesce into one
    /// commit before running early.
    pub max_batch_size: usize,
    /// How long `batch` waits to accumulate `max_batch_size` operations
    /// before committing whatever it has anyway.
    pub max_batch_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            timeout: Duration::from_secs(0),
            no_grow_sync: false,
            no_freelist_sync: false,
            pre_load_freelist: false,
            read_only: false,
            initial_mmap_size: 0,
            page_size: 0,
            no_sync: false,
            mmap_flags: 0,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_delay: DEFAULT_MAX_BATCH_DELAY,
        }
    }
}

/// Running performance counters for a database, surfaced by
/// `DB::stats`.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub tx_stats: TxStats,
    pub free_page_n: i64,
    pub pending_page_n: i64,
    pub tx_n: i64,
    pub open_tx_n: i64,
}

impl Stats {
    /// Difference between two stats snapshots, useful for measuring
    /// activity within a window (e.g. `db.stats()` before and after a
    /// batch of work).
    pub fn sub(&self, other: &Stats) -> Stats {
        Stats {
            tx_stats: sub_tx_stats(&self.tx_stats, &other.tx_stats),
            free_page_n: self.free_page_n,
            pending_page_n: self.pending_page_n,
            tx_n: self.tx_n - other.tx_n,
            open_tx_n: self.open_tx_n,
        }
    }
}

/// Read-only information about the database's current memory mapping.
#[derive(Debug, Clone, Copy)]
pub struct Info {
    pub page_size: usize,
    pub data_size: usize,
}

#[cfg(test)]
mod tests {
    use crate::testing::TestDb;
    use crate::Error;

    #[test]
    fn open_creates_file() {
        let db = TestDb::new().unwrap();
        assert!(db.path().exists());
    }

    #[test]
    fn view_runs_read_only() {
        let db = TestDb::new().unwrap();
        db.view(|tx| {
            assert!(!tx.writable());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn update_commits_on_ok() {
        let db = TestDb::new().unwrap();
        db.update(|tx| {
            let b = tx.create_bucket(b"widgets")?;
            b.put(b"a", b"1")
        })
        .unwrap();

        db.view(|tx| {
            let b = tx.bucket(b"widgets")?;
            assert_eq!(b.get(b"a").as_deref(), Some(&b"1"[..]));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn update_rolls_back_on_err() {
        let db = TestDb::new().unwrap();
        let result = db.update(|_tx| Err(Error::Invalid));
        assert!(result.is_err());

        db.view(|tx| {
            assert!(tx.bucket(b"widgets").is_err());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn reopen_recovers_committed_data() {
        let db = TestDb::new().unwrap();
        db.update(|tx| {
            let b = tx.create_bucket(b"widgets")?;
            b.put(b"a", b"1")
        })
        .unwrap();

        let path = db.path().to_path_buf();
        drop(db);

        let reopened = crate::DB::open(&path).unwrap();
        reopened
            .view(|tx| {
                let b = tx.bucket(b"widgets")?;
                assert_eq!(b.get(b"a").as_deref(), Some(&b"1"[..]));
                Ok(())
            })
            .unwrap();
    }
}
