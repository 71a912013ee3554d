//! Array-backed free page tracking (spec.md §4.3). Tracks pages that
//! are free right now, plus pages freed by still-open writable
//! transactions ("pending") that cannot be reused until every reader
//! that might still see the old version has closed.

use std::collections::HashMap;

use crate::common::page::{OwnedPage, Page, PageFlags, PgId, PgIds, PGID_SIZE};
use crate::common::types::TxId;

/// Pages freed by one transaction, along with the ids of read-only
/// transactions still open when each page was allocated — a page
/// can't be released to the freelist until all of those have closed.
#[derive(Debug, Default, Clone)]
struct TxPending {
    ids: Vec<PgId>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Freelist {
    /// Free and available for immediate re-use, kept sorted.
    ids: Vec<PgId>,
    /// Pages released mid-transaction, keyed by the releasing txid.
    pending: HashMap<TxId, TxPending>,
    /// Fast membership lookup mirroring `ids` ∪ every `pending` page.
    cache: HashMap<PgId, ()>,
    /// Read-only transactions currently open, oldest first.
    readonly_txids: Vec<TxId>,
}

impl Freelist {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole free set, e.g. after loading from the
    /// on-disk freelist page.
    pub(crate) fn init(&mut self, ids: PgIds) {
        self.ids = ids.into_vec();
        self.ids.sort_unstable();
        self.rebuild_cache();
    }

    fn rebuild_cache(&mut self) {
        self.cache.clear();
        for &id in &self.ids {
            self.cache.insert(id, ());
        }
        for pending in self.pending.values() {
            for &id in &pending.ids {
                self.cache.insert(id, ());
            }
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.values().map(|p| p.ids.len()).sum()
    }

    /// Tries to allocate `num_pages` contiguous pages from the free
    /// list. Returns the starting pgid, or 0 if no run is long enough.
    pub(crate) fn allocate(&mut self, txid: TxId, num_pages: usize) -> PgId {
        if self.ids.is_empty() || num_pages == 0 {
            return 0;
        }

        let mut start_index = 0usize;
        let mut previous_id: PgId = 0;

        for (i, &id) in self.ids.iter().enumerate() {
            if previous_id == 0 || id != previous_id + 1 {
                start_index = i;
            }
            if i - start_index + 1 == num_pages {
                let start_id = self.ids[start_index];
                for id in self.ids.drain(start_index..=i) {
                    self.cache.remove(&id);
                }
                self.pending
                    .entry(txid)
                    .or_default()
                    .ids
                    .extend(start_id..start_id + num_pages as PgId);
                for id in start_id..start_id + num_pages as PgId {
                    self.cache.insert(id, ());
                }
                return start_id;
            }
            previous_id = id;
        }

        0
    }

    pub(crate) fn add_readonly_txid(&mut self, txid: TxId) {
        self.readonly_txids.push(txid);
        self.readonly_txids.sort_unstable();
    }

    pub(crate) fn remove_readonly_txid(&mut self, txid: TxId) {
        self.readonly_txids.retain(|&id| id != txid);
    }

    fn min_readonly_txid(&self) -> Option<TxId> {
        self.readonly_txids.first().copied()
    }

    /// Frees a page and all the pages its overflow spans, under
    /// `txid`. Pages are held in `pending` until `release` is called
    /// with a txid at or beyond every open reader.
    pub(crate) fn free(&mut self, txid: TxId, page: &Page) {
        assert!(page.id() > 1, "cannot free page 0 or 1: meta pages");

        let ids = self.pending.entry(txid).or_default();
        for id in page.id()..=page.id() + page.overflow() as PgId {
            assert!(
                !self.cache.contains_key(&id),
                "page {id} already freed"
            );
            ids.ids.push(id);
            self.cache.insert(id, ());
        }
    }

    pub(crate) fn freed(&self, pgid: PgId) -> bool {
        self.cache.contains_key(&pgid)
    }

    /// Drops every page a transaction had pending without making it
    /// free — used when a writable transaction rolls back.
    pub(crate) fn rollback(&mut self, txid: TxId) {
        if let Some(pending) = self.pending.remove(&txid) {
            for id in pending.ids {
                self.cache.remove(&id);
            }
        }
    }

    pub(crate) fn free_page_ids(&self) -> PgIds {
        PgIds::from(self.ids.clone())
    }

    /// Moves every pending page from transactions at or before `txid`
    /// into the free list, but only those not needed by any
    /// still-open read-only transaction.
    pub(crate) fn release(&mut self, txid: TxId) {
        let floor = self.min_readonly_txid().unwrap_or(TxId::MAX);
        let mut released_txids = Vec::new();

        for (&pending_txid, pending) in self.pending.iter() {
            if pending_txid <= txid && pending_txid < floor {
                self.ids.extend(pending.ids.iter().copied());
                released_txids.push(pending_txid);
            }
        }
        for txid in released_txids {
            self.pending.remove(&txid);
        }
        self.ids.sort_unstable();
        self.ids.dedup();
    }

    /// Reads the persisted freelist (`Page::freelist_page_ids`) and
    /// replaces the in-memory free set with it, leaving `pending`
    /// untouched.
    pub(crate) fn reload(&mut self, page: &Page) {
        let stored = page.freelist_page_ids();
        self.ids = stored;
        self.ids.sort_unstable();
        self.rebuild_cache();
    }

    /// Serializes the free list onto a page buffer already sized for
    /// it (see `estimated_write_page_size`).
    pub(crate) fn write(&self, page: &mut OwnedPage) {
        page.set_flags(PageFlags::FREELIST_PAGE);
        let mut ids = self.ids.clone();
        for pending in self.pending.values() {
            ids.extend(pending.ids.iter().copied());
        }
        ids.sort_unstable();
        page.write_freelist_ids(&ids);
    }

    /// Worst-case byte size of the serialized freelist: the header
    /// plus one pgid per free-or-pending page, plus one leading pgid
    /// if the count needs the overflow encoding.
    pub(crate) fn estimated_write_page_size(&self) -> usize {
        let n = self.count();
        let extra = if n >= 0xFFFF { 1 } else { 0 };
        crate::common::page::PAGE_HEADER_SIZE + (n + extra) * PGID_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_returns_contiguous_run() {
        let mut fl = Freelist::new();
        fl.init(PgIds::from(vec![3, 4, 5, 8, 9]));
        assert_eq!(fl.allocate(1, 2), 3);
        assert_eq!(fl.free_count(), 3);
        assert_eq!(fl.pending_count(), 2);
    }

    #[test]
    fn allocate_fails_when_no_run_is_long_enough() {
        let mut fl = Freelist::new();
        fl.init(PgIds::from(vec![3, 5, 7]));
        assert_eq!(fl.allocate(1, 2), 0);
    }

    #[test]
    fn free_then_release_moves_pending_to_free() {
        let mut fl = Freelist::new();
        let mut owned = OwnedPage::new(4096);
        owned.set_id(10);
        owned.set_overflow(0);
        fl.free(5, &owned.as_page());
        assert!(fl.freed(10));
        assert_eq!(fl.pending_count(), 1);

        fl.release(5);
        assert_eq!(fl.free_count(), 1);
        assert_eq!(fl.pending_count(), 0);
    }

    #[test]
    fn release_respects_open_readonly_tx() {
        let mut fl = Freelist::new();
        let mut owned = OwnedPage::new(4096);
        owned.set_id(10);
        fl.free(5, &owned.as_page());
        fl.add_readonly_txid(3);

        fl.release(10);
        assert_eq!(fl.pending_count(), 1, "reader at txid 3 still needs page 10");

        fl.remove_readonly_txid(3);
        fl.release(10);
        assert_eq!(fl.pending_count(), 0);
    }

    #[test]
    fn rollback_drops_pending_without_freeing() {
        let mut fl = Freelist::new();
        let mut owned = OwnedPage::new(4096);
        owned.set_id(10);
        fl.free(5, &owned.as_page());
        fl.rollback(5);
        assert!(!fl.freed(10));
        assert_eq!(fl.count(), 0);
    }

    #[test]
    fn write_then_reload_round_trips() {
        let mut fl = Freelist::new();
        fl.init(PgIds::from(vec![3, 4, 5]));
        let mut page = OwnedPage::new(fl.estimated_write_page_size());
        fl.write(&mut page);

        let mut reloaded = Freelist::new();
        reloaded.reload(&page.as_page());
        assert_eq!(reloaded.free_page_ids().as_slice(), &[3, 4, 5]);
    }
}
