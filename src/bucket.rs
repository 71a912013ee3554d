//! Buckets: named, independently-rooted key/value trees nested inside
//! a transaction (spec.md §4.4-4.6).
//!
//! `Bucket<'tx>` is a lightweight handle borrowing `&'tx Tx`; the real
//! state — the bucket's on-disk descriptor, its node arena, and its
//! page-to-node cache — lives in the transaction's `buckets` registry,
//! keyed by the bucket's path (the sequence of names from the root).
//! This avoids storing a `Bucket` inside the `Tx` it borrows from.

use std::collections::HashMap;
use std::ops::AddAssign;

use bytes::Bytes;

use crate::common::bucket::InBucket;
use crate::common::page::{PageFlags, PgId, BUCKET_LEAF_FLAG};
use crate::errors::{Error, Result};
use crate::node::{NodeArena, NodeId};
use crate::tx::{BucketPath, Tx};

pub(crate) const MAX_KEY_SIZE: usize = 32768;
pub(crate) const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

pub(crate) const MIN_FILL_PERCENT: f64 = 0.1;
pub(crate) const MAX_FILL_PERCENT: f64 = 1.0;
pub(crate) const DEFAULT_FILL_PERCENT: f64 = 0.5;

/// Per-bucket state held in a transaction's bucket registry.
pub(crate) struct BucketState {
    pub(crate) info: InBucket,
    pub(crate) arena: NodeArena,
    pub(crate) root_node: Option<NodeId>,
    pub(crate) fill_percent: f64,
    pub(crate) page_to_node: HashMap<PgId, NodeId>,
}

impl BucketState {
    pub(crate) fn new(info: InBucket) -> Self {
        BucketState {
            info,
            arena: NodeArena::new(),
            root_node: None,
            fill_percent: DEFAULT_FILL_PERCENT,
            page_to_node: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.info.root_page() == 0 && self.root_node.is_none()
    }
}

/// A handle onto one bucket's tree for the lifetime of a transaction.
pub struct Bucket<'tx> {
    pub(crate) tx: &'tx Tx,
    pub(crate) path: BucketPath,
}

impl<'tx> Clone for Bucket<'tx> {
    fn clone(&self) -> Self {
        Bucket {
            tx: self.tx,
            path: self.path.clone(),
        }
    }
}

/// Returns the node for `pgid`, materializing it from its page on
/// first access. `parent`, when given, is linked as the node's parent
/// exactly once (on the materializing call) so repeated lookups of an
/// already-cached pgid don't duplicate parent/child links.
pub(crate) fn get_or_load_node(
    tx: &Tx,
    state: &mut BucketState,
    pgid: PgId,
    parent: Option<NodeId>,
) -> NodeId {
    if let Some(&id) = state.page_to_node.get(&pgid) {
        return id;
    }
    let page = tx.page(pgid);
    let id = state.arena.alloc(page.is_leaf_page());
    state.arena.read(id, &page);
    state.page_to_node.insert(pgid, id);
    tx.stats.inc_node_count();
    if let Some(parent_id) = parent {
        state.arena.add_child(parent_id, id);
    }
    id
}

fn ensure_root_leaf(state: &mut BucketState) {
    if state.is_empty() {
        let id = state.arena.alloc(true);
        state.root_node = Some(id);
    }
}

/// Walks from the bucket's root down to the leaf that would contain
/// `key`, materializing nodes lazily. Returns the `(node, index)` pair
/// at each level visited, leaf last; empty if the bucket has no data.
pub(crate) fn descend(tx: &Tx, state: &mut BucketState, key: &[u8]) -> Vec<(NodeId, usize)> {
    let mut stack = Vec::new();
    if state.is_empty() {
        return stack;
    }

    let mut cur = match state.root_node {
        Some(id) => id,
        None => {
            let id = get_or_load_node(tx, state, state.info.root_page(), None);
            state.root_node = Some(id);
            id
        }
    };

    loop {
        if state.arena.is_leaf(cur) {
            let idx = match state.arena.get(cur).inodes.binary_search_by(key) {
                Ok(i) | Err(i) => i,
            };
            stack.push((cur, idx));
            return stack;
        }

        let n = state.arena.num_children(cur);
        let idx = match state.arena.get(cur).inodes.binary_search_by(key) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => (i - 1).min(n.saturating_sub(1)),
        };
        stack.push((cur, idx));
        let child_pgid = state.arena.get(cur).inodes.get(idx).pgid();
        let parent = cur;
        cur = get_or_load_node(tx, state, child_pgid, Some(parent));
    }
}

impl<'tx> Bucket<'tx> {
    pub(crate) fn root(tx: &'tx Tx) -> Self {
        let path: BucketPath = Vec::new();
        if !tx.buckets.borrow().contains_key(&path) {
            let info = tx.root_inbucket();
            tx.buckets.borrow_mut().insert(path.clone(), BucketState::new(info));
        }
        Bucket { tx, path }
    }

    fn child_path(&self, name: &[u8]) -> BucketPath {
        let mut p = self.path.clone();
        p.push(name.to_vec());
        p
    }

    fn with_state<R>(&self, f: impl FnOnce(&BucketState) -> R) -> R {
        let map = self.tx.buckets.borrow();
        f(map.get(&self.path).expect("bucket state missing from tx registry"))
    }

    fn with_state_mut<R>(&self, f: impl FnOnce(&mut BucketState) -> R) -> R {
        let mut map = self.tx.buckets.borrow_mut();
        f(map.get_mut(&self.path).expect("bucket state missing from tx registry"))
    }

    pub fn writable(&self) -> bool {
        self.tx.writable()
    }

    pub fn root(&self) -> PgId {
        self.with_state(|s| s.info.root_page())
    }

    pub fn fill_percent(&self) -> f64 {
        self.with_state(|s| s.fill_percent)
    }

    pub fn set_fill_percent(&self, pct: f64) {
        let pct = pct.clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT);
        self.with_state_mut(|s| s.fill_percent = pct);
    }

    /// A cursor for iterating over this bucket's key/value pairs in
    /// key order.
    pub fn cursor(&self) -> crate::cursor::Cursor<'tx> {
        crate::cursor::Cursor::new(self.clone())
    }

    /// Looks up `key` and returns an owned copy of its value, or `None`
    /// if absent or if `key` names a nested bucket.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let mut map = self.tx.buckets.borrow_mut();
        let state = map.get_mut(&self.path)?;
        let stack = descend(self.tx, state, key);
        let &(leaf, idx) = stack.last()?;
        let data = state.arena.get(leaf);
        if idx >= data.inodes.len() {
            return None;
        }
        let inode = data.inodes.get(idx);
        if inode.key().as_slice() != key || inode.is_bucket_entry() {
            return None;
        }
        Some(Bytes::copy_from_slice(inode.value()))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.writable() {
            return Err(Error::TxNotWritable);
        }
        if key.is_empty() {
            return Err(Error::KeyRequired);
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge);
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge);
        }

        let mut map = self.tx.buckets.borrow_mut();
        let state = map.get_mut(&self.path).expect("bucket state missing from tx registry");
        ensure_root_leaf(state);
        let stack = descend(self.tx, state, key);
        let &(leaf, idx) = stack.last().expect("descend always yields a leaf once materialized");

        let data = state.arena.get(leaf);
        if idx < data.inodes.len()
            && data.inodes.get(idx).key().as_slice() == key
            && data.inodes.get(idx).is_bucket_entry()
        {
            return Err(Error::IncompatibleValue);
        }

        state.arena.put(leaf, key, key, value, 0, 0);
        Ok(())
    }

    fn entry_flags(&self, key: &[u8]) -> Option<u32> {
        let mut map = self.tx.buckets.borrow_mut();
        let state = map.get_mut(&self.path)?;
        if state.is_empty() {
            return None;
        }
        let stack = descend(self.tx, state, key);
        let &(leaf, idx) = stack.last()?;
        let data = state.arena.get(leaf);
        if idx >= data.inodes.len() || data.inodes.get(idx).key().as_slice() != key {
            return None;
        }
        Some(data.inodes.get(idx).flags())
    }

    fn remove_entry(&self, key: &[u8]) {
        let mut map = self.tx.buckets.borrow_mut();
        let state = map.get_mut(&self.path).expect("bucket state missing from tx registry");
        let stack = descend(self.tx, state, key);
        if let Some(&(leaf, _)) = stack.last() {
            state.arena.del(leaf, key);
        }
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if !self.writable() {
            return Err(Error::TxNotWritable);
        }
        match self.entry_flags(key) {
            Some(flags) if flags & BUCKET_LEAF_FLAG != 0 => Err(Error::IncompatibleValue),
            Some(_) => {
                self.remove_entry(key);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        let child_path = self.child_path(name);
        if self.tx.buckets.borrow().contains_key(&child_path) {
            return Ok(Bucket { tx: self.tx, path: child_path });
        }

        let (info, raw_value) = {
            let mut map = self.tx.buckets.borrow_mut();
            let state = map.get_mut(&self.path).ok_or(Error::BucketNotFound)?;
            if state.is_empty() {
                return Err(Error::BucketNotFound);
            }
            let stack = descend(self.tx, state, name);
            let &(leaf, idx) = stack.last().ok_or(Error::BucketNotFound)?;
            let data = state.arena.get(leaf);
            if idx >= data.inodes.len() || data.inodes.get(idx).key().as_slice() != name {
                return Err(Error::BucketNotFound);
            }
            let inode = data.inodes.get(idx);
            if !inode.is_bucket_entry() {
                return Err(Error::IncompatibleValue);
            }
            (InBucket::decode(inode.value()), inode.value().clone())
        };

        let mut child_state = BucketState::new(info);
        // An inline bucket's root page travels as the tail of its own
        // value bytes (spec.md §4.5); a never-populated bucket also
        // reads as `root == 0` but carries no trailing page, so only
        // materialize a root node when there's actually one to read.
        if info.is_inline() && raw_value.len() > crate::common::bucket::BUCKET_HEADER_SIZE {
            let page = info.inline_page(&raw_value);
            let id = child_state.arena.alloc(page.is_leaf_page());
            child_state.arena.read(id, &page);
            child_state.root_node = Some(id);
        }

        self.tx.buckets.borrow_mut().insert(child_path.clone(), child_state);
        Ok(Bucket { tx: self.tx, path: child_path })
    }

    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        if !self.writable() {
            return Err(Error::TxNotWritable);
        }
        if name.is_empty() {
            return Err(Error::BucketNameRequired);
        }
        let child_path = self.child_path(name);
        if self.tx.buckets.borrow().contains_key(&child_path) {
            return Err(Error::BucketExists);
        }
        if self.entry_flags(name).is_some() {
            return Err(Error::BucketExists);
        }

        {
            let mut map = self.tx.buckets.borrow_mut();
            let state = map.get_mut(&self.path).expect("bucket state missing from tx registry");
            ensure_root_leaf(state);
            let stack = descend(self.tx, state, name);
            let &(leaf, _) = stack.last().expect("descend always yields a leaf once materialized");
            let value = InBucket::new(0, 0).encode();
            state.arena.put(leaf, name, name, &value, 0, BUCKET_LEAF_FLAG);
        }

        self.tx
            .buckets
            .borrow_mut()
            .insert(child_path.clone(), BucketState::new(InBucket::new(0, 0)));
        Ok(Bucket { tx: self.tx, path: child_path })
    }

    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        match self.create_bucket(name) {
            Ok(b) => Ok(b),
            Err(Error::BucketExists) => self.bucket(name),
            Err(e) => Err(e),
        }
    }

    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        if !self.writable() {
            return Err(Error::TxNotWritable);
        }
        match self.entry_flags(name) {
            Some(flags) if flags & BUCKET_LEAF_FLAG != 0 => {}
            Some(_) => return Err(Error::IncompatibleValue),
            None => return Err(Error::BucketNotFound),
        }
        let child_path = self.child_path(name);
        self.tx.buckets.borrow_mut().remove(&child_path);
        self.remove_entry(name);
        Ok(())
    }

    pub fn sequence(&self) -> u64 {
        self.with_state(|s| s.info.in_sequence())
    }

    pub fn set_sequence(&self, v: u64) -> Result<()> {
        if !self.writable() {
            return Err(Error::TxNotWritable);
        }
        self.with_state_mut(|s| s.info.set_in_sequence(v));
        Ok(())
    }

    pub fn next_sequence(&self) -> Result<u64> {
        if !self.writable() {
            return Err(Error::TxNotWritable);
        }
        Ok(self.with_state_mut(|s| {
            s.info.inc_sequence();
            s.info.in_sequence()
        }))
    }

    /// Calls `f` for every key/value pair in the bucket, in key order.
    /// `value` is `None` when `key` names a nested bucket.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> Result<()>,
    {
        let mut cursor = crate::cursor::Cursor::new(self.clone());
        let mut item = cursor.first();
        while let Some((key, value, flags)) = item {
            if flags & BUCKET_LEAF_FLAG != 0 {
                f(&key, None)?;
            } else {
                f(&key, Some(&value))?;
            }
            item = cursor.next();
        }
        Ok(())
    }

    /// Walks the whole subtree rooted at this bucket, tallying page and
    /// key statistics. Pages not yet materialized as nodes are read
    /// directly, so calling `stats` does not dirty the transaction.
    pub fn stats(&self) -> BucketStats {
        let mut stats = BucketStats::default();
        stats.bucket_n = 1;
        self.walk_stats(1, &mut stats);
        stats
    }

    fn walk_stats(&self, depth: i32, stats: &mut BucketStats) {
        stats.depth = stats.depth.max(depth);
        let (root_pgid, is_inline) = self.with_state(|s| (s.info.root_page(), s.info.is_inline()));
        if is_inline {
            stats.inline_bucket_n += 1;
            let (used, key_n) = self.with_state(|s| match s.root_node {
                Some(id) => (s.arena.size(id) as i32, s.arena.num_children(id) as i32),
                None => (crate::common::page::PAGE_HEADER_SIZE as i32, 0),
            });
            stats.inline_bucket_inuse += used;
            stats.key_n += key_n;
        } else if root_pgid != 0 {
            self.walk_page_stats(root_pgid, depth, stats);
        }

        let mut cursor = crate::cursor::Cursor::new(self.clone());
        let mut item = cursor.first();
        while let Some((key, _value, flags)) = item {
            if flags & BUCKET_LEAF_FLAG != 0 {
                if let Ok(child) = self.bucket(&key) {
                    stats.bucket_n += 1;
                    child.walk_stats(depth + 1, stats);
                }
            }
            item = cursor.next();
        }
    }

    fn walk_page_stats(&self, pgid: PgId, depth: i32, stats: &mut BucketStats) {
        let page = self.tx.page(pgid);
        let page_size = self.tx.page_size() as i32;
        if page.is_leaf_page() {
            stats.leaf_page_n += 1;
            stats.leaf_overflow_n += page.overflow() as i32;
            stats.leaf_alloc += (1 + page.overflow() as i32) * page_size;
            stats.key_n += page.count() as i32;
            for i in 0..page.count() {
                let elem = page.leaf_element(i);
                stats.leaf_inuse += crate::common::page::LEAF_PAGE_ELEMENT_SIZE as i32
                    + elem.ksize as i32
                    + elem.vsize as i32;
            }
        } else {
            stats.branch_page_n += 1;
            stats.branch_overflow_n += page.overflow() as i32;
            stats.branch_alloc += (1 + page.overflow() as i32) * page_size;
            for i in 0..page.count() {
                let elem = page.branch_element(i);
                stats.branch_inuse +=
                    crate::common::page::BRANCH_PAGE_ELEMENT_SIZE as i32 + elem.ksize as i32;
                self.walk_page_stats(elem.pgid, depth + 1, stats);
            }
        }
    }

    /// Rebalances every node this transaction flagged unbalanced
    /// (spec.md §4.4): merges an underfull node into a sibling,
    /// collapses a single-child branch root, or removes a now-empty
    /// node outright, cascading up to the root as parents themselves
    /// become underfull. Runs before `spill_path` so spilling only
    /// ever sees the post-rebalance shape of the tree.
    pub(crate) fn rebalance_path(tx: &Tx, path: &BucketPath) {
        let ids: Vec<NodeId> = {
            let map = tx.buckets.borrow();
            let Some(state) = map.get(path) else {
                return;
            };
            (0..state.arena.len())
                .map(NodeId)
                .filter(|&id| state.arena.get(id).unbalanced)
                .collect()
        };
        for id in ids {
            Self::rebalance_node(tx, path, id);
        }
    }

    fn rebalance_node(tx: &Tx, path: &BucketPath, id: NodeId) {
        let page_size = tx.page_size();
        let (unbalanced, is_leaf, parent, size, num_children, min_keys) = {
            let map = tx.buckets.borrow();
            let state = &map[path];
            if id.0 >= state.arena.len() {
                return;
            }
            let data = state.arena.get(id);
            (
                data.unbalanced,
                data.is_leaf,
                data.parent,
                state.arena.size(id),
                state.arena.num_children(id),
                state.arena.min_keys(id),
            )
        };
        if !unbalanced {
            return;
        }
        tx.stats.inc_rebalance();
        {
            let mut map = tx.buckets.borrow_mut();
            map.get_mut(path).unwrap().arena.get_mut(id).unbalanced = false;
        }

        // Large enough and full enough: nothing to do.
        if size > page_size / 4 && num_children >= min_keys {
            return;
        }

        match parent {
            None => Self::rebalance_root(tx, path, id, is_leaf, num_children),
            Some(parent_id) => Self::rebalance_with_sibling(tx, path, id, parent_id, num_children),
        }
    }

    /// A root branch with a single remaining child collapses: the
    /// child's contents move up to become the root's own, and the
    /// child's page is freed. A leaf root, or a branch root with more
    /// than one child, is left alone (a bucket's root may legitimately
    /// be small).
    fn rebalance_root(tx: &Tx, path: &BucketPath, id: NodeId, is_leaf: bool, num_children: usize) {
        if is_leaf || num_children != 1 {
            return;
        }
        let child_pgid = {
            let map = tx.buckets.borrow();
            map[path].arena.get(id).inodes.get(0).pgid()
        };
        let child_id = {
            let mut map = tx.buckets.borrow_mut();
            let state = map.get_mut(path).unwrap();
            get_or_load_node(tx, state, child_pgid, Some(id))
        };

        let mut map = tx.buckets.borrow_mut();
        let state = map.get_mut(path).unwrap();
        let child_is_leaf = state.arena.get(child_id).is_leaf;
        let child_children = state.arena.get(child_id).children.clone();
        let child_inodes = std::mem::take(&mut state.arena.get_mut(child_id).inodes);
        {
            let data = state.arena.get_mut(id);
            data.is_leaf = child_is_leaf;
            data.inodes = child_inodes;
            data.children = child_children.clone();
        }
        for grandchild in child_children {
            state.arena.set_parent(grandchild, Some(id));
        }
        state.page_to_node.remove(&child_pgid);
        drop(map);
        if child_pgid != 0 {
            tx.free(child_pgid);
        }
    }

    /// Merges `id` with whichever sibling bbolt would pick (the next
    /// sibling if `id` is its parent's first child, otherwise the
    /// previous one), then rebalances the parent in turn since it just
    /// lost one of its entries.
    fn rebalance_with_sibling(tx: &Tx, path: &BucketPath, id: NodeId, parent_id: NodeId, num_children: usize) {
        if num_children == 0 {
            let (key, pgid) = {
                let map = tx.buckets.borrow();
                let data = map[path].arena.get(id);
                (data.key.clone(), data.pgid)
            };
            {
                let mut map = tx.buckets.borrow_mut();
                let state = map.get_mut(path).unwrap();
                if !key.is_empty() {
                    state.arena.del(parent_id, &key);
                }
                state.arena.remove_child(parent_id, id);
                state.page_to_node.remove(&pgid);
                state.arena.get_mut(parent_id).unbalanced = true;
            }
            if pgid != 0 {
                tx.free(pgid);
            }
            Self::rebalance_node(tx, path, parent_id);
            return;
        }

        let idx = {
            let map = tx.buckets.borrow();
            map[path].arena.position_in_parent(parent_id, id)
        };
        let Some(idx) = idx else { return };
        let use_next_sibling = idx == 0;

        let sibling_pgid = {
            let map = tx.buckets.borrow();
            let inodes = &map[path].arena.get(parent_id).inodes;
            if use_next_sibling {
                inodes.get(idx + 1).pgid()
            } else {
                inodes.get(idx - 1).pgid()
            }
        };
        let sibling_id = {
            let mut map = tx.buckets.borrow_mut();
            let state = map.get_mut(path).unwrap();
            get_or_load_node(tx, state, sibling_pgid, Some(parent_id))
        };

        let (into, from) = if use_next_sibling { (id, sibling_id) } else { (sibling_id, id) };
        let (from_key, from_pgid) = {
            let map = tx.buckets.borrow();
            let data = map[path].arena.get(from);
            (data.key.clone(), data.pgid)
        };

        {
            let mut map = tx.buckets.borrow_mut();
            let state = map.get_mut(path).unwrap();
            let from_children = state.arena.get(from).children.clone();
            for grandchild in from_children {
                state.arena.remove_child(from, grandchild);
                state.arena.add_child(into, grandchild);
            }
            state.arena.merge_into(into, from);
            if !from_key.is_empty() {
                state.arena.del(parent_id, &from_key);
            }
            state.arena.remove_child(parent_id, from);
            state.page_to_node.remove(&from_pgid);
            state.arena.get_mut(parent_id).unbalanced = true;
        }
        if from_pgid != 0 {
            tx.free(from_pgid);
        }
        Self::rebalance_node(tx, path, parent_id);
    }

    /// Writes every dirty node reachable from the bucket at `path` to
    /// fresh pages, recursively spilling any nested bucket first so
    /// their root `InBucket` descriptors are up to date before this
    /// bucket's own tree (which stores those descriptors as values) is
    /// itself serialized.
    pub(crate) fn spill_path(tx: &Tx, path: &BucketPath) -> Result<()> {
        // Spill children (deeper paths) before the parent.
        let mut children: Vec<BucketPath> = tx
            .buckets
            .borrow()
            .keys()
            .filter(|p| p.len() == path.len() + 1 && p.starts_with(path.as_slice()))
            .cloned()
            .collect();
        children.sort_by_key(|p| p.len());
        for child in &children {
            Self::spill_path(tx, child)?;
        }

        let root_node = {
            let map = tx.buckets.borrow();
            map.get(path).and_then(|s| s.root_node)
        };
        let Some(root_id) = root_node else {
            return Ok(());
        };

        // A sufficiently small, sub-bucket-free leaf root is embedded
        // directly in the parent's value instead of getting its own
        // page (spec.md §4.5's inline-bucket rule, mirroring bbolt's
        // `Bucket.inlineable`). Doesn't apply to the database's own
        // top-level bucket, which has no parent leaf entry to live in.
        if let Some(parent_path) = path.split_last().map(|(_, rest)| rest.to_vec()) {
            if let Some(inline_value) = Self::try_inline(tx, path, root_id) {
                let name = path.last().unwrap().clone();
                let new_info = InBucket::decode(&inline_value);
                tx.buckets.borrow_mut().get_mut(path).unwrap().info = new_info;

                let mut map = tx.buckets.borrow_mut();
                let parent = map.get_mut(&parent_path).expect("parent bucket must be registered");
                if let Some(leaf) = parent.root_node {
                    if let Ok(idx) = parent.arena.get(leaf).inodes.binary_search_by(&name) {
                        let pgid = parent.arena.get(leaf).inodes.get(idx).pgid();
                        parent.arena.put(leaf, &name, &name, &inline_value, pgid, BUCKET_LEAF_FLAG);
                    }
                }
                return Ok(());
            }
        }

        let new_root = Self::spill_node(tx, path, root_id)?;

        if let Some(parent_path) = path.split_last().map(|(_, rest)| rest.to_vec()) {
            let name = path.last().unwrap().clone();
            let new_info = {
                let map = tx.buckets.borrow();
                let child_state = &map[path];
                InBucket::new(new_root, child_state.info.in_sequence())
            };
            tx.buckets.borrow_mut().get_mut(path).unwrap().info = new_info;

            let bucket = Bucket { tx, path: parent_path.clone() };
            let encoded = new_info.encode();
            let mut map = tx.buckets.borrow_mut();
            let parent = map.get_mut(&parent_path).expect("parent bucket must be registered");
            if let Some(leaf) = parent.root_node {
                if let Ok(idx) = parent.arena.get(leaf).inodes.binary_search_by(&name) {
                    let pgid = parent.arena.get(leaf).inodes.get(idx).pgid();
                    parent.arena.put(leaf, &name, &name, &encoded, pgid, BUCKET_LEAF_FLAG);
                }
            }
            drop(map);
            let _ = bucket; // keeps the borrow-checker happy about path reuse above
        } else {
            tx.buckets.borrow_mut().get_mut(path).unwrap().info =
                InBucket::new(new_root, tx.root_inbucket().in_sequence());
            tx.set_root_inbucket(InBucket::new(new_root, tx.root_inbucket().in_sequence()));
        }

        Ok(())
    }

    /// Returns the inline-encoded value (bucket header followed by a
    /// serialized leaf page) if `root_id` qualifies: a leaf with no
    /// nested-bucket entries of its own, small enough to fit in a
    /// quarter page. `None` means the bucket needs a real root page.
    fn try_inline(tx: &Tx, path: &BucketPath, root_id: NodeId) -> Option<Vec<u8>> {
        let page_size = tx.page_size();
        let (is_leaf, has_bucket_entry, size, sequence) = {
            let map = tx.buckets.borrow();
            let state = &map[path];
            let data = state.arena.get(root_id);
            let has_bucket_entry = data.inodes.iter().any(|i| i.is_bucket_entry());
            (data.is_leaf, has_bucket_entry, state.arena.size(root_id), state.info.in_sequence())
        };
        if !is_leaf || has_bucket_entry || size > page_size / 4 {
            return None;
        }

        let mut page = crate::common::page::OwnedPage::new(size);
        page.set_flags(PageFlags::LEAF_PAGE);
        {
            let map = tx.buckets.borrow();
            crate::common::inode::write_inode_to_page(&map[path].arena.get(root_id).inodes, &mut page);
        }

        let mut value = InBucket::new(0, sequence).encode().to_vec();
        value.extend_from_slice(page.buf());
        Some(value)
    }

    /// Post-order spill of one node and its materialized descendants.
    /// Returns the pgid of the (possibly newly created) top node for
    /// this subtree after any splits.
    fn spill_node(tx: &Tx, path: &BucketPath, id: NodeId) -> Result<PgId> {
        tx.stats.inc_spill();
        let (is_leaf, children) = {
            let map = tx.buckets.borrow();
            let state = &map[path];
            let data = state.arena.get(id);
            (data.is_leaf, data.children.clone())
        };

        if !is_leaf {
            for child in children {
                let new_pgid = Self::spill_node(tx, path, child)?;
                let mut map = tx.buckets.borrow_mut();
                let state = map.get_mut(path).unwrap();
                let child_key = state.arena.get(child).key.clone();
                state.arena.put(id, &child_key, &child_key, &[], new_pgid, 0);
            }
        }

        let page_size = tx.page_size();
        let siblings = {
            let mut map = tx.buckets.borrow_mut();
            let state = map.get_mut(path).unwrap();
            state.arena.split(id, page_size)
        };
        if !siblings.is_empty() {
            tx.stats.inc_split();
        }

        let mut ids_in_order = vec![id];
        ids_in_order.extend(siblings.iter().copied());

        let mut pgids = Vec::with_capacity(ids_in_order.len());
        for &node_id in &ids_in_order {
            let size = {
                let map = tx.buckets.borrow();
                map[path].arena.size(node_id)
            };
            let page_count = size.div_ceil(page_size).max(1);
            let pgid = tx.allocate(page_count)?;
            {
                let mut dirty = tx.dirty_pages.borrow_mut();
                let page = dirty.get_mut(&pgid).unwrap();
                let mut map = tx.buckets.borrow_mut();
                let state = map.get_mut(path).unwrap();
                let data = state.arena.get(node_id);
                page.set_flags(if data.is_leaf {
                    PageFlags::LEAF_PAGE
                } else {
                    PageFlags::BRANCH_PAGE
                });
                crate::common::inode::write_inode_to_page(&data.inodes, page);
            }
            {
                let mut map = tx.buckets.borrow_mut();
                let state = map.get_mut(path).unwrap();
                state.arena.get_mut(node_id).pgid = pgid;
            }
            pgids.push(pgid);
        }

        if ids_in_order.len() == 1 {
            return Ok(pgids[0]);
        }

        // The node split: build (or extend) a branch level above it.
        let mut map = tx.buckets.borrow_mut();
        let state = map.get_mut(path).unwrap();
        let parent = state.arena.get(id).parent;
        drop(map);

        match parent {
            Some(parent_id) => {
                let mut map = tx.buckets.borrow_mut();
                let state = map.get_mut(path).unwrap();
                for (&sib, &pgid) in ids_in_order.iter().zip(pgids.iter()).skip(1) {
                    let key = state.arena.get(sib).key.clone();
                    state.arena.add_child(parent_id, sib);
                    state.arena.put(parent_id, &key, &key, &[], pgid, 0);
                }
                drop(map);
                // The parent itself still needs to be (re)spilled by its
                // own caller in `spill_node`'s post-order walk; signal
                // that by returning this node's own new pgid, the parent
                // frame will fold the siblings in during its own pass.
                Ok(pgids[0])
            }
            None => {
                let mut map = tx.buckets.borrow_mut();
                let state = map.get_mut(path).unwrap();
                let new_root = state.arena.alloc(false);
                for (&sib, &pgid) in ids_in_order.iter().zip(pgids.iter()) {
                    let key = state.arena.get(sib).key.clone();
                    state.arena.add_child(new_root, sib);
                    state.arena.put(new_root, &key, &key, &[], pgid, 0);
                }
                state.root_node = Some(new_root);
                drop(map);
                // Serialize the freshly created root directly rather
                // than recursing through `spill_node`: its children
                // were just written above and must not be re-spilled.
                Self::write_single_node(tx, path, new_root)
            }
        }
    }

    /// Serializes one already-finalized node (no further splitting or
    /// child recursion) onto a fresh page.
    fn write_single_node(tx: &Tx, path: &BucketPath, node_id: NodeId) -> Result<PgId> {
        let page_size = tx.page_size();
        let size = {
            let map = tx.buckets.borrow();
            map[path].arena.size(node_id)
        };
        let page_count = size.div_ceil(page_size).max(1);
        let pgid = tx.allocate(page_count)?;
        {
            let mut dirty = tx.dirty_pages.borrow_mut();
            let page = dirty.get_mut(&pgid).unwrap();
            let mut map = tx.buckets.borrow_mut();
            let state = map.get_mut(path).unwrap();
            let data = state.arena.get(node_id);
            page.set_flags(if data.is_leaf {
                PageFlags::LEAF_PAGE
            } else {
                PageFlags::BRANCH_PAGE
            });
            crate::common::inode::write_inode_to_page(&data.inodes, page);
        }
        let mut map = tx.buckets.borrow_mut();
        let state = map.get_mut(path).unwrap();
        state.arena.get_mut(node_id).pgid = pgid;
        Ok(pgid)
    }
}

// BucketStats records statistics about resources used by a bucket.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct BucketStats {
    pub branch_page_n: i32,
    pub branch_overflow_n: i32,
    pub leaf_page_n: i32,
    pub leaf_overflow_n: i32,

    pub key_n: i32,
    pub depth: i32,

    pub branch_alloc: i32,
    pub branch_inuse: i32,
    pub leaf_alloc: i32,
    pub leaf_inuse: i32,

    pub bucket_n: i32,
    pub inline_bucket_n: i32,
    pub inline_bucket_inuse: i32,
}

impl BucketStats {
    pub fn add(&mut self, other: BucketStats) {
        *self += other;
    }
}

impl AddAssign for BucketStats {
    fn add_assign(&mut self, other: Self) {
        self.branch_page_n += other.branch_page_n;
        self.branch_overflow_n += other.branch_overflow_n;
        self.leaf_page_n += other.leaf_page_n;
        self.leaf_overflow_n += other.leaf_overflow_n;
        self.key_n += other.key_n;
        if self.depth < other.depth {
            self.depth = other.depth;
        }
        self.branch_alloc += other.branch_alloc;
        self.branch_inuse += other.branch_inuse;
        self.leaf_alloc += other.leaf_alloc;
        self.leaf_inuse += other.leaf_inuse;

        self.bucket_n += other.bucket_n;
        self.inline_bucket_n += other.inline_bucket_n;
        self.inline_bucket_inuse += other.inline_bucket_inuse;
    }
}

/// Returns a copy of a given slice.
pub fn clone_bytes(v: &[u8]) -> Vec<u8> {
    v.to_vec()
}

#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct BucketStructure {
    pub name: String,
    pub key_n: i32,
    pub children: Vec<BucketStructure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_key_size_is_stable() {
        assert_eq!(MAX_KEY_SIZE, 32768);
    }

    #[test]
    fn bucket_stats_add_sums_fields() {
        let mut stats = BucketStats {
            bucket_n: 5,
            key_n: 2,
            ..Default::default()
        };
        let other = BucketStats {
            bucket_n: 5,
            key_n: 2,
            ..Default::default()
        };
        stats.add(other);
        assert_eq!(stats.bucket_n, 10);
        assert_eq!(stats.key_n, 4);
    }

    #[test]
    fn bucket_stats_add_assign() {
        let mut stats = BucketStats {
            bucket_n: 5,
            key_n: 2,
            ..Default::default()
        };
        let other = BucketStats {
            bucket_n: 3,
            key_n: 4,
            ..Default::default()
        };
        stats += other;
        assert_eq!(stats.bucket_n, 8);
        assert_eq!(stats.key_n, 6);
    }

    #[test]
    fn bucket_structure_holds_children() {
        let structure = BucketStructure {
            name: String::from("example"),
            key_n: 10,
            children: vec![],
        };
        assert_eq!(structure.name, "example");
        assert!(structure.children.is_empty());
    }
}
