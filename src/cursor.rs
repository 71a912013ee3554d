//! Ordered iteration over a bucket's key/value pairs (spec.md §4.6).
//!
//! A cursor holds a root-to-leaf stack of `(node, index)` pairs, the
//! same shape `bucket::descend` produces. `next`/`prev` walk the stack
//! instead of re-descending from the root each time; `seek` and
//! `first`/`last` rebuild it. Keys and values returned are only valid
//! for the life of the transaction the cursor was created from.

use crate::bucket::{descend, get_or_load_node, Bucket, BucketState};
use crate::errors::{Error, Result};
use crate::node::NodeId;
use crate::tx::Tx;

/// One entry yielded while iterating: key, value, and the entry's raw
/// flags (bit `BUCKET_LEAF_FLAG` set means `value` is an encoded
/// `InBucket`, not caller data).
pub type CursorItem = (Vec<u8>, Vec<u8>, u32);

pub struct Cursor<'tx> {
    bucket: Bucket<'tx>,
    stack: Vec<(NodeId, usize)>,
}

impl<'tx> Cursor<'tx> {
    pub(crate) fn new(bucket: Bucket<'tx>) -> Self {
        Cursor {
            bucket,
            stack: Vec::new(),
        }
    }

    pub fn bucket(&self) -> &Bucket<'tx> {
        &self.bucket
    }

    /// Positions on the first entry in the bucket, in key order.
    pub fn first(&mut self) -> Option<CursorItem> {
        let tx = self.bucket.tx;
        let mut map = tx.buckets.borrow_mut();
        let state = map.get_mut(&self.bucket.path)?;
        self.stack.clear();
        if state.is_empty() {
            return None;
        }

        let mut cur = root_node_id(tx, state);
        loop {
            self.stack.push((cur, 0));
            if state.arena.is_leaf(cur) {
                break;
            }
            let child_pgid = state.arena.get(cur).inodes.get(0).pgid();
            let parent = cur;
            cur = get_or_load_node(tx, state, child_pgid, Some(parent));
        }
        drop(map);
        self.current()
    }

    /// Positions on the last entry in the bucket, in key order.
    pub fn last(&mut self) -> Option<CursorItem> {
        let tx = self.bucket.tx;
        let mut map = tx.buckets.borrow_mut();
        let state = map.get_mut(&self.bucket.path)?;
        self.stack.clear();
        if state.is_empty() {
            return None;
        }

        let mut cur = root_node_id(tx, state);
        loop {
            let idx = state.arena.num_children(cur).saturating_sub(1);
            self.stack.push((cur, idx));
            if state.arena.is_leaf(cur) {
                break;
            }
            let child_pgid = state.arena.get(cur).inodes.get(idx).pgid();
            let parent = cur;
            cur = get_or_load_node(tx, state, child_pgid, Some(parent));
        }
        drop(map);
        self.current()
    }

    /// Positions on the first entry at or after `key`.
    pub fn seek(&mut self, key: &[u8]) -> Option<CursorItem> {
        let tx = self.bucket.tx;
        let mut map = tx.buckets.borrow_mut();
        let state = map.get_mut(&self.bucket.path)?;
        if state.is_empty() {
            self.stack.clear();
            return None;
        }
        self.stack = descend(tx, state, key);
        drop(map);
        self.current().or_else(|| self.next())
    }

    /// Advances to the next entry in key order.
    pub fn next(&mut self) -> Option<CursorItem> {
        if self.stack.is_empty() {
            return self.first();
        }
        let tx = self.bucket.tx;
        let mut map = tx.buckets.borrow_mut();
        let state = map.get_mut(&self.bucket.path)?;
        if let Some(top) = self.stack.last_mut() {
            top.1 += 1;
        }
        fix_stack_forward(tx, state, &mut self.stack);
        drop(map);
        self.current()
    }

    /// Moves to the previous entry in key order.
    pub fn prev(&mut self) -> Option<CursorItem> {
        let tx = self.bucket.tx;
        let mut map = tx.buckets.borrow_mut();
        let state = map.get_mut(&self.bucket.path)?;

        loop {
            match self.stack.last_mut() {
                None => return None,
                Some(top) if top.1 > 0 => {
                    top.1 -= 1;
                    break;
                }
                Some(_) => {
                    self.stack.pop();
                }
            }
        }

        loop {
            let &(node, idx) = self.stack.last().unwrap();
            if state.arena.is_leaf(node) {
                break;
            }
            let child_pgid = state.arena.get(node).inodes.get(idx).pgid();
            let child = get_or_load_node(tx, state, child_pgid, Some(node));
            let last_idx = state.arena.num_children(child).saturating_sub(1);
            self.stack.push((child, last_idx));
        }

        drop(map);
        self.current()
    }

    /// Removes the entry the cursor is currently positioned on. Errors
    /// if it names a nested bucket; a no-op if the cursor isn't
    /// positioned on a valid entry.
    pub fn delete(&mut self) -> Result<()> {
        if !self.bucket.writable() {
            return Err(Error::TxNotWritable);
        }
        let tx = self.bucket.tx;
        let mut map = tx.buckets.borrow_mut();
        let state = map
            .get_mut(&self.bucket.path)
            .ok_or(Error::BucketNotFound)?;

        let Some(&(node, idx)) = self.stack.last() else {
            return Ok(());
        };
        if !state.arena.is_leaf(node) {
            return Ok(());
        }
        let data = state.arena.get(node);
        if idx >= data.inodes.len() {
            return Ok(());
        }
        if data.inodes.get(idx).is_bucket_entry() {
            return Err(Error::IncompatibleValue);
        }
        let key = data.inodes.get(idx).key().clone();
        state.arena.del(node, &key);
        Ok(())
    }

    fn current(&self) -> Option<CursorItem> {
        let tx = self.bucket.tx;
        let map = tx.buckets.borrow();
        let state = map.get(&self.bucket.path)?;
        let &(node, idx) = self.stack.last()?;
        if !state.arena.is_leaf(node) {
            return None;
        }
        let data = state.arena.get(node);
        if idx >= data.inodes.len() {
            return None;
        }
        let inode = data.inodes.get(idx);
        Some((inode.key().clone(), inode.value().clone(), inode.flags()))
    }
}

fn root_node_id(tx: &Tx, state: &mut BucketState) -> NodeId {
    match state.root_node {
        Some(id) => id,
        None => {
            let id = get_or_load_node(tx, state, state.info.root_page(), None);
            state.root_node = Some(id);
            id
        }
    }
}

/// Climbs the stack past any exhausted levels (index past the node's
/// last child), then descends leftmost from whatever level is still
/// valid. Leaves the stack empty if there's nothing left to visit.
fn fix_stack_forward(tx: &Tx, state: &mut BucketState, stack: &mut Vec<(NodeId, usize)>) {
    while let Some(&(node, idx)) = stack.last() {
        if idx < state.arena.num_children(node) {
            break;
        }
        stack.pop();
        if let Some(parent) = stack.last_mut() {
            parent.1 += 1;
        }
    }

    while let Some(&(node, idx)) = stack.last() {
        if state.arena.is_leaf(node) {
            break;
        }
        let child_pgid = state.arena.get(node).inodes.get(idx).pgid();
        let child = get_or_load_node(tx, state, child_pgid, Some(node));
        stack.push((child, 0));
    }
}
