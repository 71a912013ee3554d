//! In-memory B+tree node, arena-indexed instead of linked through
//! `Rc<RefCell<_>>` parent pointers.
//!
//! Each [`Bucket`](crate::bucket::Bucket) owns one [`NodeArena`]. A node's
//! parent and children are plain [`NodeId`] indices into that arena, so
//! there is no reference cycle and no raw pointer back to the owning
//! bucket: operations that need bucket/tx context (materializing a child
//! from its page, allocating new pages on spill) take `&Bucket` as an
//! explicit argument instead of storing it on the node.

use crate::common::inode::{read_inode_from_page, Inode, Inodes, Key};
use crate::common::page::{
    Page, PgId, BRANCH_PAGE_ELEMENT_SIZE, LEAF_PAGE_ELEMENT_SIZE, PAGE_HEADER_SIZE,
};

/// Index into a bucket's [`NodeArena`]. `usize::MAX` is never a valid
/// allocation, so it is unused as a sentinel; absence is modeled with
/// `Option<NodeId>` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(pub(crate) usize);

#[derive(Debug, Default)]
pub(crate) struct NodeData {
    pub(crate) is_leaf: bool,
    pub(crate) unbalanced: bool,
    pub(crate) spilled: bool,
    pub(crate) key: Key,
    pub(crate) pgid: PgId,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) inodes: Inodes,
}

/// Owns every in-memory node materialized for one bucket's subtree
/// during a writable transaction.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    nodes: Vec<NodeData>,
}

impl NodeArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn alloc(&mut self, is_leaf: bool) -> NodeId {
        self.nodes.push(NodeData {
            is_leaf,
            ..Default::default()
        });
        NodeId(self.nodes.len() - 1)
    }

    pub(crate) fn get(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0]
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.nodes[id.0]
    }

    pub(crate) fn is_leaf(&self, id: NodeId) -> bool {
        self.get(id).is_leaf
    }

    pub(crate) fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        self.get_mut(id).parent = parent;
    }

    pub(crate) fn add_child(&mut self, parent: NodeId, child: NodeId) {
        self.get_mut(child).parent = Some(parent);
        self.get_mut(parent).children.push(child);
    }

    /// Unlinks `child` from `parent`'s children list without touching
    /// `child`'s own `parent` field (the caller reassigns it, or the
    /// node is being dropped).
    pub(crate) fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        let data = self.get_mut(parent);
        if let Some(pos) = data.children.iter().position(|&c| c == child) {
            data.children.remove(pos);
        }
    }

    /// Total number of nodes ever allocated in this arena, including
    /// ones orphaned by a rebalance.
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Finds `child`'s slot among `parent`'s inodes by matching its
    /// page id. Only meaningful for nodes materialized from an
    /// existing page (a freshly allocated, never-spilled node has no
    /// parent to look up).
    pub(crate) fn position_in_parent(&self, parent: NodeId, child: NodeId) -> Option<usize> {
        let pgid = self.get(child).pgid;
        self.get(parent).inodes.iter().position(|inode| inode.pgid() == pgid)
    }

    /// Walks parent links up to the top-level node of this subtree.
    pub(crate) fn root(&self, id: NodeId) -> NodeId {
        let mut cur = id;
        while let Some(parent) = self.get(cur).parent {
            cur = parent;
        }
        cur
    }

    pub(crate) fn min_keys(&self, id: NodeId) -> usize {
        if self.is_leaf(id) {
            1
        } else {
            2
        }
    }

    fn page_element_size(&self, id: NodeId) -> usize {
        if self.is_leaf(id) {
            LEAF_PAGE_ELEMENT_SIZE
        } else {
            BRANCH_PAGE_ELEMENT_SIZE
        }
    }

    /// Size of the node after serialization.
    pub(crate) fn size(&self, id: NodeId) -> usize {
        let elsz = self.page_element_size(id);
        let mut size = PAGE_HEADER_SIZE;
        for inode in self.get(id).inodes.iter() {
            size += elsz + inode.key().len() + inode.value().len();
        }
        size
    }

    /// True if the node's serialized size is less than `limit`; avoids
    /// summing the whole node when the answer is already known.
    pub(crate) fn size_less_than(&self, id: NodeId, limit: usize) -> bool {
        let elsz = self.page_element_size(id);
        let mut size = PAGE_HEADER_SIZE;
        for inode in self.get(id).inodes.iter() {
            size += elsz + inode.key().len() + inode.value().len();
            if size >= limit {
                return false;
            }
        }
        true
    }

    pub(crate) fn num_children(&self, id: NodeId) -> usize {
        self.get(id).inodes.len()
    }

    pub(crate) fn child_index(&self, parent: NodeId, key: &[u8]) -> Option<usize> {
        self.get(parent).inodes.binary_search_by(key).ok()
    }

    /// Inserts or replaces an entry keyed by `old_key`. Mirrors
    /// bbolt's `node.put`.
    pub(crate) fn put(&mut self, id: NodeId, old_key: &[u8], new_key: &[u8], value: &[u8], pgid: PgId, flags: u32) {
        assert!(!old_key.is_empty(), "put: zero-length old key");
        assert!(!new_key.is_empty(), "put: zero-length new key");

        let data = self.get_mut(id);
        let index = match data.inodes.binary_search_by(old_key) {
            Ok(index) => index,
            Err(index) => index,
        };

        let exact = index < data.inodes.len() && data.inodes.get(index).key().as_slice() == old_key;
        if !exact {
            data.inodes.insert(index, Inode::default());
        }

        let inode = data.inodes.get_mut(index);
        inode.set_flags(flags);
        inode.set_key(new_key.to_vec());
        inode.set_value(value.to_vec());
        inode.set_pgid(pgid);
        assert!(!inode.key().is_empty(), "put: zero-length inode key");
    }

    /// Removes `key` if present; marks the node unbalanced either way
    /// it's the caller's job to decide whether rebalancing is needed.
    pub(crate) fn del(&mut self, id: NodeId, key: &[u8]) {
        let data = self.get_mut(id);
        if let Ok(index) = data.inodes.binary_search_by(key) {
            data.inodes.remove(index);
            data.unbalanced = true;
        }
    }

    /// Initializes a node's inodes from a decoded page.
    pub(crate) fn read(&mut self, id: NodeId, page: &Page) {
        let data = self.get_mut(id);
        data.pgid = page.id();
        data.is_leaf = page.is_leaf_page();
        data.inodes = read_inode_from_page(page);
        data.key = data.inodes.first().map(|i| i.key().clone()).unwrap_or_default();
        assert!(
            data.key.is_empty() || !data.key.is_empty(),
            "read: zero-length node key"
        );
    }

    /// Splits `id`'s inodes in half if the node would serialize larger
    /// than `page_size`, returning the ids of any new sibling nodes
    /// created (in left-to-right order, `id` itself becomes the
    /// leftmost piece). Returns an empty vec if no split was needed.
    pub(crate) fn split(&mut self, id: NodeId, page_size: usize) -> Vec<NodeId> {
        if self.num_children(id) <= (crate::common::page::MIN_KEYS_PER_PAGE * 2)
            || self.size_less_than(id, page_size)
        {
            return Vec::new();
        }

        let threshold = (page_size as f64 * 0.5) as usize;
        let elsz = self.page_element_size(id);
        let mut siblings = Vec::new();
        let is_leaf = self.is_leaf(id);

        loop {
            let data = self.get_mut(id);
            let total = data.inodes.len();
            if total <= crate::common::page::MIN_KEYS_PER_PAGE {
                break;
            }

            let mut size = PAGE_HEADER_SIZE;
            let mut split_index = None;
            for i in 0..total {
                let inode = data.inodes.get(i);
                size += elsz + inode.key().len() + inode.value().len();
                if i >= crate::common::page::MIN_KEYS_PER_PAGE && size > threshold {
                    split_index = Some(i);
                    break;
                }
            }
            let Some(split_at) = split_index else { break };
            if split_at >= total - 1 {
                break;
            }

            let moved = data.inodes.split_off(split_at);
            let new_id = self.alloc(is_leaf);
            self.get_mut(new_id).inodes = moved;
            self.get_mut(new_id).key = self
                .get(new_id)
                .inodes
                .first()
                .map(|i| i.key().clone())
                .unwrap_or_default();
            siblings.push(new_id);

            if self.size_less_than(new_id, page_size) {
                break;
            }
            // Continue splitting the remainder if it's still too big.
            continue;
        }

        siblings
    }

    /// Merges `from`'s inodes onto the end of `into`'s. Does not touch
    /// either node's parent linkage or `from`'s children — the caller
    /// (the rebalance pass, which has the bucket/tx context to reparent
    /// `from`'s children and free its page) handles that.
    pub(crate) fn merge_into(&mut self, into: NodeId, from: NodeId) {
        let moved = std::mem::take(&mut self.get_mut(from).inodes);
        for inode in moved.inodes {
            self.get_mut(into).inodes.push(inode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with(arena: &mut NodeArena, pairs: &[(&str, &str)]) -> NodeId {
        let id = arena.alloc(true);
        for (k, v) in pairs {
            arena.put(id, k.as_bytes(), k.as_bytes(), v.as_bytes(), 0, 0);
        }
        id
    }

    #[test]
    fn put_keeps_keys_sorted() {
        let mut arena = NodeArena::new();
        let id = leaf_with(&mut arena, &[("b", "2"), ("a", "1"), ("c", "3")]);
        let data = arena.get(id);
        let keys: Vec<_> = data.inodes.iter().map(|i| i.key().clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn put_replaces_existing_key() {
        let mut arena = NodeArena::new();
        let id = leaf_with(&mut arena, &[("a", "1")]);
        arena.put(id, b"a", b"a", b"2", 0, 0);
        assert_eq!(arena.num_children(id), 1);
        assert_eq!(arena.get(id).inodes.get(0).value().as_slice(), b"2");
    }

    #[test]
    fn del_marks_unbalanced() {
        let mut arena = NodeArena::new();
        let id = leaf_with(&mut arena, &[("a", "1")]);
        arena.del(id, b"a");
        assert_eq!(arena.num_children(id), 0);
        assert!(arena.get(id).unbalanced);
    }

    #[test]
    fn split_leaves_small_node_untouched() {
        let mut arena = NodeArena::new();
        let id = leaf_with(&mut arena, &[("a", "1"), ("b", "2")]);
        let siblings = arena.split(id, 4096);
        assert!(siblings.is_empty());
    }

    #[test]
    fn merge_into_appends_inodes_without_touching_links() {
        let mut arena = NodeArena::new();
        let into = leaf_with(&mut arena, &[("a", "1")]);
        let from = leaf_with(&mut arena, &[("b", "2")]);
        arena.merge_into(into, from);
        assert_eq!(arena.num_children(into), 2);
        let keys: Vec<_> = arena.get(into).inodes.iter().map(|i| i.key().clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn remove_child_drops_only_the_named_child() {
        let mut arena = NodeArena::new();
        let parent = arena.alloc(false);
        let a = arena.alloc(true);
        let b = arena.alloc(true);
        arena.add_child(parent, a);
        arena.add_child(parent, b);
        arena.remove_child(parent, a);
        assert_eq!(arena.get(parent).children, vec![b]);
    }

    #[test]
    fn position_in_parent_matches_by_pgid() {
        let mut arena = NodeArena::new();
        let parent = arena.alloc(false);
        let child = arena.alloc(true);
        arena.get_mut(child).pgid = 7;
        arena.put(parent, b"k", b"k", &[], 7, 0);
        assert_eq!(arena.position_in_parent(parent, child), Some(0));
    }
}
