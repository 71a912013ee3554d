//! In-memory node entries (`Inode`), and their marshalling to/from a
//! page buffer.

use std::result::Result;
use std::slice::Iter;

use crate::common::page::{BranchPageElement, LeafPageElement, OwnedPage, Page, PgId};
use crate::common::types::Byte;

pub(crate) type Key = Vec<Byte>;
pub(crate) type Value = Vec<Byte>;

/// An internal node entry: either a leaf key/value pair, or a branch
/// routing entry (key plus the child pgid it leads to).
#[derive(Debug, Default, Clone)]
pub(crate) struct Inode {
    flags: u32,
    pgid: PgId,
    key: Key,
    value: Value,
}

impl Inode {
    pub(crate) fn new_leaf(flags: u32, key: Key, value: Value) -> Self {
        Inode {
            flags,
            pgid: 0,
            key,
            value,
        }
    }

    pub(crate) fn new_branch(pgid: PgId, key: Key) -> Self {
        Inode {
            flags: 0,
            pgid,
            key,
            value: Vec::new(),
        }
    }

    pub(crate) fn flags(&self) -> u32 {
        self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub(crate) fn is_bucket_entry(&self) -> bool {
        (self.flags & crate::common::page::BUCKET_LEAF_FLAG) != 0
    }

    pub(crate) fn key(&self) -> &Key {
        &self.key
    }

    pub(crate) fn set_key(&mut self, key: Key) {
        self.key = key;
    }

    pub(crate) fn value(&self) -> &Value {
        &self.value
    }

    pub(crate) fn set_value(&mut self, value: Value) {
        self.value = value;
    }

    pub(crate) fn pgid(&self) -> PgId {
        self.pgid
    }

    pub(crate) fn set_pgid(&mut self, pgid: PgId) {
        self.pgid = pgid;
    }
}

#[derive(Default, Debug, Clone)]
pub(crate) struct Inodes {
    pub(crate) inodes: Vec<Inode>,
}

impl Inodes {
    pub(crate) fn len(&self) -> usize {
        self.inodes.len()
    }

    pub(crate) fn get(&self, index: usize) -> &Inode {
        &self.inodes[index]
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut Inode {
        &mut self.inodes[index]
    }

    pub(crate) fn first(&self) -> Option<&Inode> {
        self.inodes.first()
    }

    pub(crate) fn insert(&mut self, index: usize, inode: Inode) {
        self.inodes.insert(index, inode);
    }

    pub(crate) fn push(&mut self, inode: Inode) {
        self.inodes.push(inode);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    pub(crate) fn remove(&mut self, index: usize) {
        self.inodes.remove(index);
    }

    pub(crate) fn iter(&self) -> Iter<'_, Inode> {
        self.inodes.iter()
    }

    pub(crate) fn binary_search_by(&self, key: &[u8]) -> Result<usize, usize> {
        self.inodes
            .binary_search_by(|node| node.key.as_slice().cmp(key))
    }

    pub(crate) fn as_slice(&self) -> &[Inode] {
        &self.inodes
    }

    pub(crate) fn split_off(&mut self, at: usize) -> Inodes {
        Inodes {
            inodes: self.inodes.split_off(at),
        }
    }
}

/// Reads every entry off a page into an `Inodes` list.
pub(crate) fn read_inode_from_page(page: &Page) -> Inodes {
    let mut inodes = Vec::with_capacity(page.count());
    let is_leaf = page.is_leaf_page();

    for i in 0..page.count() {
        let inode = if is_leaf {
            let elem = page.leaf_element(i);
            Inode::new_leaf(
                elem.flags,
                page.leaf_key(i).to_vec(),
                page.leaf_value(i).to_vec(),
            )
        } else {
            let elem = page.branch_element(i);
            Inode::new_branch(elem.pgid, page.branch_key(i).to_vec())
        };

        assert!(!inode.key.is_empty(), "read: zero-length inode key");
        inodes.push(inode);
    }

    Inodes { inodes }
}

/// Writes every entry onto a page buffer that has already been sized
/// to hold them (header + element array + key/value bytes). Returns
/// the total number of bytes used.
pub(crate) fn write_inode_to_page(inodes: &Inodes, page: &mut OwnedPage) -> u32 {
    page.set_count(inodes.len() as u16);

    let element_size = page.as_page().page_element_size();
    let is_leaf = page.as_page().is_leaf_page();
    let mut offset = element_size * inodes.len();

    for (i, item) in inodes.iter().enumerate() {
        assert!(!item.key().is_empty(), "write: zero-length inode key");

        let elem_off = crate::common::page::PAGE_HEADER_SIZE + i * element_size;
        let pos = (offset - i * element_size) as u32;

        if is_leaf {
            page.write_leaf_element(
                i,
                LeafPageElement {
                    flags: item.flags(),
                    pos,
                    ksize: item.key().len() as u32,
                    vsize: item.value().len() as u32,
                },
            );
        } else {
            assert!(
                item.pgid() != page.as_page().id(),
                "write: circular dependency occurred"
            );
            page.write_branch_element(
                i,
                BranchPageElement {
                    pos,
                    ksize: item.key().len() as u32,
                    pgid: item.pgid(),
                },
            );
        }

        let kv_start = elem_off + pos as usize;
        page.write_bytes_at(kv_start, item.key());
        page.write_bytes_at(kv_start + item.key().len(), item.value());

        offset += item.key().len() + item.value().len();
    }

    offset as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::page::PageFlags;

    #[test]
    fn leaf_round_trip() {
        let mut inodes = Inodes::default();
        inodes.push(Inode::new_leaf(0, b"alpha".to_vec(), b"1".to_vec()));
        inodes.push(Inode::new_leaf(0, b"beta".to_vec(), b"22".to_vec()));

        let mut page = OwnedPage::new(4096);
        page.set_flags(PageFlags::LEAF_PAGE);
        write_inode_to_page(&inodes, &mut page);

        let decoded = read_inode_from_page(&page.as_page());
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.get(0).key().as_slice(), b"alpha");
        assert_eq!(decoded.get(0).value().as_slice(), b"1");
        assert_eq!(decoded.get(1).key().as_slice(), b"beta");
        assert_eq!(decoded.get(1).value().as_slice(), b"22");
    }

    #[test]
    fn branch_round_trip() {
        let mut inodes = Inodes::default();
        inodes.push(Inode::new_branch(5, b"k1".to_vec()));
        inodes.push(Inode::new_branch(9, b"k2".to_vec()));

        let mut page = OwnedPage::new(4096);
        page.set_id(1);
        page.set_flags(PageFlags::BRANCH_PAGE);
        write_inode_to_page(&inodes, &mut page);

        let decoded = read_inode_from_page(&page.as_page());
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.get(0).pgid(), 5);
        assert_eq!(decoded.get(1).pgid(), 9);
    }
}
