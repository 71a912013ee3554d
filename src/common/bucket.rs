//! The on-disk descriptor stored as the "value" of a bucket's key in its
//! parent bucket.

use std::fmt;
use std::mem;

use bytemuck::{Pod, Zeroable};

use crate::common::page::{Page, PgId};

pub(crate) const BUCKET_HEADER_SIZE: usize = mem::size_of::<InBucket>();

/// The on-file representation of a bucket. If the bucket is small
/// enough, its root page is stored inline in the value bytes right
/// after this header, and `root` is left at 0.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct InBucket {
    root: PgId,
    sequence: u64,
}

impl InBucket {
    pub(crate) fn new(root: PgId, sequence: u64) -> Self {
        Self { root, sequence }
    }

    pub(crate) fn decode(buf: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&buf[..BUCKET_HEADER_SIZE])
    }

    pub(crate) fn encode(&self) -> [u8; BUCKET_HEADER_SIZE] {
        let mut out = [0u8; BUCKET_HEADER_SIZE];
        out.copy_from_slice(bytemuck::bytes_of(self));
        out
    }

    pub(crate) fn root_page(&self) -> PgId {
        self.root
    }

    pub(crate) fn set_root_page(&mut self, id: PgId) {
        self.root = id;
    }

    /// Named `in_sequence` rather than `sequence` to avoid colliding
    /// with `Bucket::sequence()`.
    pub(crate) fn in_sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_in_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub(crate) fn inc_sequence(&mut self) {
        self.sequence += 1;
    }

    pub(crate) fn is_inline(&self) -> bool {
        self.root == 0
    }

    /// Views the inline page stored right after this header in `v`.
    pub(crate) fn inline_page<'a>(&self, v: &'a [u8]) -> Page<'a> {
        Page::from_buf(&v[BUCKET_HEADER_SIZE..])
    }
}

impl fmt::Display for InBucket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<pgid={},seq={}>", self.root, self.sequence)
    }
}

impl From<InBucket> for String {
    fn from(bucket: InBucket) -> String {
        bucket.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let b = InBucket::new(7, 42);
        let bytes = b.encode();
        let decoded = InBucket::decode(&bytes);
        assert_eq!(decoded.root_page(), 7);
        assert_eq!(decoded.in_sequence(), 42);
    }

    #[test]
    fn inline_detection() {
        assert!(InBucket::new(0, 0).is_inline());
        assert!(!InBucket::new(3, 0).is_inline());
    }
}
