//!
//! Shared on-disk types: page layout, meta record, bucket descriptor,
//! and in-memory inode marshalling.
//!

pub(crate) mod bucket;
pub(crate) mod inode;
pub(crate) mod meta;
pub(crate) mod page;
pub(crate) mod types;

pub(crate) use self::bucket::InBucket;
pub(crate) use self::meta::Meta;
pub(crate) use self::page::{Page, PgId, PAGE_HEADER_SIZE};
pub(crate) use self::types::TxId;

/// Decodes a byte slice as a bucket descriptor (the payload of a
/// bucket-flagged leaf value).
pub(crate) fn load_bucket(buf: &[u8]) -> InBucket {
    InBucket::decode(buf)
}

/// Wraps a byte slice as a page view.
pub(crate) fn load_page(buf: &[u8]) -> Page<'_> {
    Page::from_buf(buf)
}

/// Decodes the meta record embedded in a meta page's body.
pub(crate) fn load_page_meta(buf: &[u8]) -> Meta {
    Meta::decode(&buf[PAGE_HEADER_SIZE..])
}
