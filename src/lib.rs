//! An embedded, single-file, memory-mapped key/value storage engine
//! with ACID transactions and MVCC concurrency, built around a
//! persistent B+tree (the bbolt/LMDB lineage).
//!
//! ```no_run
//! use barrowdb::DB;
//!
//! let db = DB::open("my.db")?;
//! db.update(|tx| {
//!     let bucket = tx.create_bucket_if_not_exists(b"widgets")?;
//!     bucket.put(b"foo", b"bar")
//! })?;
//! db.view(|tx| {
//!     let bucket = tx.bucket(b"widgets")?;
//!     assert_eq!(bucket.get(b"foo").as_deref(), Some(&b"bar"[..]));
//!     Ok(())
//! })?;
//! # Ok::<(), barrowdb::Error>(())
//! ```

mod bucket;
mod common;
pub mod cursor;
pub mod db;
mod errors;
mod freelist;
mod node;
mod os;
mod sync_util;
#[cfg(test)]
mod testing;
pub mod tx;

pub use bucket::{Bucket, BucketStats};
pub use cursor::Cursor;
pub use db::{Info, Options, Stats, DB};
pub use errors::{Error, Result};
pub use tx::{Tx, TxStats};
