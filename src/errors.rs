//! Error variables that may be returned during engine operations.

use std::io;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError, PartialEq)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(String),
    #[error("resize failed")]
    ResizeFail,
    #[error("tx managed")]
    TxManaged,
    #[error("stack empty")]
    StackEmpty,
    #[error("check failed, {0}")]
    CheckFailed(String),

    #[error("{0}")]
    Unexpected(&'static str),

    // Errors returned when opening or calling methods on a DB.
    /// Returned when a DB instance is accessed before it is opened or
    /// after it is closed.
    #[error("database not open")]
    DatabaseNotOpen,

    /// Returned when both meta pages on a database are invalid. Usually
    /// means the file isn't a database this engine wrote.
    #[error("invalid database")]
    Invalid,

    #[error("database isn't correctly mapped")]
    InvalidMapping,

    /// The data file was created with a different version of this
    /// format.
    #[error("version mismatch")]
    VersionMismatch,

    /// Either meta page's checksum does not match its contents.
    #[error("checksum error")]
    Checksum,

    /// The database could not obtain an exclusive lock on the data
    /// file before `Options::timeout` elapsed.
    #[error("timeout")]
    Timeout,

    // Errors that occur when beginning or committing a Tx.
    #[error("tx not writable")]
    TxNotWritable,

    /// Committing or rolling back a transaction that has already been
    /// committed or rolled back.
    #[error("tx closed")]
    TxClosed,

    /// A mutating transaction was started on a read-only database.
    #[error("database is in read-only mode")]
    DatabaseReadOnly,

    /// A read-only transaction without preloaded free pages tried to
    /// access them.
    #[error("free pages are not pre-loaded")]
    FreePagesNotLoaded,

    // Errors that occur when putting or deleting a value or a bucket.
    #[error("bucket not found")]
    BucketNotFound,

    #[error("bucket already exists")]
    BucketExists,

    #[error("bucket name required")]
    BucketNameRequired,

    /// Inserting a zero-length key.
    #[error("key required")]
    KeyRequired,

    /// Inserting a key larger than `MAX_KEY_SIZE`.
    #[error("key too large")]
    KeyTooLarge,

    /// Inserting a value larger than `MAX_VALUE_SIZE`.
    #[error("value too large")]
    ValueTooLarge,

    /// Creating or deleting a bucket on an existing non-bucket key, or
    /// vice versa.
    #[error("incompatible value")]
    IncompatibleValue,

    #[error("the source and target are the same bucket")]
    SameBuckets,

    #[error("the source and target buckets are in different database files")]
    DifferentDB,
}

impl From<io::Error> for Error {
    #[inline]
    fn from(e: io::Error) -> Self {
        Self::Io(e.kind().to_string())
    }
}

impl From<&'static str> for Error {
    #[inline]
    fn from(s: &'static str) -> Self {
        Self::Unexpected(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
