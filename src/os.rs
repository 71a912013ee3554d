//! Platform-specific constants and file-level primitives (locking,
//! durable sync) that the DB layer builds on.

use std::fs::File;
use std::io;
use std::time::{Duration, Instant};

use fs4::FileExt;
use log::warn;

use crate::errors::{Error, Result};

#[cfg(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "powerpc64",
    target_arch = "mips64",
    target_arch = "loongarch64"
))]
/// Largest mmap size supported on 64-bit architectures.
pub const MAX_MAP_SIZE: u64 = 0xFFFFFFFFFFFF; // 256TB

#[cfg(any(
    target_arch = "x86",
    target_arch = "arm",
    target_arch = "mips",
    target_arch = "powerpc"
))]
/// Largest mmap size supported on 32-bit architectures.
pub const MAX_MAP_SIZE: u64 = 0x7FFFFFFF; // 2GB

/// Largest size used when sizing array-backed buffers (freelists,
/// page arrays).
pub const MAX_ALLOC_SIZE: u64 = 0x7FFFFFFF;

/// Acquires an advisory exclusive (or shared, for read-only databases)
/// lock on `file`, retrying until `timeout` elapses. A `timeout` of
/// zero blocks indefinitely, matching bbolt's `flock` semantics
/// (`original_source`'s `storage_unix_aix.go`/`storage_windows.go`).
pub(crate) fn flock(file: &File, exclusive: bool, timeout: Duration) -> Result<()> {
    let deadline = if timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + timeout)
    };
    let retry_delay = Duration::from_millis(50);

    loop {
        let attempt = if exclusive {
            file.try_lock_exclusive()
        } else {
            file.try_lock_shared()
        };

        match attempt {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        warn!(
                            "timed out after {:?} waiting for the {} file lock",
                            timeout,
                            if exclusive { "exclusive" } else { "shared" }
                        );
                        return Err(Error::Timeout);
                    }
                }
                std::thread::sleep(retry_delay);
            }
            Err(e) => return Err(Error::from(e)),
        }
    }
}

/// Releases a lock previously taken with [`flock`].
pub(crate) fn funlock(file: &File) -> Result<()> {
    file.unlock().map_err(Error::from)
}

/// Forces file contents to stable storage. On OpenBSD (no unified
/// buffer cache) this must run even when `Options::no_sync` is unset
/// for mmap'd data, matching `common::types::IGNORE_NO_SYNC`.
pub(crate) fn fdatasync(file: &File) -> Result<()> {
    file.sync_data().map_err(Error::from)
}
