//! Hand-rolled concurrency gates used instead of RAII guard types.
//!
//! A `parking_lot::MutexGuard` borrowed from an `Arc<DbInner>` cannot be
//! stored inside a `Tx` that also owns a clone of that same `Arc` — the
//! borrow and the owner would have to live in the same struct. bbolt's Go
//! source sidesteps this by pairing `sync.Mutex.Lock()`/`Unlock()` calls
//! manually instead of deferring an unlock; these types do the same thing
//! in Rust, trading away the guard's drop-safety for the ability to hold
//! the lock across a `Tx`'s lifetime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A lock that is acquired and released with explicit calls instead of
/// a scope-bound guard. Used for the single-writer mutex and the meta
/// mutex (spec.md §5).
pub(crate) struct RawGate {
    locked: Mutex<bool>,
    cond: Condvar,
}

impl RawGate {
    pub(crate) fn new() -> Self {
        RawGate {
            locked: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the gate is free, then marks it held.
    pub(crate) fn lock(&self) {
        let mut held = self.locked.lock();
        while *held {
            self.cond.wait(&mut held);
        }
        *held = true;
    }

    /// Marks the gate free and wakes one waiter. Caller must have
    /// called `lock()` first; calling `unlock()` without a matching
    /// `lock()` is a logic error but not memory-unsafe.
    pub(crate) fn unlock(&self) {
        let mut held = self.locked.lock();
        *held = false;
        self.cond.notify_one();
    }
}

impl Default for RawGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader-counted gate guarding the mmap region: any number of readers
/// may hold it at once, but a remap must wait until the count drops to
/// zero before unmapping and remapping (spec.md §5's mmap lock).
pub(crate) struct MmapGate {
    readers: AtomicUsize,
    remap_pending: Mutex<bool>,
    cond: Condvar,
}

impl MmapGate {
    pub(crate) fn new() -> Self {
        MmapGate {
            readers: AtomicUsize::new(0),
            remap_pending: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Called when a transaction begins; blocks if a remap is in
    /// flight so new readers don't observe a mid-remap mapping.
    pub(crate) fn enter_reader(&self) {
        let mut pending = self.remap_pending.lock();
        while *pending {
            self.cond.wait(&mut pending);
        }
        self.readers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn exit_reader(&self) {
        let prev = self.readers.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "reader count underflow");
        self.cond.notify_all();
    }

    /// Blocks until every current reader has exited, marks a remap as
    /// pending (so new readers wait), and returns. Call
    /// `finish_remap()` once the new mapping is installed.
    pub(crate) fn begin_remap(&self) {
        let mut pending = self.remap_pending.lock();
        *pending = true;
        drop(pending);

        while self.readers.load(Ordering::SeqCst) > 0 {
            let mut pending = self.remap_pending.lock();
            self.cond.wait_for(&mut pending, Duration::from_millis(5));
        }
    }

    pub(crate) fn finish_remap(&self) {
        let mut pending = self.remap_pending.lock();
        *pending = false;
        self.cond.notify_all();
    }
}

impl Default for MmapGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn raw_gate_serializes_access() {
        let gate = Arc::new(RawGate::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                gate.lock();
                let before = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(before, counter.load(Ordering::SeqCst) - 1);
                gate.unlock();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn mmap_gate_remap_waits_for_readers() {
        let gate = Arc::new(MmapGate::new());
        gate.enter_reader();
        let g2 = gate.clone();
        let handle = thread::spawn(move || {
            g2.begin_remap();
            g2.finish_remap();
        });
        thread::sleep(Duration::from_millis(20));
        gate.exit_reader();
        handle.join().unwrap();
    }
}
