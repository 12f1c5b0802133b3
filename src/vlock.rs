// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The versioned lock (VL) is a single word-sized atomic that packs a 1-bit
//! lock flag into the most significant bit and a monotonic version into the
//! remaining 63 bits. One VL guards exactly one word of a [`crate::segment::Segment`].
//!
//! This is the same bit layout as `stronghold-rlu`'s `VersionLock`, just with the
//! version held in 63 bits instead of using `usize`'s full width, since the C ABI
//! documents the version as a 63-bit natural number.

use std::sync::atomic::{AtomicU64, Ordering};

const LOCK_BIT: u64 = 1 << 63;
const VERSION_MASK: u64 = !LOCK_BIT;

/// A versioned spin-lock: one atomic word, bounded acquisition, never blocks.
#[derive(Debug)]
pub struct VersionLock {
    raw: AtomicU64,
}

impl VersionLock {
    /// Creates a new, unlocked lock carrying `version`.
    pub fn new(version: u64) -> Self {
        debug_assert!(version & LOCK_BIT == 0, "version does not fit in 63 bits");
        Self {
            raw: AtomicU64::new(version & VERSION_MASK),
        }
    }

    /// Samples the lock state and version in one atomic read.
    pub fn sample(&self) -> (bool, u64) {
        let raw = self.raw.load(Ordering::Acquire);
        (raw & LOCK_BIT != 0, raw & VERSION_MASK)
    }

    /// Returns just the version, ignoring the lock bit.
    pub fn version(&self) -> u64 {
        self.sample().1
    }

    /// Returns whether the lock is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        self.sample().0
    }

    /// Attempts to set the lock bit while leaving the version untouched, retrying
    /// up to [`crate::consts::SPIN_BOUND`] times. Never mutates the word on failure.
    pub fn acquire(&self) -> bool {
        for _ in 0..crate::consts::SPIN_BOUND {
            let raw = self.raw.load(Ordering::Relaxed);
            if raw & LOCK_BIT != 0 {
                std::hint::spin_loop();
                continue;
            }
            let desired = raw | LOCK_BIT;
            if self
                .raw
                .compare_exchange_weak(raw, desired, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Clears the lock bit, preserving the version. The caller must hold the lock.
    pub fn release(&self) {
        let prev = self.raw.fetch_and(VERSION_MASK, Ordering::Release);
        if prev & LOCK_BIT == 0 {
            log::error!("released a version lock that was not held");
            debug_assert!(false, "double release of VersionLock");
        }
    }

    /// Atomically installs `version` and clears the lock bit in one store. The caller
    /// must hold the lock; since the holder has exclusive write rights a plain store
    /// is sufficient, no CAS is needed.
    pub fn publish(&self, version: u64) {
        debug_assert!(version & LOCK_BIT == 0, "version overflowed into the lock bit");
        self.raw.store(version & VERSION_MASK, Ordering::Release);
    }
}

impl Default for VersionLock {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::VersionLock;
    use std::sync::Arc;
    use threadpool::ThreadPool;

    #[test]
    fn acquire_release_preserves_version() {
        let lock = VersionLock::new(7);
        assert!(lock.acquire());
        assert!(lock.is_locked());
        assert_eq!(lock.version(), 7);
        lock.release();
        assert!(!lock.is_locked());
        assert_eq!(lock.version(), 7);
    }

    #[test]
    fn publish_sets_version_and_unlocks() {
        let lock = VersionLock::new(0);
        assert!(lock.acquire());
        lock.publish(42);
        assert!(!lock.is_locked());
        assert_eq!(lock.version(), 42);
    }

    #[test]
    fn contended_acquire_fails_bounded() {
        let lock = VersionLock::new(0);
        assert!(lock.acquire());
        // a second acquire must fail within SPIN_BOUND attempts rather than block
        assert!(!lock.acquire());
        lock.release();
    }

    #[test]
    fn concurrent_acquire_release_is_exclusive() {
        let lock = Arc::new(VersionLock::new(0));
        let pool = ThreadPool::new(8);
        let rounds = 2000;

        for _ in 0..rounds {
            let lock = lock.clone();
            pool.execute(move || {
                while !lock.acquire() {
                    std::hint::spin_loop();
                }
                let before = lock.version();
                lock.publish(before + 1);
            });
        }
        pool.join();

        assert_eq!(lock.version(), rounds as u64);
    }
}
