// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The region ties segments, the global clock and the commit protocol together.
//! This is the component most transactions spend their time in.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::address::Address;
use crate::consts::{MAX_INITIAL_SEGMENT_SIZE, MAX_SEGMENTS, RO_VALIDATE_ATTEMPTS};
use crate::error::StmError;
use crate::handler::Handler;
use crate::segment::Segment;

/// Outcome of [`Region::alloc`]: success, out of segment tags, or a transient abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocResult {
    Success,
    Nomem,
    Abort,
}

struct SegmentLists {
    live: Vec<u16>,
    pending_free: Vec<u16>,
}

/// Spins on `mutex.try_lock()` up to `SPIN_BOUND` times rather than blocking, serving
/// as the region's bounded segment-lifecycle lock. Mirrors `stronghold-stm`'s
/// `TVar::bounded_lock`, generalised from a single `TVar` to the region's
/// live/pending-free list bookkeeping.
fn bounded_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    for _ in 0..crate::consts::SPIN_BOUND {
        if let Ok(guard) = mutex.try_lock() {
            return Some(guard);
        }
        std::hint::spin_loop();
    }
    None
}

/// The shared memory region: a global clock, a segment table, and the coarse lock
/// guarding segment allocation and deferred reclamation.
pub struct Region {
    alignment: u64,
    clock: AtomicU64,
    segments: Vec<RwLock<Option<Arc<Segment>>>>,
    next_tag: AtomicU32,
    next_handler: AtomicU64,
    lists: Mutex<SegmentLists>,
}

impl Region {
    /// Creates a region with one initial, non-freeable segment of `size` bytes.
    pub fn create(size: u64, align: u64) -> Result<Self, StmError> {
        if align == 0 || (align & (align - 1)) != 0 {
            return Err(StmError::InvalidRegionConfig {
                reason: "alignment must be a non-zero power of two",
            });
        }
        if size == 0 || size % align != 0 {
            return Err(StmError::Misaligned { size, align });
        }
        if size > MAX_INITIAL_SEGMENT_SIZE {
            return Err(StmError::InvalidRegionConfig {
                reason: "initial segment exceeds the maximum segment size",
            });
        }

        let segments: Vec<_> = (0..MAX_SEGMENTS).map(|_| RwLock::new(None)).collect();
        let first = Segment::new(0, size, align);
        *segments[0].write().unwrap() = Some(Arc::new(first));

        log::debug!("region created: size={size} align={align}");

        Ok(Self {
            alignment: align,
            clock: AtomicU64::new(0),
            segments,
            next_tag: AtomicU32::new(1),
            next_handler: AtomicU64::new(0),
            lists: Mutex::new(SegmentLists {
                live: vec![0],
                pending_free: Vec::new(),
            }),
        })
    }

    /// Consumes the region. Precondition: no transaction is still in flight against it.
    pub fn destroy(self) {
        log::debug!("region destroyed");
    }

    pub fn start(&self) -> Address {
        Address::new(0, 0)
    }

    pub fn size(&self) -> u64 {
        self.segment(0).expect("segment 0 always exists").size()
    }

    pub fn align(&self) -> u64 {
        self.alignment
    }

    fn segment(&self, tag: u16) -> Option<Arc<Segment>> {
        self.segments.get(tag as usize)?.read().unwrap().clone()
    }

    fn word_index(&self, addr: Address) -> usize {
        (addr.offset / self.alignment) as usize
    }

    /// Begins a transaction, sampling the current clock as its read version.
    pub fn begin(&self, is_ro: bool) -> Handler {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        let rv = self.clock.load(Ordering::SeqCst);
        log::trace!("begin tx={id} is_ro={is_ro} rv={rv}");
        Handler::new(id, is_ro, rv)
    }

    /// Ends a transaction, running the commit protocol for read-write transactions
    /// with a non-empty write set. Read-only transactions, and read-write ones that
    /// never wrote anything, always succeed.
    pub fn end(&self, h: Handler) -> bool {
        if h.is_ro || h.write_set_is_empty() {
            return true;
        }
        let ok = self.commit(&h);
        log::trace!("end tx={} committed={}", h.id, ok);
        ok
    }

    pub fn read(&self, h: &mut Handler, src: Address, n: u64, dst: &mut [u8]) -> bool {
        if n == 0 {
            return true;
        }
        if n % self.alignment != 0 {
            log::error!("read size {n} is not a multiple of the region alignment");
            return false;
        }
        if h.is_ro {
            self.ro_read(h, src, n, dst)
        } else {
            self.rw_read(h, src, n, dst)
        }
    }

    pub fn write(&self, h: &mut Handler, src: &[u8], n: u64, dest: Address) -> bool {
        if h.is_ro {
            log::error!("write attempted on a read-only transaction");
            return false;
        }
        if n == 0 {
            return true;
        }
        if n % self.alignment != 0 {
            log::error!("write size {n} is not a multiple of the region alignment");
            return false;
        }
        let Some(seg) = self.segment(dest.tag) else {
            log::error!("write to unknown segment tag {}", dest.tag);
            return false;
        };
        let start = self.word_index(dest);
        let n_words = (n / self.alignment) as usize;
        if start + n_words > seg.word_count() {
            log::error!("write out of bounds at word {} of segment {}", start + n_words, seg.tag());
            return false;
        }
        let data = src[..n as usize].to_vec().into_boxed_slice();
        h.add_write(dest, data, n);
        true
    }

    /// Validates every entry in the read set against the current state of its lock,
    /// used both by `end`'s phase 3 and by the read-only retry loop.
    fn validate_read_set(&self, h: &Handler) -> bool {
        for &addr in h.read_set() {
            let Some(seg) = self.segment(addr.tag) else {
                return false;
            };
            let idx = self.word_index(addr);
            let (_, version) = seg.lock(idx).sample();
            if version > h.rv {
                return false;
            }
        }
        true
    }

    fn ro_read(&self, h: &mut Handler, src: Address, n: u64, dst: &mut [u8]) -> bool {
        let Some(seg) = self.segment(src.tag) else {
            log::error!("read from unknown segment tag {}", src.tag);
            return false;
        };
        let word_bytes = self.alignment as usize;
        let n_words = (n / self.alignment) as usize;

        for i in 0..n_words {
            let word_addr = src.offset_words(i as u64, self.alignment);
            let idx = self.word_index(word_addr);
            if idx >= seg.word_count() {
                log::error!("read out of bounds at word {idx} of segment {}", seg.tag());
                return false;
            }
            let chunk = &mut dst[i * word_bytes..(i + 1) * word_bytes];
            seg.read_word(idx, chunk);

            let mut attempts = 0;
            loop {
                let (locked, version) = seg.lock(idx).sample();
                if !locked && version <= h.rv {
                    break;
                }
                // the word moved out from under us: extend the read version and retry,
                // as long as everything read so far is still consistent with it.
                let ts = self.clock.load(Ordering::SeqCst);
                if !self.validate_read_set(h) {
                    return false;
                }
                h.rv = ts;
                seg.read_word(idx, chunk);
                attempts += 1;
                if attempts >= RO_VALIDATE_ATTEMPTS {
                    return false;
                }
            }
            h.add_read(word_addr);
        }
        true
    }

    fn rw_read(&self, h: &mut Handler, src: Address, n: u64, dst: &mut [u8]) -> bool {
        let Some(seg) = self.segment(src.tag) else {
            log::error!("read from unknown segment tag {}", src.tag);
            return false;
        };
        let word_bytes = self.alignment as usize;
        let n_words = (n / self.alignment) as usize;

        for i in 0..n_words {
            let word_addr = src.offset_words(i as u64, self.alignment);
            let chunk = &mut dst[i * word_bytes..(i + 1) * word_bytes];

            // a word this transaction already wrote is served straight from the
            // write set, never touching the VL or the shared buffer at all.
            if let Some(speculative) = h.find_write_word(word_addr, self.alignment) {
                chunk.copy_from_slice(speculative);
                continue;
            }

            let idx = self.word_index(word_addr);
            if idx >= seg.word_count() {
                log::error!("read out of bounds at word {idx} of segment {}", seg.tag());
                return false;
            }

            let (locked, version) = seg.lock(idx).sample();
            if locked || version > h.rv {
                return false;
            }

            h.add_read(word_addr);
            seg.read_word(idx, chunk);
        }
        true
    }

    /// The five-phase TL2 commit: lock the write set, bump the clock, validate the
    /// read set, write back, publish and unlock.
    fn commit(&self, h: &Handler) -> bool {
        let mut locked: Vec<(Arc<Segment>, usize)> = Vec::new();

        // Phase 1: lock every word in the write set, de-duplicated, bounded-spin.
        for entry in h.write_set() {
            let Some(seg) = self.segment(entry.dest.tag) else {
                log::error!("commit referenced unknown segment tag {}", entry.dest.tag);
                release_all(&locked);
                return false;
            };
            let start = self.word_index(entry.dest);
            let n_words = (entry.size / self.alignment) as usize;
            if start + n_words > seg.word_count() {
                log::error!("commit write out of bounds at word {} of segment {}", start + n_words, seg.tag());
                release_all(&locked);
                return false;
            }
            for w in 0..n_words {
                let idx = start + w;
                if locked.iter().any(|(s, i)| Arc::ptr_eq(s, &seg) && *i == idx) {
                    continue;
                }
                if !seg.lock(idx).acquire() {
                    log::debug!("tx={} aborted: could not lock word {idx}", h.id);
                    release_all(&locked);
                    return false;
                }
                locked.push((seg.clone(), idx));
            }
        }

        // Phase 2: bump the global clock.
        let wv = self.clock.fetch_add(1, Ordering::SeqCst) + 1;

        // Phase 3: validate the read set, unless no other commit interleaved.
        if wv != h.rv + 1 {
            for &addr in h.read_set() {
                let Some(seg) = self.segment(addr.tag) else {
                    release_all(&locked);
                    return false;
                };
                let idx = self.word_index(addr);
                let (word_locked, version) = seg.lock(idx).sample();
                if version > h.rv {
                    log::debug!("tx={} aborted: read set stale", h.id);
                    release_all(&locked);
                    return false;
                }
                let held_by_us = locked.iter().any(|(s, i)| Arc::ptr_eq(s, &seg) && *i == idx);
                if word_locked && !held_by_us {
                    log::debug!("tx={} aborted: read word locked by another writer", h.id);
                    release_all(&locked);
                    return false;
                }
            }
        }

        // Phase 4: commit writes into place.
        for entry in h.write_set() {
            let seg = self.segment(entry.dest.tag).expect("validated in phase 1");
            let start = self.word_index(entry.dest);
            let n_words = (entry.size / self.alignment) as usize;
            let word_bytes = self.alignment as usize;
            for w in 0..n_words {
                let chunk = &entry.data[w * word_bytes..(w + 1) * word_bytes];
                seg.write_word(start + w, chunk);
            }
        }

        // Phase 5: publish the new version and release every lock we took.
        for (seg, idx) in &locked {
            seg.lock(*idx).publish(wv);
        }

        log::trace!("tx={} committed at version {wv}", h.id);
        true
    }

    /// Allocates a new segment of `n` bytes, returning its base address through `out`.
    pub fn alloc(&self, n: u64, out: &mut Address) -> AllocResult {
        if n == 0 || n % self.alignment != 0 {
            log::error!("alloc size {n} is not a non-zero multiple of the region alignment");
            return AllocResult::Abort;
        }

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        if tag as usize >= MAX_SEGMENTS as usize {
            log::warn!("alloc failed: segment table exhausted");
            return AllocResult::Nomem;
        }

        let segment = Segment::new(tag as u16, n, self.alignment);

        let Some(mut guard) = bounded_lock(&self.lists) else {
            log::debug!("alloc aborted: could not acquire the segment-lifecycle lock");
            return AllocResult::Abort;
        };
        self.flush_pending_free(&mut guard);
        *self.segments[tag as usize].write().unwrap() = Some(Arc::new(segment));
        guard.live.push(tag as u16);
        drop(guard);

        *out = Address::new(tag as u16, 0);
        log::debug!("alloc: segment {tag} ({n} bytes)");
        AllocResult::Success
    }

    /// Moves a segment from the live list to the pending-free list. The memory is
    /// actually released the next time `alloc` runs the flush. Freeing the initial
    /// segment (tag 0) is a documented no-op: it is never freeable.
    ///
    /// A transaction that already resolved this tag (mid `read`/`write`) keeps its
    /// own reference alive until that call returns; a later call against the same
    /// tag sees it cleared. Freeing a segment another thread is still actively
    /// reading is never undefined behaviour: it surfaces as that thread's next
    /// operation against the tag failing cleanly.
    pub fn free(&self, target: Address) -> bool {
        if target.tag == 0 {
            return true;
        }
        let Some(mut guard) = bounded_lock(&self.lists) else {
            log::debug!("free aborted: could not acquire the segment-lifecycle lock");
            return false;
        };
        if let Some(pos) = guard.live.iter().position(|&t| t == target.tag) {
            guard.live.remove(pos);
            guard.pending_free.push(target.tag);
        }
        drop(guard);
        log::debug!("free: segment {}", target.tag);
        true
    }

    /// Drops the underlying buffer of every segment on the pending-free list. Called
    /// with the lifecycle lock held, right before a new segment is published, so
    /// reclamation piggybacks on the next successful allocation.
    fn flush_pending_free(&self, guard: &mut MutexGuard<'_, SegmentLists>) {
        for tag in guard.pending_free.drain(..) {
            if let Some(seg) = self.segments[tag as usize].write().unwrap().take() {
                log::trace!("flushed segment {tag}, refcount was {}", Arc::strong_count(&seg));
            }
        }
    }
}

fn release_all(locked: &[(Arc<Segment>, usize)]) {
    for (seg, idx) in locked {
        seg.lock(*idx).release();
    }
}
