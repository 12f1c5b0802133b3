// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::Arc;

use rand::distributions::{Bernoulli, Distribution};
use threadpool::ThreadPool;
use wstm::{Address, AllocResult, Region};

#[ctor::ctor]
fn init_logger() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::Debug).try_init();
}

#[test]
fn two_concurrent_disjoint_writers_both_commit() {
    let region = Arc::new(Region::create(4096, 8).unwrap());
    let a = Address::new(0, 0);
    let b = Address::new(0, 8);

    let pool = ThreadPool::new(2);
    let r1 = region.clone();
    pool.execute(move || {
        let mut tx = r1.begin(false);
        assert!(r1.write(&mut tx, &11u64.to_le_bytes(), 8, a));
        assert!(r1.end(tx));
    });
    let r2 = region.clone();
    pool.execute(move || {
        let mut tx = r2.begin(false);
        assert!(r2.write(&mut tx, &22u64.to_le_bytes(), 8, b));
        assert!(r2.end(tx));
    });
    pool.join();

    let mut reader = region.begin(true);
    let mut buf = [0u8; 8];
    assert!(region.read(&mut reader, a, 8, &mut buf));
    assert_eq!(u64::from_le_bytes(buf), 11);
    assert!(region.read(&mut reader, b, 8, &mut buf));
    assert_eq!(u64::from_le_bytes(buf), 22);
}

/// Many writers increment the same counter; a correct commit protocol means the
/// final value equals the number of writers that reported success, never more.
#[test]
fn contended_counter_increments_match_reported_commits() {
    let region = Arc::new(Region::create(64, 8).unwrap());
    let counter = region.start();
    let threads = 8;
    let per_thread = 200;

    let pool = ThreadPool::new(threads);
    let committed = Arc::new(std::sync::atomic::AtomicU64::new(0));

    for _ in 0..threads {
        let region = region.clone();
        let committed = committed.clone();
        pool.execute(move || {
            for _ in 0..per_thread {
                loop {
                    let mut tx = region.begin(false);
                    let mut buf = [0u8; 8];
                    if !region.read(&mut tx, counter, 8, &mut buf) {
                        continue;
                    }
                    let value = u64::from_le_bytes(buf) + 1;
                    if !region.write(&mut tx, &value.to_le_bytes(), 8, counter) {
                        continue;
                    }
                    if region.end(tx) {
                        committed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        break;
                    }
                }
            }
        });
    }
    pool.join();

    let mut reader = region.begin(true);
    let mut buf = [0u8; 8];
    assert!(region.read(&mut reader, counter, 8, &mut buf));
    let final_value = u64::from_le_bytes(buf);

    assert_eq!(final_value, committed.load(std::sync::atomic::Ordering::Relaxed));
    assert_eq!(final_value, (threads * per_thread) as u64);
}

/// A read-only transaction running concurrently with writers must see a value
/// that existed at some point in the commit order, never a torn or impossible one.
#[test]
fn read_only_transactions_never_observe_torn_state() {
    let region = Arc::new(Region::create(16, 8).unwrap());
    let addr = region.start();

    let pool = ThreadPool::new(4);

    for n in 1..=50u64 {
        let region = region.clone();
        pool.execute(move || loop {
            let mut tx = region.begin(false);
            if region.write(&mut tx, &n.to_le_bytes(), 8, addr) && region.end(tx) {
                break;
            }
        });
    }

    let valid: HashSet<u64> = (0..=50).collect();
    for _ in 0..500 {
        let region = region.clone();
        pool.execute(move || {
            let mut tx = region.begin(true);
            let mut buf = [0u8; 8];
            assert!(region.read(&mut tx, addr, 8, &mut buf));
            let seen = u64::from_le_bytes(buf);
            assert!(valid.contains(&seen), "read a value outside the written range: {seen}");
            assert!(region.end(tx));
        });
    }
    pool.join();
}

#[test]
fn allocation_lifecycle_with_deferred_flush() {
    let region = Region::create(64, 8).unwrap();

    let mut first = Address::new(0, 0);
    assert_eq!(region.alloc(32, &mut first), AllocResult::Success);

    let mut tx = region.begin(false);
    assert!(region.write(&mut tx, &99u64.to_le_bytes(), 8, first));
    assert!(region.end(tx));

    assert!(region.free(first));

    // the freed tag is no longer resolvable once the next alloc flushes it
    let mut second = Address::new(0, 0);
    assert_eq!(region.alloc(32, &mut second), AllocResult::Success);
    assert_ne!(first.tag, second.tag);

    let mut tx = region.begin(true);
    let mut buf = [0u8; 8];
    assert!(!region.read(&mut tx, first, 8, &mut buf));
}

#[test]
fn allocation_exhaustion_reports_nomem() {
    let region = Region::create(64, 8).unwrap();
    let mut out = Address::new(0, 0);
    let mut last = AllocResult::Success;
    for _ in 0..600 {
        last = region.alloc(8, &mut out);
        if last == AllocResult::Nomem {
            break;
        }
    }
    assert_eq!(last, AllocResult::Nomem);
}

#[test]
fn read_your_writes_across_a_span() {
    let region = Region::create(64, 8).unwrap();
    let base = region.start();

    let mut tx = region.begin(false);
    assert!(region.write(&mut tx, &[1u8; 16], 16, base));

    let mut buf = [0u8; 16];
    assert!(region.read(&mut tx, base, 16, &mut buf));
    assert_eq!(buf, [1u8; 16]);
    assert!(region.end(tx));
}

/// Bernoulli-mixed read-only/read-write traffic against one word, checking that
/// the protocol stays well-defined (no panics, no committed garbage) under load.
#[test]
fn mixed_read_write_traffic_stays_consistent() {
    let region = Arc::new(Region::create(16, 8).unwrap());
    let addr = region.start();
    let distribution = Bernoulli::new(0.3).unwrap();
    let pool = ThreadPool::new(8);

    for _ in 0..400 {
        let region = region.clone();
        let is_write = distribution.sample(&mut rand::thread_rng());
        pool.execute(move || {
            if is_write {
                loop {
                    let mut tx = region.begin(false);
                    let mut buf = [0u8; 8];
                    if !region.read(&mut tx, addr, 8, &mut buf) {
                        continue;
                    }
                    let next = u64::from_le_bytes(buf).wrapping_add(1);
                    if region.write(&mut tx, &next.to_le_bytes(), 8, addr) && region.end(tx) {
                        break;
                    }
                }
            } else {
                let mut tx = region.begin(true);
                let mut buf = [0u8; 8];
                assert!(region.read(&mut tx, addr, 8, &mut buf));
                assert!(region.end(tx));
            }
        });
    }
    pool.join();
}
