// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, Criterion};
use wstm::Region;

fn bench_disjoint_writes(c: &mut Criterion) {
    let region = Region::create(4096, 8).unwrap();
    let addr = region.start();

    c.bench_function("single_writer_commit", |b| {
        b.iter(|| {
            let mut tx = region.begin(false);
            region.write(&mut tx, &1u64.to_le_bytes(), 8, addr);
            region.end(tx)
        })
    });
}

fn bench_read_only(c: &mut Criterion) {
    let region = Region::create(4096, 8).unwrap();
    let addr = region.start();
    let mut setup = region.begin(false);
    region.write(&mut setup, &1u64.to_le_bytes(), 8, addr);
    region.end(setup);

    c.bench_function("read_only_commit", |b| {
        b.iter(|| {
            let mut tx = region.begin(true);
            let mut buf = [0u8; 8];
            region.read(&mut tx, addr, 8, &mut buf);
            region.end(tx)
        })
    });
}

criterion_group!(benches, bench_disjoint_writes, bench_read_only);
criterion_main!(benches);
