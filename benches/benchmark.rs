// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Benchmarks for the oblivious data structures.
//!
//! Besides wall time, each structure's operation costs are reported as
//! tables of the exported `memory_access_count` and
//! `memory_bytes_moved_total` counters, measured per operation.

extern crate criterion;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::fmt::Display;
use std::time::Duration;

use ods::crypto::EncryptionKey;
use ods::path_oheap::{Block as HeapBlock, OHeap};
use ods::path_omap::OMap;
use ods::path_oram::{Block, OramOptions, PathOram};
use rand::{rngs::StdRng, SeedableRng};

const CAPACITIES_TO_BENCHMARK: [usize; 3] = [1 << 8, 1 << 10, 1 << 12];
const VALUE_LEN: usize = 4;

/// Counter access shared by every structure under benchmark.
trait Instrumented {
    fn access_count(&self) -> u64;
    fn bytes_moved(&self) -> u64;
    fn short_name() -> String;
}

impl Instrumented for PathOram<VALUE_LEN> {
    fn access_count(&self) -> u64 {
        self.memory_access_count()
    }

    fn bytes_moved(&self) -> u64 {
        self.memory_bytes_moved_total()
    }

    fn short_name() -> String {
        "PathOram".into()
    }
}

impl Instrumented for OMap {
    fn access_count(&self) -> u64 {
        self.memory_access_count()
    }

    fn bytes_moved(&self) -> u64 {
        self.memory_bytes_moved_total()
    }

    fn short_name() -> String {
        "OMap".into()
    }
}

impl Instrumented for OHeap {
    fn access_count(&self) -> u64 {
        self.memory_access_count()
    }

    fn bytes_moved(&self) -> u64 {
        self.memory_bytes_moved_total()
    }

    fn short_name() -> String {
        "OHeap".into()
    }
}

criterion_group!(
    name = benches;
    config = Criterion::default().warm_up_time(Duration::new(0, 1_000_000_00)).measurement_time(Duration::new(0, 1_000_000_00)).sample_size(10);
    targets =
    benchmark_oram_insert_and_read,
    benchmark_omap_operations,
    benchmark_oheap_operations,
    count_oram_accesses,
    count_omap_accesses,
    count_oheap_accesses,
);
criterion_main!(benches);

fn benchmark_oram_insert_and_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("PathOram::read");
    let mut rng = StdRng::seed_from_u64(0);
    let enc_key = EncryptionKey::generate(&mut rng);

    for capacity in CAPACITIES_TO_BENCHMARK {
        let mut oram = PathOram::<VALUE_LEN>::new(
            capacity,
            OramOptions {
                position_map: true,
                ..Default::default()
            },
        )
        .unwrap();
        oram.insert(Block::new(0, 1, [7; VALUE_LEN]), &enc_key, &mut rng)
            .unwrap();

        group.bench_function(BenchmarkId::from_parameter(capacity), |b| {
            b.iter(|| oram.read(Block::query(0, 1), &enc_key, &mut rng).unwrap())
        });
    }
    group.finish();
}

fn benchmark_omap_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("OMap::insert+read");
    let mut rng = StdRng::seed_from_u64(0);
    let enc_key = EncryptionKey::generate(&mut rng);

    for capacity in CAPACITIES_TO_BENCHMARK {
        let mut map = OMap::new(capacity).unwrap();
        let mut next_key = 1u32;

        group.bench_function(BenchmarkId::from_parameter(capacity), |b| {
            b.iter(|| {
                let key = next_key % 64 + 1;
                next_key += 1;
                map.insert(key, key, &enc_key, &mut rng).unwrap();
                map.read(key, &enc_key, &mut rng).unwrap()
            })
        });
    }
    group.finish();
}

fn benchmark_oheap_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("OHeap::insert+extract_min");
    let mut rng = StdRng::seed_from_u64(0);
    let enc_key = EncryptionKey::generate(&mut rng);

    for capacity in CAPACITIES_TO_BENCHMARK {
        let mut heap = OHeap::new(capacity).unwrap();
        let mut next_key = 1u32;

        group.bench_function(BenchmarkId::from_parameter(capacity), |b| {
            b.iter(|| {
                next_key += 1;
                heap.insert(HeapBlock::new(0, next_key, next_key), &enc_key, &mut rng)
                    .unwrap();
                heap.extract_min(&enc_key, &mut rng).unwrap()
            })
        });
    }
    group.finish();
}

fn count_accesses_on_operation<T: Instrumented, F: Fn(usize) -> T, G: Fn(&mut T)>(
    make: F,
    operation: G,
    operation_name: &str,
) {
    println!();
    println!(
        "Counter cost of 1 {}::{} per capacity:",
        T::short_name(),
        operation_name
    );
    print_table_row("Capacity", "Accesses", "Bytes moved");

    for capacity in CAPACITIES_TO_BENCHMARK {
        let mut structure = make(capacity);

        let accesses_before = structure.access_count();
        let bytes_before = structure.bytes_moved();

        operation(&mut structure);

        print_table_row(
            capacity,
            structure.access_count() - accesses_before,
            structure.bytes_moved() - bytes_before,
        );
    }
}

fn count_oram_accesses(_: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0);
    let enc_key = EncryptionKey::generate(&mut rng);

    count_accesses_on_operation(
        |capacity| {
            let mut rng = StdRng::seed_from_u64(1);
            let mut oram = PathOram::<VALUE_LEN>::new(
                capacity,
                OramOptions {
                    position_map: true,
                    ..Default::default()
                },
            )
            .unwrap();
            oram.insert(Block::new(0, 1, [7; VALUE_LEN]), &enc_key, &mut rng)
                .unwrap();
            oram
        },
        |oram| {
            let mut rng = StdRng::seed_from_u64(2);
            oram.read(Block::query(0, 1), &enc_key, &mut rng).unwrap();
        },
        "read",
    );
}

fn count_omap_accesses(_: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0);
    let enc_key = EncryptionKey::generate(&mut rng);

    count_accesses_on_operation(
        |capacity| OMap::new(capacity).unwrap(),
        |map| {
            let mut rng = StdRng::seed_from_u64(2);
            map.insert(1, 1, &enc_key, &mut rng).unwrap();
        },
        "insert",
    );
}

fn count_oheap_accesses(_: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0);
    let enc_key = EncryptionKey::generate(&mut rng);

    count_accesses_on_operation(
        |capacity| OHeap::new(capacity).unwrap(),
        |heap| {
            let mut rng = StdRng::seed_from_u64(2);
            heap.insert(HeapBlock::new(0, 1, 1), &enc_key, &mut rng)
                .unwrap();
        },
        "insert",
    );
}

fn print_table_row<A: Display, B: Display, C: Display>(s1: A, s2: B, s3: C) {
    println!("{0: <15} | {1: <15} | {2: <15}", s1, s2, s3)
}
