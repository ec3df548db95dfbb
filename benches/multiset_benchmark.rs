// Compares the four strategies on the same workloads, with a varying number
// of threads sharing one multiset. Preparation (building and pre-filling the
// multiset, shuffling the keys) happens in the iter_batched setup closure so
// only the operations in the bench name are measured.

use std::thread::scope;

use conmultiset::{Multiset, MultisetBuilder, Strategy};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rand::seq::SliceRandom;
use rand::Rng;

// Distinct elements per run. Kept small, every strategy walks a linked list.
const ELEMENTS: u32 = 512;
const THREADS: &[u32] = &[1, 2, 4, 8];

type SharedMultiset = dyn Multiset<u32> + Send + Sync;

fn prepare(strategy: Strategy, filled: bool) -> (Box<SharedMultiset>, Vec<u32>) {
    let ms = MultisetBuilder::new().build::<u32>(strategy);
    let mut keys: Vec<u32> = (0..ELEMENTS).collect();
    keys.shuffle(&mut rand::rng());
    if filled {
        for k in keys.iter() {
            ms.add(*k, 4).unwrap();
        }
    }
    (ms, keys)
}

// Thread t works on every threads-th key.
fn stripe(keys: &[u32], t: u32, threads: u32) -> impl Iterator<Item = &u32> {
    keys.iter().skip(t as usize).step_by(threads as usize)
}

pub fn add(c: &mut Criterion) {
    let mut group = c.benchmark_group("add");
    group.throughput(Throughput::Elements(ELEMENTS as u64 * 2));
    for threads in THREADS {
        for strategy in Strategy::ALL {
            group.bench_with_input(
                BenchmarkId::new(strategy.to_string(), threads),
                threads,
                |b, &threads| {
                    b.iter_batched(
                        || prepare(*strategy, false),
                        |(ms, keys)| {
                            scope(|s| {
                                for t in 0..threads {
                                    let (ms, keys) = (&*ms, &keys);
                                    s.spawn(move || {
                                        for k in stripe(keys, t, threads) {
                                            ms.add_one(*k).unwrap();
                                            ms.add(*k, 3).unwrap();
                                        }
                                    });
                                }
                            });
                            ms
                        },
                        BatchSize::SmallInput,
                    )
                },
            );
        }
    }
    group.finish();
}

pub fn remove_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("remove_count");
    group.throughput(Throughput::Elements(ELEMENTS as u64 * 3));
    for threads in THREADS {
        for strategy in Strategy::ALL {
            group.bench_with_input(
                BenchmarkId::new(strategy.to_string(), threads),
                threads,
                |b, &threads| {
                    b.iter_batched(
                        || prepare(*strategy, true),
                        |(ms, keys)| {
                            scope(|s| {
                                for t in 0..threads {
                                    let (ms, keys) = (&*ms, &keys);
                                    s.spawn(move || {
                                        for k in stripe(keys, t, threads) {
                                            if ms.count(k) >= 2 {
                                                ms.remove(k, 2).unwrap();
                                            }
                                            ms.remove(k, 2).unwrap();
                                        }
                                    });
                                }
                            });
                            ms
                        },
                        BatchSize::SmallInput,
                    )
                },
            );
        }
    }
    group.finish();
}

// Half the threads remove_all a random half of the keys, the other half keep
// adding, so bulk operations contend with mutators.
pub fn remove_all_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("remove_all_mixed");
    for threads in THREADS.iter().filter(|t| **t > 1) {
        for strategy in Strategy::ALL {
            group.bench_with_input(
                BenchmarkId::new(strategy.to_string(), threads),
                threads,
                |b, &threads| {
                    b.iter_batched(
                        || {
                            let (ms, keys) = prepare(*strategy, true);
                            let mut rng = rand::rng();
                            let doomed: Vec<u32> = keys
                                .iter()
                                .copied()
                                .filter(|_| rng.random_range(0..2) == 0)
                                .collect();
                            (ms, keys, doomed)
                        },
                        |(ms, keys, doomed)| {
                            scope(|s| {
                                for t in 0..threads {
                                    let (ms, keys, doomed) = (&*ms, &keys, &doomed);
                                    s.spawn(move || {
                                        if t % 2 == 0 {
                                            ms.remove_all(doomed);
                                        } else {
                                            for k in stripe(keys, t, threads) {
                                                ms.add_one(*k).unwrap();
                                            }
                                        }
                                    });
                                }
                            });
                            ms
                        },
                        BatchSize::SmallInput,
                    )
                },
            );
        }
    }
    group.finish();
}

criterion_group!(multiset, add, remove_count, remove_all_mixed);
criterion_main!(multiset);
