// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use keylock::config::LockingConfig;
use keylock::locking::{LockManager, WaitStrategyKind};
use std::thread;
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(30);
const TIMEOUT: Duration = Duration::from_secs(30);

fn manager(kind: WaitStrategyKind) -> LockManager {
    LockManager::new(&LockingConfig {
        wait_strategy: kind,
        ..LockingConfig::default()
    })
}

pub fn bench_uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended");
    let manager = manager(WaitStrategyKind::Condvar);

    group.bench_function("acquire_release", |b| {
        b.iter(|| {
            let handle = manager.acquire(black_box("doc"), LEASE, TIMEOUT).unwrap();
            handle.release()
        })
    });

    group.bench_function("try_acquire_release", |b| {
        b.iter(|| {
            let handle = manager.try_acquire(black_box("doc"), LEASE).unwrap().unwrap();
            handle.release()
        })
    });

    let outer = manager.acquire("doc", LEASE, TIMEOUT).unwrap();
    group.bench_function("reentrant_acquire_release", |b| {
        b.iter(|| {
            let handle = manager.acquire(black_box("doc"), LEASE, TIMEOUT).unwrap();
            handle.release()
        })
    });
    drop(outer);

    group.finish();
}

pub fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended");
    group.sample_size(20);

    for kind in [WaitStrategyKind::Condvar, WaitStrategyKind::EntryUnit] {
        for threads in [2usize, 8] {
            let manager = manager(kind);
            group.bench_with_input(
                BenchmarkId::new(kind.to_string(), threads),
                &threads,
                |b, &threads| {
                    b.iter(|| {
                        thread::scope(|scope| {
                            for _ in 0..threads {
                                scope.spawn(|| {
                                    for _ in 0..20 {
                                        let handle =
                                            manager.acquire("hot", LEASE, TIMEOUT).unwrap();
                                        handle.release();
                                    }
                                });
                            }
                        });
                    })
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_uncontended, bench_contended);
criterion_main!(benches);
