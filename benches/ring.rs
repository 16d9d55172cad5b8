// Copyright 2025 Google LLC
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

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;

use digistream::ring::Ring;

fn bench_uncontended_cycle(c: &mut Criterion) {
    let ring: Ring<u64> = Ring::new(4096);
    c.bench_function("ring_write_read_cycle", |b| {
        b.iter(|| {
            let mut slot = ring.acquire_write();
            *slot = 42;
            slot.commit_relaxed();
            let slot = ring.acquire_read(Some(Duration::ZERO)).unwrap();
            let value = *slot;
            slot.commit_relaxed();
            value
        })
    });
}

fn bench_cross_thread_throughput(c: &mut Criterion) {
    c.bench_function("ring_cross_thread_100k", |b| {
        b.iter(|| {
            let ring: Arc<Ring<u64>> = Arc::new(Ring::new(4096));
            let producer = {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for value in 0..100_000u64 {
                        let mut slot = ring.acquire_write();
                        *slot = value;
                        slot.commit_relaxed();
                    }
                    let mut slot = ring.acquire_write();
                    *slot = u64::MAX;
                    slot.commit();
                })
            };
            let mut total = 0u64;
            loop {
                let slot = ring.acquire_read(None).unwrap();
                let value = *slot;
                slot.commit_relaxed();
                if value == u64::MAX {
                    break;
                }
                total = total.wrapping_add(value);
            }
            producer.join().unwrap();
            total
        })
    });
}

criterion_group!(benches, bench_uncontended_cycle, bench_cross_thread_throughput);
criterion_main!(benches);
