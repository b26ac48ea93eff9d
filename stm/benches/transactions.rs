// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transaction benchmarks
//!
//! Test subjects:
//! - short read / write transactions on one committed object
//! - allocation heavy transactions, exercising the nursery
//! - contended increments from several threads

use criterion::{criterion_group, criterion_main, Criterion};
use paged_stm::{Config, Engine};

fn config() -> Config {
    Config::builtin().with_segments(4).with_heap_pages(4096)
}

pub fn bnc_read_write(c: &mut Criterion) {
    let engine = Engine::setup(config()).expect("engine setup failed");
    let mut thread = engine.register_thread_local();
    thread
        .atomically(|tl| {
            let obj = tl.allocate(64)?;
            tl.push_root(obj)
        })
        .expect("setup failed");
    let obj = thread.peek_root().expect("root missing");

    c.bench_function("bench_read_write", |b| {
        b.iter(|| {
            thread
                .atomically(|tl| {
                    let value = tl.load_word(obj, 0);
                    tl.store_word(obj, 0, value + 1);
                    Ok(())
                })
                .expect("transaction failed")
        })
    });
}

pub fn bnc_allocate(c: &mut Criterion) {
    let engine = Engine::setup(config()).expect("engine setup failed");
    let mut thread = engine.register_thread_local();

    c.bench_function("bench_allocate", |b| {
        b.iter(|| {
            thread
                .atomically(|tl| {
                    for n in 0..256u64 {
                        let obj = tl.allocate(32)?;
                        tl.store_word(obj, 0, n);
                    }
                    Ok(())
                })
                .expect("transaction failed")
        })
    });
}

pub fn bnc_contended(c: &mut Criterion) {
    let engine = Engine::setup(config()).expect("engine setup failed");
    let mut main = engine.register_thread_local();
    main.atomically(|tl| {
        let obj = tl.allocate(16)?;
        tl.push_root(obj)
    })
    .expect("setup failed");
    let counter = main.peek_root().expect("root missing");

    c.bench_function("bench_contended", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let engine = engine.clone();
                    std::thread::spawn(move || {
                        let mut thread = engine.register_thread_local();
                        for _ in 0..16 {
                            thread
                                .atomically(|tl| {
                                    let value = tl.load_word(counter, 0);
                                    tl.store_word(counter, 0, value + 1);
                                    Ok(())
                                })
                                .expect("transaction failed");
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().expect("Failed to join thread");
            }
        })
    });
}

criterion_group!(benches, bnc_read_write, bnc_allocate, bnc_contended);
criterion_main!(benches);
