// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use paged_stm::{Config, Engine, ObjRef, StmError, ThreadLocal};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use threadpool::ThreadPool;

#[cfg(test)]
#[ctor::ctor]
/// This function will be run before any of the tests
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

fn engine(segments: usize) -> Arc<Engine> {
    let config = Config::builtin()
        .with_segments(segments)
        .with_heap_pages(1024)
        .with_nursery_pages(16);
    Engine::setup(config).expect("engine setup failed")
}

/// Commits a fresh object of `words` data words, kept alive on the root stack of `thread`
fn shared_object(thread: &mut ThreadLocal, words: usize) -> ObjRef {
    thread
        .atomically(|tl| {
            let obj = tl.allocate(8 + words * 8)?;
            tl.push_root(obj)
        })
        .expect("failed to create shared object");
    thread.peek_root().expect("root missing")
}

#[test]
fn test_four_threads_linked_pairs() {
    let engine = engine(4);
    let mut main = engine.register_thread_local();
    let pair = shared_object(&mut main, 2);
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for id in 0..4u64 {
        let engine = engine.clone();
        let completed = completed.clone();

        handles.push(std::thread::spawn(move || {
            let mut thread = engine.register_thread_local();

            // first transaction: build a -> b
            thread
                .atomically(|tl| {
                    let a = tl.allocate_tagged(16, 1)?;
                    tl.push_root(a)?;
                    let b = tl.allocate(16)?;
                    let a = tl.peek_root().expect("root missing");
                    tl.store_word(b, 0, id * 100);
                    tl.store_ref(a, 0, b);

                    let (x, y) = (tl.load_word(pair, 0), tl.load_word(pair, 8));
                    assert_eq!(x, y, "observed a partially written pair");
                    tl.store_word(pair, 0, x + 1);
                    tl.store_word(pair, 8, y + 1);
                    Ok(())
                })
                .expect("first transaction failed");

            let a = thread.peek_root().expect("root missing");
            assert!(engine.layout().is_old(a.addr()));

            // second transaction: the previous writes are visible
            thread
                .atomically(|tl| {
                    let b = tl.load_ref(a, 0);
                    assert!(!b.is_null());
                    let value = tl.load_word(b, 0);
                    assert_eq!(value, id * 100);
                    tl.store_word(b, 0, value + 1);

                    let (x, y) = (tl.load_word(pair, 0), tl.load_word(pair, 8));
                    assert_eq!(x, y, "observed a partially written pair");
                    tl.store_word(pair, 0, x + 1);
                    tl.store_word(pair, 8, y + 1);
                    Ok(())
                })
                .expect("second transaction failed");

            let value = thread
                .atomically(|tl| {
                    let b = tl.load_ref(a, 0);
                    Ok(tl.load_word(b, 0))
                })
                .expect("read transaction failed");
            assert_eq!(value, id * 100 + 1);

            completed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    for handle in handles {
        handle.join().expect("Failed to join thread");
    }
    assert_eq!(completed.load(Ordering::SeqCst), 4);

    let (x, y) = main
        .atomically(|tl| Ok((tl.load_word(pair, 0), tl.load_word(pair, 8))))
        .expect("read transaction failed");
    assert_eq!((x, y), (8, 8));

    drop(main);
    Engine::teardown(engine).expect("engine still in use");
}

#[test]
fn test_concurrent_counter_is_serializable() {
    const JOBS: usize = 200;

    let engine = engine(4);
    let mut main = engine.register_thread_local();
    let counter = shared_object(&mut main, 1);
    engine.add_permanent_root(counter).expect("counter is not old");

    let pool = ThreadPool::new(8);
    for _ in 0..JOBS {
        let engine = engine.clone();
        pool.execute(move || {
            let mut thread = engine.register_thread_local();
            thread
                .atomically(|tl| {
                    let value = tl.load_word(counter, 0);
                    tl.safe_point()?;
                    tl.store_word(counter, 0, value + 1);
                    Ok(())
                })
                .expect("increment failed");
        });
    }
    pool.join();
    assert_eq!(pool.panic_count(), 0);

    let value = main
        .atomically(|tl| Ok(tl.load_word(counter, 0)))
        .expect("read transaction failed");
    assert_eq!(value, JOBS as u64);

    let stats = engine.stats();
    assert!(stats.commits >= JOBS as u64);
    assert_eq!(engine.revision() as usize, JOBS + 1);
}

#[test]
fn test_more_threads_than_segments() {
    let engine = engine(2);
    let mut main = engine.register_thread_local();
    let cells = shared_object(&mut main, 8);

    let handles: Vec<_> = (0..8usize)
        .map(|n| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                let mut thread = engine.register_thread_local();
                for _ in 0..10 {
                    thread
                        .atomically(|tl| {
                            let value = tl.load_word(cells, n * 8);
                            tl.store_word(cells, n * 8, value + 1);
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

    let values = main
        .atomically(|tl| Ok((0..8).map(|n| tl.load_word(cells, n * 8)).collect::<Vec<_>>()))
        .expect("read transaction failed");
    assert_eq!(values, vec![10; 8]);
}

#[test]
fn test_teardown_with_live_thread_fails() {
    let engine = engine(1);
    let thread = engine.register_thread_local();

    assert!(matches!(Engine::teardown(engine.clone()), Err(StmError::Protocol(_))));
    thread.unregister();
    Engine::teardown(engine).expect("engine still in use");
}
