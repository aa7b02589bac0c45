use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use KeelDB::memory::{NativeMemoryCleaner, NativeMemoryPool};

const HOUR: Duration = Duration::from_secs(3600);

#[test]
fn idle_buffers_are_reclaimed_rented_ones_are_not() {
    let pool = NativeMemoryPool::new(256);
    let cleaner = NativeMemoryCleaner::new(HOUR, HOUR);
    cleaner.register(&pool);

    let held = pool.rent();
    drop(pool.rent());
    assert_eq!(pool.tracked_items(), 2);

    let fresh = cleaner.run_tick();
    assert!(!fresh.skipped);
    assert_eq!(fresh.pools, 1);
    assert_eq!(fresh.reclaimed, 0, "returned buffer is not idle yet");

    // час спустя по часам пула, без реального ожидания
    let idle_ms = HOUR.as_millis() as u64;
    let tick = pool.reclaim_at(pool.now_ms() + idle_ms, idle_ms, false);
    assert_eq!(tick.reclaimed, 1);
    assert_eq!(tick.reclaimed_bytes, 256);
    assert!(!held.item().is_disposed());
    assert!(held.item().is_in_use());
    assert_eq!(pool.tracked_items(), 1);

    // освобождённый элемент больше не выдаётся
    let again = pool.rent();
    assert!(!Arc::ptr_eq(again.item(), held.item()));
    assert!(!again.item().is_disposed());
    assert_eq!(again.len(), 256);
}

#[test]
fn low_memory_reclaims_regardless_of_idle_time() {
    let pool = NativeMemoryPool::new(64);
    let cleaner = NativeMemoryCleaner::new(HOUR, HOUR);
    cleaner.register(&pool);
    drop(pool.rent());

    assert_eq!(cleaner.run_tick().reclaimed, 0);

    cleaner.low_memory().raise();
    let tick = cleaner.run_tick();
    assert!(tick.low_memory);
    assert_eq!(tick.reclaimed, 1);
    assert_eq!(tick.reclaimed_bytes, 64);

    cleaner.low_memory().clear();
    assert!(!cleaner.run_tick().low_memory);
}

#[test]
fn buffer_returned_on_foreign_thread_is_left_to_the_cleaner() {
    let pool = NativeMemoryPool::new(32);
    let buf = pool.rent();
    let item = Arc::clone(buf.item());
    thread::spawn(move || drop(buf)).join().expect("dropper thread");

    assert!(!item.is_in_use());
    assert!(!item.is_disposed());
    let stats = pool.reclaim(0, true);
    assert_eq!(stats.reclaimed, 1);
    assert!(item.is_disposed());
}

#[test]
fn exited_thread_stack_is_pruned() {
    let pool = NativeMemoryPool::new(32);
    {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            drop(pool.rent());
            drop(pool.rent());
        })
        .join()
        .expect("renter thread");
    }
    assert_eq!(pool.thread_stacks(), 1);

    let stats = pool.reclaim(0, false);
    assert_eq!(stats.reclaimed, 0, "exiting thread already freed its buffers");
    assert_eq!(pool.thread_stacks(), 0);
    assert_eq!(pool.tracked_items(), 0);
}

#[test]
fn background_cleaner_stops_with_its_handle() {
    let pool = NativeMemoryPool::new(128);
    let cleaner = NativeMemoryCleaner::new(Duration::from_millis(5), Duration::ZERO);
    cleaner.register(&pool);
    drop(pool.rent());

    let handle = cleaner.start().expect("spawn cleaner");
    let mut waited = 0;
    while pool.tracked_items() > 0 && waited < 400 {
        thread::sleep(Duration::from_millis(5));
        waited += 1;
    }
    handle.stop();
    assert_eq!(pool.tracked_items(), 0);

    drop(pool);
    cleaner.run_tick();
    assert_eq!(cleaner.registered_pools(), 0);
}

#[test]
fn renters_race_a_forcing_cleaner() {
    let pool = NativeMemoryPool::new(512);
    let cleaner = NativeMemoryCleaner::new(HOUR, HOUR);
    cleaner.register(&pool);
    cleaner.low_memory().raise();

    let stop = Arc::new(AtomicBool::new(false));
    let ticker = {
        let cleaner = Arc::clone(&cleaner);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                cleaner.run_tick();
            }
        })
    };

    let renters: Vec<_> = (0..4u8)
        .map(|t| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for i in 0..500u32 {
                    let mut b = pool.rent();
                    assert_eq!(b.len(), 512);
                    assert!(!b.item().is_disposed());
                    b.fill(t);
                    b[(i % 512) as usize] = t.wrapping_add(1);
                    assert!(b.iter().filter(|&&x| x == t).count() >= 511);
                }
            })
        })
        .collect();
    for r in renters {
        r.join().expect("renter thread");
    }
    stop.store(true, Ordering::Relaxed);
    ticker.join().expect("ticker thread");

    cleaner.run_tick();
    assert_eq!(pool.tracked_items(), 0);
}
