mod common;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fibrous::prelude::*;

#[test]
fn semaphore_admits_at_most_two() {
    let rt = common::runtime();
    let sem = Arc::new(Semaphore::new(2));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let sem = sem.clone();
            let active = active.clone();
            let peak = peak.clone();
            rt.spawn(move || {
                sem.p();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                fibrous::sleep(Duration::from_millis(5));
                active.fetch_sub(1, Ordering::SeqCst);
                sem.v();
            })
            .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2, "over-admission: {}", peak.load(Ordering::SeqCst));
    assert_eq!(sem.value(), 2);
}

#[test]
fn semaphore_hands_off_in_arrival_order() {
    let rt = common::runtime();
    let sem = Arc::new(Semaphore::new(0));
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let sem = sem.clone();
            let order = order.clone();
            let handle = rt
                .spawn(move || {
                    sem.p();
                    order.lock().push(i);
                })
                .unwrap();
            // stagger so each waiter parks before the next spawns
            std::thread::sleep(Duration::from_millis(20));
            handle
        })
        .collect();
    for _ in 0..5 {
        sem.v();
        std::thread::sleep(Duration::from_millis(10));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn every_post_wakes_exactly_one_waiter() {
    let rt = common::runtime();
    let sem = Arc::new(Semaphore::new(0));
    let woken = Arc::new(AtomicUsize::new(0));

    let waiters: Vec<_> = (0..16)
        .map(|_| {
            let sem = sem.clone();
            let woken = woken.clone();
            rt.spawn(move || {
                sem.p();
                woken.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();
    std::thread::sleep(Duration::from_millis(50));
    let posters: Vec<_> = (0..4)
        .map(|_| {
            let sem = sem.clone();
            rt.spawn(move || {
                for _ in 0..4 {
                    sem.v();
                    fibrous::yield_now();
                }
            })
            .unwrap()
        })
        .collect();
    for handle in posters {
        handle.join().unwrap();
    }
    for handle in waiters {
        handle.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 16);
    assert_eq!(sem.value(), 0);
}

fn hammer_counter(acquire: impl Fn() + Send + Sync + 'static, release: impl Fn() + Send + Sync + 'static) {
    let rt = common::runtime();
    let acquire = Arc::new(acquire);
    let release = Arc::new(release);
    // the load/store pair is only safe under mutual exclusion
    let counter = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let acquire = acquire.clone();
            let release = release.clone();
            let counter = counter.clone();
            rt.spawn(move || {
                for i in 0..100 {
                    (*acquire)();
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                    (*release)();
                    if i % 16 == 0 {
                        fibrous::yield_now();
                    }
                }
            })
            .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 800);
}

#[test]
fn fifo_mutex_excludes() {
    let mutex = Arc::new(BlockingMutex::fifo());
    let m1 = mutex.clone();
    hammer_counter(move || m1.acquire(), move || mutex.release());
}

#[test]
fn barging_mutex_excludes() {
    let mutex = Arc::new(BlockingMutex::barging());
    let m1 = mutex.clone();
    hammer_counter(move || m1.acquire(), move || mutex.release());
}

#[test]
fn spin_mutex_excludes() {
    let mutex = Arc::new(SpinMutex::new());
    let m1 = mutex.clone();
    hammer_counter(move || m1.acquire(), move || mutex.release());
}

#[test]
fn fifo_mutex_hands_off_in_arrival_order() {
    let rt = common::runtime();
    let mutex = Arc::new(BlockingMutex::fifo());
    let hold = Arc::new(SyncFlag::new());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let holder = {
        let mutex = mutex.clone();
        let hold = hold.clone();
        rt.spawn(move || {
            mutex.acquire();
            hold.wait();
            mutex.release();
        })
        .unwrap()
    };
    std::thread::sleep(Duration::from_millis(30));

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let mutex = mutex.clone();
            let order = order.clone();
            let handle = rt
                .spawn(move || {
                    mutex.acquire();
                    order.lock().push(i);
                    mutex.release();
                })
                .unwrap();
            // stagger so each contender parks before the next spawns
            std::thread::sleep(Duration::from_millis(20));
            handle
        })
        .collect();
    hold.post();
    holder.join().unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn releasing_an_unheld_mutex_is_fatal() {
    let rt = common::runtime();
    let mutex = Arc::new(BlockingMutex::barging());
    let handle = rt.spawn(move || mutex.release()).unwrap();
    assert!(handle.join().is_err(), "unheld release went through");
}

#[test]
#[should_panic(expected = "mutex released outside fiber context")]
fn plain_thread_release_is_fatal() {
    BlockingMutex::fifo().release();
}

#[test]
fn owner_mutex_reenters() {
    let rt = common::runtime();
    let mutex = Arc::new(OwnerMutex::new());
    rt.spawn(move || {
        assert_eq!(mutex.acquire(), 1);
        assert_eq!(mutex.acquire(), 2);
        assert!(mutex.try_acquire());
        assert_eq!(mutex.release(), 2);
        assert_eq!(mutex.release(), 1);
        assert_eq!(mutex.release(), 0);
    })
    .unwrap()
    .join()
    .unwrap();
}

#[test]
fn waiting_writer_blocks_new_readers() {
    let rt = common::runtime();
    let lock = Arc::new(RwLock::new());
    let reader_in = Arc::new(SyncFlag::new());
    let release_reader = Arc::new(SyncFlag::new());

    let first_reader = {
        let lock = lock.clone();
        let reader_in = reader_in.clone();
        let release_reader = release_reader.clone();
        rt.spawn(move || {
            lock.acquire_read();
            reader_in.post();
            release_reader.wait();
            lock.release_read();
        })
        .unwrap()
    };
    reader_in.wait();

    let writer = {
        let lock = lock.clone();
        rt.spawn(move || {
            lock.acquire_write();
            lock.release_write();
        })
        .unwrap()
    };
    // let the writer park behind the active reader
    std::thread::sleep(Duration::from_millis(50));
    assert!(!lock.try_acquire_read(), "reader admitted past a waiting writer");

    release_reader.post();
    first_reader.join().unwrap();
    writer.join().unwrap();
    assert!(lock.try_acquire_read());
    lock.release_read();
}

#[test]
fn barrier_elects_one_releaser_per_round() {
    let rt = common::runtime();
    let barrier = Arc::new(Barrier::new(4));
    let releasers = Arc::new(AtomicUsize::new(0));

    for _round in 0..3 {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                let releasers = releasers.clone();
                rt.spawn(move || {
                    if barrier.wait() {
                        releasers.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
    assert_eq!(releasers.load(Ordering::SeqCst), 3);
}

#[test]
fn condition_moves_items_producer_to_consumer() {
    let rt = common::runtime();
    struct Channel {
        mutex: BlockingMutex,
        nonempty: Condition,
        items: parking_lot::Mutex<VecDeque<u32>>,
        done: AtomicBool,
    }
    let chan = Arc::new(Channel {
        mutex: BlockingMutex::fifo(),
        nonempty: Condition::new(),
        items: parking_lot::Mutex::new(VecDeque::new()),
        done: AtomicBool::new(false),
    });

    let consumer = {
        let chan = chan.clone();
        rt.spawn(move || {
            let mut received = Vec::new();
            loop {
                chan.mutex.acquire();
                while chan.items.lock().is_empty() && !chan.done.load(Ordering::SeqCst) {
                    chan.nonempty.wait(&chan.mutex);
                }
                let item = chan.items.lock().pop_front();
                chan.mutex.release();
                match item {
                    Some(item) => received.push(item),
                    None => break,
                }
            }
            received
        })
        .unwrap()
    };

    let producer = {
        let chan = chan.clone();
        rt.spawn(move || {
            for i in 0..50 {
                chan.mutex.acquire();
                chan.items.lock().push_back(i);
                chan.nonempty.signal();
                chan.mutex.release();
                if i % 10 == 0 {
                    fibrous::yield_now();
                }
            }
            chan.mutex.acquire();
            chan.done.store(true, Ordering::SeqCst);
            chan.nonempty.signal();
            chan.mutex.release();
        })
        .unwrap()
    };

    producer.join().unwrap();
    let received = consumer.join().unwrap();
    assert_eq!(received, (0..50).collect::<Vec<_>>());
}

#[test]
fn flag_join_both_sides_of_post() {
    let rt = common::runtime();
    // wait after post
    let early = rt.spawn(|| 7u32).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(early.join().unwrap(), 7);
    // wait before post
    let late = rt
        .spawn(|| {
            fibrous::sleep(Duration::from_millis(30));
            9u32
        })
        .unwrap();
    assert_eq!(late.join().unwrap(), 9);
}

#[test]
fn detached_fiber_still_runs() {
    let rt = common::runtime();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    rt.spawn(move || flag.store(true, Ordering::SeqCst)).unwrap().detach();
    std::thread::sleep(Duration::from_millis(100));
    assert!(ran.load(Ordering::SeqCst));
}
