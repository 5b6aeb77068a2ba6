mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fibrous::prelude::*;
use fibrous::{current_worker, migrate_to, TOP_PRIORITY};

#[test]
fn spawn_and_join_many() {
    let rt = common::runtime();
    let handles: Vec<_> = (0..100)
        .map(|i| {
            rt.spawn(move || {
                fibrous::yield_now();
                i as u64
            })
            .unwrap()
        })
        .collect();
    let sum: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(sum, 4950);
}

#[test]
fn join_reports_a_panicked_fiber() {
    let rt = common::runtime();
    let handle = rt.spawn(|| -> u32 { panic!("deliberate") }).unwrap();
    assert!(handle.join().is_err());
}

#[test]
fn heavy_yielding_loses_no_fibers() {
    let rt = common::runtime();
    let done = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..32)
        .map(|_| {
            let done = done.clone();
            rt.spawn(move || {
                for _ in 0..100 {
                    fibrous::yield_now();
                }
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(done.load(Ordering::SeqCst), 32);
}

#[test]
fn quiesce_completes_under_load() {
    let rt = common::runtime();
    let stop = Arc::new(AtomicBool::new(false));
    let yielders: Vec<_> = (0..8)
        .map(|_| {
            let stop = stop.clone();
            rt.spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    fibrous::yield_now();
                }
            })
            .unwrap()
        })
        .collect();

    let pauses_before = fibrous::stats::counters().snapshot().pauses;
    let inner = rt.clone();
    let value = rt
        .spawn(move || inner.quiesce(|| 40 + 2))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(value, 42);
    assert!(fibrous::stats::counters().snapshot().pauses > pauses_before);

    stop.store(true, Ordering::Relaxed);
    for handle in yielders {
        handle.join().unwrap();
    }
}

#[test]
fn add_worker_grows_the_pool() {
    let rt = common::runtime();
    let before = rt.worker_count();
    let worker = rt.add_worker().unwrap();
    assert_eq!(rt.worker_count(), before + 1);
    assert!(rt.workers().iter().any(|w| w.id() == worker.id()));
}

#[test]
fn migration_moves_the_fiber() {
    let rt = common::runtime();
    let workers = rt.workers();
    assert!(workers.len() >= 2);
    let target = workers[1].clone();
    let target_id = target.id();
    rt.spawn(move || {
        assert!(migrate_to(&target));
        assert_eq!(current_worker().map(|w| w.id()), Some(target_id));
    })
    .unwrap()
    .join()
    .unwrap();
}

#[test]
fn affinity_refuses_migration() {
    let rt = common::runtime();
    let workers = rt.workers();
    let home = workers[0].clone();
    let other = workers[1].clone();
    let home_id = home.id();
    let opts = SpawnOptions::new().name("pinned").pinned(home).affinity(true);
    rt.spawn_with(opts, move || {
        assert_eq!(current_worker().map(|w| w.id()), Some(home_id));
        assert!(!migrate_to(&other));
        assert_eq!(current_worker().map(|w| w.id()), Some(home_id));
    })
    .unwrap()
    .join()
    .unwrap();
}

#[test]
fn spawn_options_set_priority() {
    let rt = common::runtime();
    let opts = SpawnOptions::new().name("urgent").priority(TOP_PRIORITY);
    let handle = rt.spawn_with(opts, || ()).unwrap();
    assert_eq!(handle.fiber().priority(), TOP_PRIORITY);
    handle.join().unwrap();
}

#[test]
fn preempt_point_is_harmless_without_a_ticker() {
    let rt = common::runtime();
    rt.spawn(|| {
        for _ in 0..1000 {
            fibrous::preempt_point();
        }
    })
    .unwrap()
    .join()
    .unwrap();
}

#[test]
fn pinned_fiber_starts_on_its_worker() {
    let rt = common::runtime();
    let worker = rt.workers()[0].clone();
    let worker_id = worker.id();
    let opts = SpawnOptions::new().pinned(worker);
    rt.spawn_with(opts, move || {
        assert_eq!(current_worker().map(|w| w.id()), Some(worker_id));
        // stays homed across a suspension
        fibrous::sleep(Duration::from_millis(10));
        assert_eq!(current_worker().map(|w| w.id()), Some(worker_id));
    })
    .unwrap()
    .join()
    .unwrap();
}
