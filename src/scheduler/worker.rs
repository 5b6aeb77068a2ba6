//! Worker threads
//!
//! Each worker drains its own priority lanes first and falls back to the
//! cluster's shared staging lanes, so pinned work (maintenance fibers
//! included) is never starved by the shared pool. The worker grants a fiber
//! its scheduling turn, waits on the per-worker switch channel for the
//! fiber's reply, and commits any park transition itself: the fiber's
//! run-state decrement happens only after control is back on the worker, so a
//! resume arriving mid-suspend re-enqueues instead of being lost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::context::{Grant, Switch};
use crate::fiber::{Fiber, NUM_PRIORITIES};
use crate::scheduler::cluster::ClusterShared;
use crate::sync::Semaphore;

/// Backstop for the idle wait; covers the rare lost notification
const IDLE_BACKSTOP: Duration = Duration::from_millis(1);

pub(crate) struct WorkerShared {
    id: usize,
    lanes: Mutex<[VecDeque<Arc<Fiber>>; NUM_PRIORITIES]>,
    idle_lock: Mutex<()>,
    idle: Condvar,
    preempt: AtomicBool,
    stopping: AtomicBool,
    switch_tx: Sender<Switch>,
    switch_rx: Receiver<Switch>,
    cluster: Weak<ClusterShared>,
    /// Quiescence handshake: the pinned maintenance fiber parks here
    pub(crate) pause_sem: Semaphore,
    /// Holds the maintenance fiber's carrier thread while paused; because
    /// the fiber never replies for its turn, the worker stays blocked too
    pub(crate) sleep_gate: OsGate,
}

/// Thread-level gate. Unlike the fiber semaphores, waiting here blocks the
/// calling OS thread outright.
pub(crate) struct OsGate {
    permits: Mutex<usize>,
    available: Condvar,
}

impl OsGate {
    fn new() -> Self {
        OsGate { permits: Mutex::new(0), available: Condvar::new() }
    }

    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    pub fn post(&self) {
        *self.permits.lock() += 1;
        self.available.notify_one();
    }
}

impl WorkerShared {
    pub fn new(id: usize, cluster: Weak<ClusterShared>) -> Arc<Self> {
        // one turn outstanding at a time, so capacity one suffices
        let (switch_tx, switch_rx) = channel::bounded(1);
        Arc::new(WorkerShared {
            id,
            lanes: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            preempt: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            switch_tx,
            switch_rx,
            cluster,
            pause_sem: Semaphore::new(0),
            sleep_gate: OsGate::new(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn enqueue(self: &Arc<Self>, fiber: Arc<Fiber>) {
        self.lanes.lock()[fiber.priority()].push_back(fiber);
        let _guard = self.idle_lock.lock();
        self.idle.notify_one();
    }

    pub fn notify(&self) {
        let _guard = self.idle_lock.lock();
        self.idle.notify_one();
    }

    /// Ask the worker's current fiber to yield at its next checkpoint.
    pub fn request_preempt(&self) {
        self.preempt.store(true, Ordering::Relaxed);
    }

    pub fn take_preempt(&self) -> bool {
        self.preempt.swap(false, Ordering::Relaxed)
    }

    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        self.notify();
    }

    /// Highest priority first, own lane before the shared staging lane at
    /// each level, so pinned top-priority work always beats staged work.
    fn next_ready(&self) -> Option<Arc<Fiber>> {
        let cluster = self.cluster.upgrade();
        for priority in 0..NUM_PRIORITIES {
            if let Some(fiber) = self.lanes.lock()[priority].pop_front() {
                return Some(fiber);
            }
            if let Some(fiber) = cluster.as_ref().and_then(|c| c.pop_staging_at(priority)) {
                return Some(fiber);
            }
        }
        None
    }

    fn has_ready(&self) -> bool {
        self.lanes.lock().iter().any(|lane| !lane.is_empty())
            || self.cluster.upgrade().is_some_and(|c| c.has_staged())
    }

    fn idle_wait(&self) {
        let mut guard = self.idle_lock.lock();
        if self.has_ready() || self.stopping() {
            return;
        }
        let _ = self.idle.wait_for(&mut guard, IDLE_BACKSTOP);
    }

    /// Grant one scheduling turn and dispatch on the fiber's reply.
    fn run_fiber(self: &Arc<Self>, fiber: Arc<Fiber>) {
        fiber.ctx.grant(Grant { reply: self.switch_tx.clone(), worker: self.clone() });
        match self.switch_rx.recv().expect("fiber carrier vanished mid-turn") {
            Switch::Suspended => {
                // park commit happens here, off the fiber's context
                if fiber.commit_park() {
                    log::trace!("fiber {} resumed mid-suspend, re-enqueued", fiber.id());
                    fiber.schedule();
                }
            }
            Switch::Yielded { target: Some(target) } => target.enqueue(fiber),
            Switch::Yielded { target: None } => self.enqueue(fiber),
            Switch::Terminated => {}
        }
    }
}

pub(super) fn worker_main(shared: Arc<WorkerShared>) {
    log::debug!("worker {} started", shared.id);
    while !shared.stopping() {
        match shared.next_ready() {
            Some(fiber) => shared.run_fiber(fiber),
            None => shared.idle_wait(),
        }
    }
    log::debug!("worker {} stopped", shared.id);
}

/// Public handle to one worker, used as a migration target.
#[derive(Clone)]
pub struct WorkerHandle {
    pub(crate) shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.shared.id()
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle").field("id", &self.shared.id()).finish()
    }
}
