//! Cluster: worker membership, shared staging lanes, and quiescence
//!
//! Unpinned fibers are staged in cluster-wide priority lanes that every
//! worker drains; pinned fibers go straight to their home worker. Quiescence
//! ("pause the world except me") rides on ordinary fibers: each worker owns a
//! top-priority maintenance fiber pinned to it, parked on the worker's own
//! pause semaphore. A pauser posts every target's pause semaphore once,
//! collects one confirmation per target, and each maintenance fiber then
//! blocks its carrier thread on the worker's sleep gate without ending its
//! turn, holding the worker until resume. Per-worker gates mean a worker can
//! never swallow a credit meant for another one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, NUM_PRIORITIES, TOP_PRIORITY};
use crate::scheduler::worker::{self, WorkerHandle, WorkerShared};
use crate::stats::{self, RuntimeStats};
use crate::sync::Semaphore;

pub(crate) struct ClusterShared {
    staging: Mutex<[VecDeque<Arc<Fiber>>; NUM_PRIORITIES]>,
    workers: Mutex<Vec<Arc<WorkerShared>>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    next_worker_id: AtomicUsize,
    stack_size: usize,
    /// Membership freeze: true while a pause is in progress
    frozen: Mutex<bool>,
    unfrozen: Condvar,
    /// Serializes pausers
    quiesce_sem: Semaphore,
    /// One confirmation per paused worker
    confirm_sem: Semaphore,
    paused: Mutex<Vec<Arc<WorkerShared>>>,
    stopping: AtomicBool,
}

impl ClusterShared {
    pub fn new(stack_size: usize) -> Arc<Self> {
        Arc::new(ClusterShared {
            staging: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            workers: Mutex::new(Vec::new()),
            joins: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
            stack_size,
            frozen: Mutex::new(false),
            unfrozen: Condvar::new(),
            quiesce_sem: Semaphore::new(1),
            confirm_sem: Semaphore::new(0),
            paused: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    /// Stage a ready fiber: home worker if pinned, shared lanes otherwise.
    pub fn schedule(&self, fiber: Arc<Fiber>) {
        if let Some(home) = fiber.home_worker() {
            home.enqueue(fiber);
            return;
        }
        self.staging.lock()[fiber.priority()].push_back(fiber);
        for worker in self.workers.lock().iter() {
            worker.notify();
        }
    }

    pub fn pop_staging_at(&self, priority: usize) -> Option<Arc<Fiber>> {
        self.staging.lock()[priority].pop_front()
    }

    pub fn has_staged(&self) -> bool {
        self.staging.lock().iter().any(|lane| !lane.is_empty())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn worker_handles(&self) -> Vec<WorkerHandle> {
        self.workers.lock().iter().map(|shared| WorkerHandle { shared: shared.clone() }).collect()
    }

    /// Start one more worker, its OS thread, and its pinned maintenance
    /// fiber. Blocks while a pause holds the membership frozen.
    pub fn add_worker(self: &Arc<Self>) -> Result<WorkerHandle> {
        let mut frozen = self.frozen.lock();
        while *frozen {
            self.unfrozen.wait(&mut frozen);
        }
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let shared = WorkerShared::new(id, Arc::downgrade(self));
        let thread = thread::Builder::new()
            .name(format!("fibrous-worker-{id}"))
            .spawn({
                let shared = shared.clone();
                move || worker::worker_main(shared)
            })
            .map_err(|err| Error::Spawn { reason: format!("worker thread: {err}") })?;
        self.workers.lock().push(shared.clone());
        self.joins.lock().push(thread);
        self.start_maintenance(&shared)?;
        log::debug!("cluster grew to {} workers", self.worker_count());
        Ok(WorkerHandle { shared })
    }

    fn start_maintenance(self: &Arc<Self>, shared: &Arc<WorkerShared>) -> Result<()> {
        let fiber = Fiber::new(
            self,
            format!("maintenance-{}", shared.id()),
            TOP_PRIORITY,
            Some(shared),
            true,
        );
        let cluster = Arc::downgrade(self);
        let worker = shared.clone();
        fiber.start(
            self.stack_size,
            Box::new(move || loop {
                worker.pause_sem.p();
                let Some(cluster) = cluster.upgrade() else { break };
                if cluster.stopping() {
                    break;
                }
                cluster.confirm_sem.v();
                drop(cluster);
                // block the carrier thread without replying for the turn,
                // which holds the worker until the cluster resumes
                worker.sleep_gate.wait();
            }),
        )
    }

    /// Park every worker except the caller's. Must run in fiber context.
    /// Returns once all targets have confirmed.
    pub fn pause(&self) {
        self.quiesce_sem.p();
        let targets = {
            let mut frozen = self.frozen.lock();
            *frozen = true;
            let caller = fiber::current().and_then(|f| f.ctx.current_worker());
            self.workers
                .lock()
                .iter()
                .filter(|w| !caller.as_ref().is_some_and(|c| Arc::ptr_eq(w, c)))
                .cloned()
                .collect::<Vec<_>>()
        };
        for worker in &targets {
            worker.pause_sem.v();
        }
        for _ in &targets {
            self.confirm_sem.p();
        }
        RuntimeStats::count(&stats::counters().pauses);
        log::debug!("cluster paused {} workers", targets.len());
        *self.paused.lock() = targets;
    }

    /// Undo a [`pause`](Self::pause) and release the quiescence turn.
    pub fn resume(&self) {
        let paused = std::mem::take(&mut *self.paused.lock());
        for worker in &paused {
            worker.sleep_gate.post();
        }
        {
            let mut frozen = self.frozen.lock();
            *frozen = false;
            self.unfrozen.notify_all();
        }
        log::debug!("cluster resumed {} workers", paused.len());
        self.quiesce_sem.v();
    }

    /// Run `f` while every other worker is quiesced.
    pub fn quiesce<T>(&self, f: impl FnOnce() -> T) -> T {
        self.pause();
        let result = f();
        self.resume();
        result
    }

    /// Periodically raise the preemption flag on every worker.
    pub fn start_preempt_ticker(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let fiber = Fiber::new(self, "preempt-ticker".into(), TOP_PRIORITY, None, false);
        let cluster = Arc::downgrade(self);
        fiber.start(
            self.stack_size,
            Box::new(move || loop {
                crate::runtime::sleep(interval);
                let Some(cluster) = cluster.upgrade() else { break };
                if cluster.stopping() {
                    break;
                }
                for worker in cluster.workers.lock().iter() {
                    worker.request_preempt();
                }
            }),
        )
    }

    /// Stop workers and join their threads. Fibers parked in primitives keep
    /// their carrier threads; those threads end with the process.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        if !self.paused.lock().is_empty() {
            self.resume();
        }
        // release maintenance fibers so they observe the stop and terminate
        let workers = self.workers.lock().clone();
        for worker in &workers {
            worker.pause_sem.v();
        }
        thread::sleep(Duration::from_millis(10));
        for worker in &workers {
            worker.stop();
        }
        for join in self.joins.lock().drain(..) {
            if join.join().is_err() {
                log::error!("worker thread panicked during shutdown");
            }
        }
        log::debug!("cluster shut down");
    }
}
