//! Fibers and the atomic resume/suspend protocol
//!
//! A fiber is the unit the scheduler moves around: an execution context plus
//! a three-valued run state, a resume payload, and a resume-race token. The
//! run-state word is the whole handoff protocol:
//!
//! - 0, parked: not runnable, the context is quiescent
//! - 1, active: running or sitting in a ready lane
//! - 2, resume-pending: a resume arrived while the fiber was still suspending
//!
//! `resume` increments the word; a previous value of 0 makes the resumer
//! responsible for re-enqueueing the fiber, a previous value of 1 cancels the
//! in-flight suspend, and anything else is a fatal double resume. The park
//! transition itself is committed by the worker after control has left the
//! fiber (see `scheduler::worker`), so no resume is ever lost.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::context::{Context, Switch};
use crate::error::Result;
use crate::scheduler::cluster::ClusterShared;
use crate::scheduler::worker::{WorkerHandle, WorkerShared};
use crate::stats::{self, RuntimeStats};
use crate::timer::TimerHandle;
use crate::{context, sync::flag};

/// Highest scheduling priority; maintenance fibers run here
pub const TOP_PRIORITY: usize = 0;
/// Default scheduling priority
pub const DEFAULT_PRIORITY: usize = 1;
/// Lowest scheduling priority
pub const LOW_PRIORITY: usize = 2;
/// Number of priority lanes
pub const NUM_PRIORITIES: usize = 3;

const PARKED: usize = 0;
const ACTIVE: usize = 1;
const RESUME_PENDING: usize = 2;

/// Short spin before committing to a physical suspension; a resume that lands
/// in this window skips the context switch entirely.
const SUSPEND_SPIN: usize = 4;

/// Payload handed from a resumer to the resumed fiber, consumed exactly once
/// when `suspend` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMsg {
    /// Explicit unblock (post, release, readiness event, sleep expiry)
    Wake,
    /// The fiber's timed wait expired
    Timeout,
}

/// Claim ticket arbitrating which of several possible resumers (explicit
/// unblock vs. timer expiry) gets to resume a parked fiber. Installed before
/// the fiber becomes visible in a racing wait structure; taking it is the
/// single exchange that decides the race. The winner inherits the timer
/// handle to cancel, if any.
pub(crate) struct WaitClaim {
    pub timer: Option<TimerHandle>,
}

static NEXT_FIBER_ID: AtomicUsize = AtomicUsize::new(1);

/// A lightweight cooperatively-scheduled execution unit
pub struct Fiber {
    id: usize,
    name: String,
    run_state: AtomicUsize,
    payload: Mutex<ResumeMsg>,
    claim: Mutex<Option<WaitClaim>>,
    priority: AtomicUsize,
    affinity: AtomicBool,
    home: Mutex<Option<Weak<WorkerShared>>>,
    cluster: Weak<ClusterShared>,
    pub(crate) ctx: Context,
}

impl Fiber {
    pub(crate) fn new(
        cluster: &Arc<ClusterShared>,
        name: String,
        priority: usize,
        home: Option<&Arc<WorkerShared>>,
        affinity: bool,
    ) -> Arc<Fiber> {
        assert!(priority < NUM_PRIORITIES, "invalid priority {priority}");
        Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            name,
            run_state: AtomicUsize::new(PARKED),
            payload: Mutex::new(ResumeMsg::Wake),
            claim: Mutex::new(None),
            priority: AtomicUsize::new(priority),
            affinity: AtomicBool::new(affinity),
            home: Mutex::new(home.map(Arc::downgrade)),
            cluster: Arc::downgrade(cluster),
            ctx: Context::new(),
        })
    }

    /// Unique identifier, never zero
    pub fn id(&self) -> usize {
        self.id
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> usize {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: usize) {
        assert!(priority < NUM_PRIORITIES, "invalid priority {priority}");
        self.priority.store(priority, Ordering::Relaxed);
    }

    /// Hard affinity prohibits re-targeting to another worker
    pub fn affinity(&self) -> bool {
        self.affinity.load(Ordering::Relaxed)
    }

    pub fn set_affinity(&self, affinity: bool) {
        self.affinity.store(affinity, Ordering::Relaxed);
    }

    pub(crate) fn home_worker(&self) -> Option<Arc<WorkerShared>> {
        self.home.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_home(&self, worker: Option<&Arc<WorkerShared>>) {
        *self.home.lock() = worker.map(Arc::downgrade);
    }

    /// Prime the context with an entry body and make the fiber ready.
    pub(crate) fn start(
        self: &Arc<Self>,
        stack_size: usize,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<()> {
        let fiber = Arc::clone(self);
        context::launch_carrier(format!("fib-{}-{}", self.id, self.name), stack_size, move || {
            CURRENT.with(|c| *c.borrow_mut() = Some(fiber.clone()));
            fiber.ctx.wait_grant();
            if panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
                log::error!("fiber {} ({}) body panicked", fiber.id, fiber.name);
            }
            fiber.terminate();
        })?;
        RuntimeStats::count(&stats::counters().fibers_spawned);
        self.resume(ResumeMsg::Wake);
        Ok(())
    }

    /// Resume a parked fiber, or cancel its in-flight suspend. Callable from
    /// any thread except the fiber itself. Resuming an active fiber twice is
    /// a fatal protocol violation.
    pub fn resume(self: &Arc<Self>, msg: ResumeMsg) {
        *self.payload.lock() = msg;
        let prev = self.run_state.fetch_add(1, Ordering::SeqCst);
        RuntimeStats::count(&stats::counters().resumes);
        match prev {
            PARKED => {
                log::trace!("fiber {} resume from parked ({msg:?})", self.id);
                self.schedule();
            }
            ACTIVE => {
                // in-flight suspend observes 2 and cancels itself
                log::trace!("fiber {} resume while suspending", self.id);
            }
            other => panic!("double resume of fiber {} (run state {other})", self.id),
        }
    }

    /// Suspend the calling fiber. The caller must already have arranged to be
    /// resumed (wait queue, timer entry, or readiness registration). Returns
    /// the resumer's payload.
    pub(crate) fn suspend(self: &Arc<Self>) -> ResumeMsg {
        debug_assert!(
            current().is_some_and(|f| Arc::ptr_eq(&f, self)),
            "suspend called from outside fiber {}",
            self.id
        );
        disable_preemption();
        for _ in 0..SUSPEND_SPIN {
            if self
                .run_state
                .compare_exchange(RESUME_PENDING, ACTIVE, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                // resumed before we left the context; skip the switch
                enable_preemption();
                return *self.payload.lock();
            }
            std::hint::spin_loop();
        }
        let reply = self
            .ctx
            .take_reply()
            .expect("suspending fiber holds no scheduling turn");
        RuntimeStats::count(&stats::counters().suspends);
        reply
            .send(Switch::Suspended)
            .expect("worker vanished during suspend");
        self.ctx.wait_grant();
        enable_preemption();
        *self.payload.lock()
    }

    /// Give up the rest of the turn while staying ready. Never passes through
    /// the parked state.
    fn yield_internal(self: &Arc<Self>, target: Option<Arc<WorkerShared>>) {
        let reply = self
            .ctx
            .take_reply()
            .expect("yielding fiber holds no scheduling turn");
        reply
            .send(Switch::Yielded { target })
            .expect("worker vanished during yield");
        self.ctx.wait_grant();
    }

    /// Carrier-side final transition: verify protocol invariants, then hand
    /// the turn back for good.
    fn terminate(self: &Arc<Self>) {
        assert_eq!(
            self.run_state.load(Ordering::SeqCst),
            ACTIVE,
            "fiber {} terminating while not active",
            self.id
        );
        assert!(
            self.claim.lock().is_none(),
            "fiber {} terminating with a pending resume claim",
            self.id
        );
        let reply = self
            .ctx
            .take_reply()
            .expect("terminating fiber holds no scheduling turn");
        RuntimeStats::count(&stats::counters().fibers_completed);
        log::trace!("fiber {} ({}) terminated", self.id, self.name);
        let _ = reply.send(Switch::Terminated);
    }

    /// Worker-side park commit, performed after control has left the fiber.
    /// Returns true if a resume raced in and the fiber must be re-enqueued.
    pub(crate) fn commit_park(&self) -> bool {
        let prev = self.run_state.fetch_sub(1, Ordering::SeqCst);
        match prev {
            RESUME_PENDING => true,
            ACTIVE => false,
            other => panic!("fiber {} parking from run state {other}", self.id),
        }
    }

    /// Install the resume-race token. The previous token must already have
    /// been claimed; anything else means the fiber is visible in two racing
    /// structures at once.
    pub(crate) fn install_claim(&self, claim: WaitClaim) {
        let prev = self.claim.lock().replace(claim);
        assert!(prev.is_none(), "fiber {} already holds a resume claim", self.id);
    }

    /// Race for the right to resume this fiber. Exactly one caller observes
    /// `Some`; everyone else must treat the fiber as already claimed.
    pub(crate) fn claim_resume(&self) -> Option<WaitClaim> {
        self.claim.lock().take()
    }

    /// Hand the fiber to its cluster's ready lanes.
    pub(crate) fn schedule(self: &Arc<Self>) {
        match self.cluster.upgrade() {
            Some(cluster) => cluster.schedule(self.clone()),
            None => log::debug!("fiber {} resumed after cluster teardown; dropped", self.id),
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("run_state", &self.run_state.load(Ordering::Relaxed))
            .field("priority", &self.priority())
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static PREEMPT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// The fiber executing on this thread, if any
pub fn current() -> Option<Arc<Fiber>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Voluntarily give up the rest of the current scheduling turn. Falls back to
/// an OS-thread yield outside fiber context.
pub fn yield_now() {
    match current() {
        Some(fiber) => fiber.yield_internal(None),
        None => std::thread::yield_now(),
    }
}

/// The worker currently executing this fiber's turn; `None` outside fiber
/// context.
pub fn current_worker() -> Option<WorkerHandle> {
    let fiber = current()?;
    fiber.ctx.current_worker().map(|shared| WorkerHandle { shared })
}

/// Re-target the current fiber to another worker. Returns false outside fiber
/// context or when the fiber carries hard affinity.
pub fn migrate_to(worker: &WorkerHandle) -> bool {
    let Some(fiber) = current() else { return false };
    if fiber.affinity() {
        log::warn!("fiber {} has hard affinity; migration refused", fiber.id());
        return false;
    }
    fiber.set_home(Some(&worker.shared));
    fiber.yield_internal(Some(worker.shared.clone()));
    true
}

/// Cooperative preemption check point: yields if the current worker has a
/// pending preemption request and preemption is not disabled. No-op outside
/// fiber context.
pub fn preempt_point() {
    if PREEMPT_DEPTH.with(Cell::get) != 0 {
        return;
    }
    let Some(fiber) = current() else { return };
    if let Some(worker) = fiber.ctx.current_worker() {
        if worker.take_preempt() {
            fiber.yield_internal(None);
        }
    }
}

/// Suppress preemption checks on this thread; paired with
/// [`enable_preemption`] around every suspension.
pub(crate) fn disable_preemption() {
    PREEMPT_DEPTH.with(|d| d.set(d.get() + 1));
}

pub(crate) fn enable_preemption() {
    PREEMPT_DEPTH.with(|d| {
        debug_assert!(d.get() > 0, "unbalanced preemption enable");
        d.set(d.get() - 1);
    });
}

/// Handle used to join a fiber and retrieve its result. Works both from
/// fibers (suspends) and from plain threads (blocks on a condvar).
pub struct FiberHandle<T> {
    flag: Arc<flag::Joinable<T>>,
    fiber: Arc<Fiber>,
}

impl<T: Send + 'static> FiberHandle<T> {
    pub(crate) fn new(flag: Arc<flag::Joinable<T>>, fiber: Arc<Fiber>) -> Self {
        FiberHandle { flag, fiber }
    }

    /// Wait for the fiber to complete and take its result. Returns an error
    /// if the fiber panicked or was detached.
    pub fn join(self) -> Result<T> {
        self.flag.wait()
    }

    /// Abandon the result; the fiber keeps running to completion.
    pub fn detach(self) {
        self.flag.detach();
    }

    /// The underlying fiber, e.g. for priority or affinity adjustments
    pub fn fiber(&self) -> &Arc<Fiber> {
        &self.fiber
    }
}
