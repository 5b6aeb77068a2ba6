//! FIFO wait queues used inside the blocking primitives
//!
//! A `WaitQueue` parks fibers in arrival order and wakes them one at a time.
//! Its own short lock nests strictly inside whichever primitive lock the
//! caller hands in via a [`MutexGuard`], and strictly outside the timer queue
//! lock; that ordering (primitive, then queue, then timers) is what keeps the
//! timeout path deadlock free.
//!
//! Every enqueue first installs the fiber's resume claim, so an expiring
//! timer and an explicit unblock race through `Fiber::claim_resume` rather
//! than through the queue itself. `unblock` skips over entries whose claim
//! was already taken by a timeout; the timer expiry path removes its own
//! entries from the deque before resuming them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::fiber::{self, Fiber, ResumeMsg, WaitClaim};
use crate::runtime;

/// Shared deque of parked fibers; the timer expiry path holds a clone so it
/// can remove timed-out entries without going through the primitive.
pub(crate) type WaitList = Arc<Mutex<VecDeque<Arc<Fiber>>>>;

pub(crate) struct WaitQueue {
    list: WaitList,
}

impl WaitQueue {
    pub fn new() -> Self {
        WaitQueue { list: Arc::new(Mutex::new(VecDeque::new())) }
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Park the current fiber on this queue, releasing `guard` only after the
    /// fiber is enqueued. Returns true on explicit wake.
    pub fn block<T>(&self, guard: MutexGuard<'_, T>) -> bool {
        let fiber = fiber::current().expect("block outside fiber context");
        fiber.install_claim(WaitClaim { timer: None });
        self.list.lock().push_back(fiber.clone());
        drop(guard);
        fiber.suspend() == ResumeMsg::Wake
    }

    /// Timed variant of [`block`](Self::block). A deadline already in the
    /// past fails immediately without enqueueing. Returns false on timeout.
    pub fn block_until<T>(&self, guard: MutexGuard<'_, T>, deadline: Instant) -> bool {
        if deadline <= Instant::now() {
            drop(guard);
            return false;
        }
        let fiber = fiber::current().expect("block outside fiber context");
        let timers = runtime::timers();
        let key = timers.reserve(deadline);
        fiber.install_claim(WaitClaim { timer: Some(timers.handle(key)) });
        self.list.lock().push_back(fiber.clone());
        timers.insert_wait(key, fiber.clone(), self.list.clone());
        drop(guard);
        fiber.suspend() == ResumeMsg::Wake
    }

    /// Wake the oldest waiter whose claim is still unclaimed. Entries lost to
    /// a timeout are discarded in passing; their timer entry is already gone.
    pub fn unblock(&self) -> Option<Arc<Fiber>> {
        loop {
            let fiber = self.list.lock().pop_front()?;
            if let Some(claim) = fiber.claim_resume() {
                if let Some(timer) = claim.timer {
                    timer.cancel();
                }
                fiber.resume(ResumeMsg::Wake);
                return Some(fiber);
            }
        }
    }

    /// Claim the oldest live waiter without resuming it yet. Used for baton
    /// handoffs where the caller publishes ownership before the wake.
    pub fn next_waiter(&self) -> Option<Arc<Fiber>> {
        loop {
            let fiber = self.list.lock().pop_front()?;
            if let Some(claim) = fiber.claim_resume() {
                if let Some(timer) = claim.timer {
                    timer.cancel();
                }
                return Some(fiber);
            }
        }
    }

    /// Wake everyone currently queued.
    pub fn unblock_all(&self) -> usize {
        let mut woken = 0;
        while self.unblock().is_some() {
            woken += 1;
        }
        woken
    }

    /// Drain the queue, resuming leftover waiters with a wake so nothing
    /// stays parked past primitive re-initialization.
    pub fn reset(&self) {
        let drained = self.unblock_all();
        if drained > 0 {
            log::warn!("wait queue reset released {drained} parked fibers");
        }
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        // timed-out entries pending removal are fine; live waiters are not
        let leftover = self.list.lock().len();
        if leftover > 0 {
            log::warn!("wait queue dropped with {leftover} entries still queued");
        }
    }
}
