//! Counting and binary semaphores with baton-passing release
//!
//! `v` hands the permit straight to the oldest waiter when one exists and
//! only increments the counter when nobody is queued, so a fiber that was
//! already waiting can never be overtaken by a late arrival. In binary mode
//! the counter saturates at one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::fiber::{self, Fiber};
use crate::wait_queue::WaitQueue;

struct State {
    counter: isize,
}

pub struct Semaphore {
    inner: Mutex<State>,
    bq: WaitQueue,
    binary: bool,
}

impl Semaphore {
    /// Counting semaphore with `initial` permits
    pub fn new(initial: isize) -> Self {
        assert!(initial >= 0, "negative initial semaphore value");
        Semaphore { inner: Mutex::new(State { counter: initial }), bq: WaitQueue::new(), binary: false }
    }

    /// Binary semaphore; the counter never exceeds one
    pub fn binary(initial: bool) -> Self {
        Semaphore {
            inner: Mutex::new(State { counter: initial as isize }),
            bq: WaitQueue::new(),
            binary: true,
        }
    }

    /// Current permit count; racy by nature, useful for diagnostics only
    pub fn value(&self) -> isize {
        self.inner.lock().counter
    }

    /// Acquire a permit, parking the calling fiber while none is available.
    pub fn p(&self) {
        let mut inner = self.inner.lock();
        if inner.counter > 0 {
            inner.counter -= 1;
            return;
        }
        let woken = self.bq.block(inner);
        debug_assert!(woken, "untimed P resumed by timeout");
    }

    /// Acquire a permit, yielding once first so a tight P/V loop does not
    /// starve the rest of the lane.
    pub fn p_yield(&self) {
        fiber::yield_now();
        self.p();
    }

    /// Take a permit if one is immediately available.
    pub fn try_p(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.counter > 0 {
            inner.counter -= 1;
            true
        } else {
            false
        }
    }

    /// Acquire with a timeout. Returns false if the permit did not arrive in
    /// time; a handed-off permit is never both granted and timed out.
    pub fn p_timeout(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.counter > 0 {
            inner.counter -= 1;
            return true;
        }
        self.bq.block_until(inner, Instant::now() + timeout)
    }

    /// Release one permit.
    pub fn v(&self) {
        let inner = self.inner.lock();
        if let Some(fiber) = self.bq.next_waiter() {
            drop(inner);
            // the permit travels with the wake; the counter stays untouched
            fiber.resume(fiber::ResumeMsg::Wake);
            return;
        }
        let mut inner = inner;
        if self.binary {
            inner.counter = 1;
        } else {
            inner.counter += 1;
        }
    }

    /// Release returning the claimed waiter instead of resuming it, so the
    /// caller can publish state (e.g. lock ownership) before the wake.
    pub(crate) fn v_handoff(&self) -> Option<Arc<Fiber>> {
        let mut inner = self.inner.lock();
        if let Some(fiber) = self.bq.next_waiter() {
            return Some(fiber);
        }
        if self.binary {
            inner.counter = 1;
        } else {
            inner.counter += 1;
        }
        None
    }

    /// Reset to `initial` permits, releasing any parked waiters.
    pub fn reinit(&self, initial: isize) {
        assert!(initial >= 0, "negative initial semaphore value");
        let mut inner = self.inner.lock();
        inner.counter = if self.binary { (initial > 0) as isize } else { initial };
        self.bq.reset();
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.bq.reset();
    }
}
