//! Condition variable paired with a [`BlockingMutex`]
//!
//! `wait` releases the data mutex only after the caller is protected by the
//! condition's internal lock, so a signal issued between the release and the
//! park cannot be lost. Signaled fibers re-acquire the data mutex before
//! `wait` returns, which means the awaited predicate must be re-checked in a
//! loop as usual.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::sync::BlockingMutex;
use crate::wait_queue::WaitQueue;

pub struct Condition {
    inner: Mutex<()>,
    bq: WaitQueue,
}

impl Condition {
    pub fn new() -> Self {
        Condition { inner: Mutex::new(()), bq: WaitQueue::new() }
    }

    /// Atomically release `mutex` and park; re-acquires `mutex` before
    /// returning. The caller must hold `mutex`.
    pub fn wait(&self, mutex: &BlockingMutex) {
        let inner = self.inner.lock();
        mutex.release();
        let woken = self.bq.block(inner);
        debug_assert!(woken, "untimed condition wait resumed by timeout");
        mutex.acquire();
    }

    /// Timed variant; returns false if the wait expired before a signal. The
    /// mutex is re-acquired either way.
    pub fn wait_timeout(&self, mutex: &BlockingMutex, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let inner = self.inner.lock();
        mutex.release();
        let woken = self.bq.block_until(inner, deadline);
        mutex.acquire();
        woken
    }

    /// Wake the oldest waiter; returns false if nobody was waiting.
    pub fn signal(&self) -> bool {
        let _inner = self.inner.lock();
        self.bq.unblock().is_some()
    }

    /// Wake every current waiter; returns how many were woken.
    pub fn broadcast(&self) -> usize {
        let _inner = self.inner.lock();
        self.bq.unblock_all()
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}
