//! Fiber mutexes in three flavors
//!
//! [`BlockingMutex`] parks contenders immediately and comes in two handoff
//! policies: FIFO, where the releaser installs the oldest waiter as the new
//! owner before waking it, and barging, where woken fibers re-compete with
//! arrivals. [`SpinMutex`] spins with exponential backoff before parking on
//! an internal binary semaphore. [`OwnerMutex`] wraps a FIFO mutex with a
//! recursion count.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::fiber::{self, ResumeMsg};
use crate::sync::Semaphore;
use crate::wait_queue::WaitQueue;

pub struct BlockingMutex {
    fifo: bool,
    owner: Mutex<Option<usize>>,
    bq: WaitQueue,
}

impl BlockingMutex {
    /// FIFO handoff: release passes ownership to the oldest waiter directly.
    pub fn fifo() -> Self {
        BlockingMutex { fifo: true, owner: Mutex::new(None), bq: WaitQueue::new() }
    }

    /// Barging: release frees the lock and wakes one waiter, which then
    /// competes with any fiber arriving in the meantime. Higher throughput,
    /// no ordering guarantee.
    pub fn barging() -> Self {
        BlockingMutex { fifo: false, owner: Mutex::new(None), bq: WaitQueue::new() }
    }

    pub fn acquire(&self) {
        let fiber = fiber::current().expect("mutex acquire outside fiber context");
        loop {
            let mut owner = self.owner.lock();
            match *owner {
                None => {
                    *owner = Some(fiber.id());
                    return;
                }
                Some(id) => {
                    assert_ne!(id, fiber.id(), "recursive acquire of non-recursive mutex");
                    let woken = self.bq.block(owner);
                    debug_assert!(woken, "untimed acquire resumed by timeout");
                    if self.fifo {
                        // releaser already installed us as owner
                        return;
                    }
                }
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        let fiber = fiber::current().expect("mutex acquire outside fiber context");
        let mut owner = self.owner.lock();
        if owner.is_none() {
            *owner = Some(fiber.id());
            true
        } else {
            false
        }
    }

    /// Returns false if the lock could not be taken before the timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let fiber = fiber::current().expect("mutex acquire outside fiber context");
        let deadline = Instant::now() + timeout;
        loop {
            let mut owner = self.owner.lock();
            match *owner {
                None => {
                    *owner = Some(fiber.id());
                    return true;
                }
                Some(id) => {
                    assert_ne!(id, fiber.id(), "recursive acquire of non-recursive mutex");
                    if !self.bq.block_until(owner, deadline) {
                        return false;
                    }
                    if self.fifo {
                        return true;
                    }
                }
            }
        }
    }

    pub fn release(&self) {
        let current = fiber::current().expect("mutex released outside fiber context");
        let mut owner = self.owner.lock();
        assert_eq!(*owner, Some(current.id()), "mutex released by non-owner");
        if self.fifo {
            if let Some(next) = self.bq.next_waiter() {
                *owner = Some(next.id());
                drop(owner);
                next.resume(ResumeMsg::Wake);
                return;
            }
        }
        *owner = None;
        if !self.fifo {
            drop(owner);
            self.bq.unblock();
        }
    }

    /// Whether the calling fiber holds this mutex
    pub fn holds_current(&self) -> bool {
        match fiber::current() {
            Some(fiber) => *self.owner.lock() == Some(fiber.id()),
            None => false,
        }
    }
}

/// Default exponential spin window before a contender parks
const SPIN_START: usize = 4;
const SPIN_END: usize = 4 * 1024;

/// Spin-then-park mutex for short critical sections.
pub struct SpinMutex {
    owner: AtomicUsize, // fiber id, 0 = unlocked
    sem: Semaphore,     // binary; admits one parked contender back to spinning
    spin_start: usize,
    spin_end: usize,
}

impl SpinMutex {
    pub fn new() -> Self {
        Self::with_spin(SPIN_START, SPIN_END)
    }

    /// Custom backoff window; `spin_start` doubles up to `spin_end` before
    /// the contender parks.
    pub fn with_spin(spin_start: usize, spin_end: usize) -> Self {
        assert!(spin_start > 0 && spin_start <= spin_end, "invalid spin window");
        SpinMutex {
            owner: AtomicUsize::new(0),
            sem: Semaphore::binary(false),
            spin_start,
            spin_end,
        }
    }

    pub fn acquire(&self) {
        let fiber = fiber::current().expect("mutex acquire outside fiber context");
        let id = fiber.id();
        let mut spin = self.spin_start;
        loop {
            if self.try_lock(id) {
                return;
            }
            for _ in 0..spin {
                std::hint::spin_loop();
            }
            if spin < self.spin_end {
                spin *= 2;
            } else {
                self.sem.p();
                spin = self.spin_start;
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        let fiber = fiber::current().expect("mutex acquire outside fiber context");
        self.try_lock(fiber.id())
    }

    fn try_lock(&self, id: usize) -> bool {
        self.owner
            .compare_exchange(0, id, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release(&self) {
        assert_eq!(
            Some(self.owner.load(Ordering::Relaxed)),
            fiber::current().map(|f| f.id()),
            "mutex released by non-owner"
        );
        // claim a parked contender before unlocking so its retry can win
        let next = self.sem.v_handoff();
        self.owner.store(0, Ordering::Release);
        if let Some(fiber) = next {
            fiber.resume(ResumeMsg::Wake);
        }
    }
}

impl Default for SpinMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursive mutex: the owner may re-acquire, releases must balance.
pub struct OwnerMutex {
    mutex: BlockingMutex,
    depth: AtomicUsize, // touched only by the owner
}

impl OwnerMutex {
    pub fn new() -> Self {
        OwnerMutex { mutex: BlockingMutex::fifo(), depth: AtomicUsize::new(0) }
    }

    /// Returns the recursion depth after acquiring.
    pub fn acquire(&self) -> usize {
        if !self.mutex.holds_current() {
            self.mutex.acquire();
        }
        self.depth.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn try_acquire(&self) -> bool {
        if self.mutex.holds_current() || self.mutex.try_acquire() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Returns the remaining depth; the lock is free again at zero.
    pub fn release(&self) -> usize {
        assert!(self.mutex.holds_current(), "recursive mutex released by non-owner");
        let depth = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
        if depth == 0 {
            self.mutex.release();
        }
        depth
    }
}

impl Default for OwnerMutex {
    fn default() -> Self {
        Self::new()
    }
}
