//! Cyclic barrier
//!
//! The last fiber to arrive drains the whole cohort and is the only caller
//! that sees `true`, which makes it cheap to elect one fiber for per-round
//! work. The arrival count wraps, so the barrier is immediately reusable;
//! late arrivals for the next round stay parked behind the internal lock
//! until the drain finishes.

use parking_lot::Mutex;

use crate::wait_queue::WaitQueue;

pub struct Barrier {
    arrived: Mutex<usize>,
    total: usize,
    bq: WaitQueue,
}

impl Barrier {
    pub fn new(total: usize) -> Self {
        assert!(total > 0, "barrier for zero participants");
        Barrier { arrived: Mutex::new(0), total, bq: WaitQueue::new() }
    }

    /// Park until `total` fibers have arrived. Returns true for exactly one
    /// caller per round, the one that released the others.
    pub fn wait(&self) -> bool {
        let mut arrived = self.arrived.lock();
        *arrived += 1;
        if *arrived == self.total {
            *arrived = 0;
            // drain under the lock so the next round cannot interleave
            while self.bq.unblock().is_some() {}
            true
        } else {
            let woken = self.bq.block(arrived);
            debug_assert!(woken, "barrier wait resumed by timeout");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_party_barrier_always_releases() {
        let barrier = Barrier::new(1);
        assert!(barrier.wait());
        assert!(barrier.wait());
    }

    #[test]
    #[should_panic(expected = "zero participants")]
    fn zero_party_barrier_rejected() {
        let _ = Barrier::new(0);
    }
}
