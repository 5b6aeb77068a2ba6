//! Deadline queue driving sleeps and timed waits
//!
//! Timers live in a `BTreeMap` keyed by `(deadline, sequence)`, so expiry is
//! a cheap prefix scan and duplicate deadlines stay distinct. The timer lock
//! is the innermost in the crate: expiry claims each fiber's resume token
//! under the timer lock only, then releases it before touching wait-queue
//! locks or resuming anything. The event scope calls [`TimerQueue::check_expiry`]
//! from its poll loop and uses the returned duration as the poll timeout; an
//! insert that becomes the new earliest deadline pokes the poller's waker so
//! the timeout shrinks immediately.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::fiber::{self, Fiber, ResumeMsg};
use crate::stats::{self, RuntimeStats};
use crate::wait_queue::WaitList;

pub(crate) type TimerKey = (Instant, u64);

enum TimerEntry {
    /// Plain sleep; the fiber holds no claim and only the timer resumes it
    Sleep(Arc<Fiber>),
    /// Timed wait racing an explicit unblock through the fiber's claim
    Wait { fiber: Arc<Fiber>, queue: WaitList },
}

struct TimerShared {
    entries: Mutex<BTreeMap<TimerKey, TimerEntry>>,
    next_seq: AtomicU64,
    alarm: Mutex<Option<Arc<mio::Waker>>>,
}

/// Handle for one pending timer entry; cancellation is idempotent.
pub(crate) struct TimerHandle {
    shared: Arc<TimerShared>,
    key: TimerKey,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.shared.entries.lock().remove(&self.key);
    }
}

/// Cloneable handle to the runtime's deadline queue
#[derive(Clone)]
pub(crate) struct TimerQueue {
    shared: Arc<TimerShared>,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue {
            shared: Arc::new(TimerShared {
                entries: Mutex::new(BTreeMap::new()),
                next_seq: AtomicU64::new(0),
                alarm: Mutex::new(None),
            }),
        }
    }

    /// Install the poller waker poked when a new earliest deadline appears.
    pub fn set_alarm(&self, waker: Arc<mio::Waker>) {
        *self.shared.alarm.lock() = Some(waker);
    }

    /// Allocate a key for a future entry. The key is handed to the fiber's
    /// resume claim before the entry itself is inserted, so the claim can
    /// cancel a timer that is not in the map yet (cancel of an absent key is
    /// a no-op).
    pub fn reserve(&self, deadline: Instant) -> TimerKey {
        (deadline, self.shared.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    pub fn handle(&self, key: TimerKey) -> TimerHandle {
        TimerHandle { shared: self.shared.clone(), key }
    }

    /// Insert a timed-wait entry under a previously reserved key.
    pub fn insert_wait(&self, key: TimerKey, fiber: Arc<Fiber>, queue: WaitList) {
        self.insert(key, TimerEntry::Wait { fiber, queue });
    }

    fn insert(&self, key: TimerKey, entry: TimerEntry) {
        let is_earliest = {
            let mut entries = self.shared.entries.lock();
            entries.insert(key, entry);
            *entries.keys().next().expect("just inserted") == key
        };
        if is_earliest {
            if let Some(waker) = self.shared.alarm.lock().as_ref() {
                if let Err(err) = waker.wake() {
                    log::warn!("timer alarm wake failed: {err}");
                }
            }
        }
    }

    /// Park the current fiber for `duration`; blocks the OS thread outside
    /// fiber context.
    pub fn sleep(&self, duration: Duration) {
        let Some(fiber) = fiber::current() else {
            std::thread::sleep(duration);
            return;
        };
        let key = self.reserve(Instant::now() + duration);
        self.insert(key, TimerEntry::Sleep(fiber.clone()));
        let msg = fiber.suspend();
        debug_assert_eq!(msg, ResumeMsg::Wake);
    }

    /// Expire everything due at `now`; returns the wait until the next
    /// deadline, or `None` when the queue is empty. Resumes happen after the
    /// timer lock is released, wait-queue removals after that.
    pub fn check_expiry(&self, now: Instant) -> Option<Duration> {
        let mut sleeps = Vec::new();
        let mut timeouts = Vec::new();
        let next = {
            let mut entries = self.shared.entries.lock();
            while let Some((&key, _)) = entries.first_key_value() {
                if key.0 > now {
                    break;
                }
                match entries.remove(&key).expect("first key present") {
                    TimerEntry::Sleep(fiber) => sleeps.push(fiber),
                    TimerEntry::Wait { fiber, queue } => {
                        // the explicit-unblock path may have won already
                        if fiber.claim_resume().is_some() {
                            timeouts.push((fiber, queue));
                        }
                    }
                }
            }
            entries.first_key_value().map(|(key, _)| key.0 - now)
        };
        for fiber in sleeps {
            fiber.resume(ResumeMsg::Wake);
        }
        for (fiber, queue) in timeouts {
            queue.lock().retain(|f| !Arc::ptr_eq(f, &fiber));
            RuntimeStats::count(&stats::counters().timeouts);
            fiber.resume(ResumeMsg::Timeout);
        }
        next
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }
}
