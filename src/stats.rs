//! Best-effort runtime counters
//!
//! A single process-wide set of named atomic counters. Incrementing is
//! fire-and-forget and never fails or blocks the caller; readers get a
//! point-in-time snapshot.

use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;

/// Counters maintained by the runtime core
#[derive(Debug, Default)]
pub struct RuntimeStats {
    /// Number of fibers spawned
    pub fibers_spawned: AtomicUsize,
    /// Number of fibers that ran to completion
    pub fibers_completed: AtomicUsize,
    /// Number of physical suspensions (skipped suspends not included)
    pub suspends: AtomicUsize,
    /// Number of resume calls
    pub resumes: AtomicUsize,
    /// Number of timed waits that expired
    pub timeouts: AtomicUsize,
    /// Number of poll invocations
    pub polls: AtomicUsize,
    /// Number of readiness events delivered to fibers
    pub poll_events: AtomicUsize,
    /// Number of cluster quiescence cycles
    pub pauses: AtomicUsize,
}

/// Point-in-time copy of the runtime counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub fibers_spawned: usize,
    pub fibers_completed: usize,
    pub suspends: usize,
    pub resumes: usize,
    pub timeouts: usize,
    pub polls: usize,
    pub poll_events: usize,
    pub pauses: usize,
}

impl RuntimeStats {
    /// Bump a counter by one; best effort, relaxed ordering
    pub fn count(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump a counter by `delta`
    pub fn count_by(counter: &AtomicUsize, delta: usize) {
        counter.fetch_add(delta, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fibers_spawned: self.fibers_spawned.load(Ordering::Relaxed),
            fibers_completed: self.fibers_completed.load(Ordering::Relaxed),
            suspends: self.suspends.load(Ordering::Relaxed),
            resumes: self.resumes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            poll_events: self.poll_events.load(Ordering::Relaxed),
            pauses: self.pauses.load(Ordering::Relaxed),
        }
    }
}

static COUNTERS: Lazy<RuntimeStats> = Lazy::new(RuntimeStats::default);

/// Access the process-wide counter sink
pub fn counters() -> &'static RuntimeStats {
    &COUNTERS
}
