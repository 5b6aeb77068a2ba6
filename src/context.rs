//! Owned execution contexts and the switch baton
//!
//! Every fiber body runs on a dedicated carrier thread that is parked except
//! while the fiber holds a worker's scheduling turn. A context switch is a
//! strict baton handoff: the worker issues a [`Grant`] to wake the carrier,
//! and the carrier answers with exactly one [`Switch`] report per grant when
//! it gives the turn back. At most one carrier per worker is runnable at any
//! time, so fibers multiplexed on one worker never run concurrently.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::scheduler::worker::WorkerShared;

/// Report sent from a fiber back to the worker that granted it the turn
pub(crate) enum Switch {
    /// The fiber is suspending; the worker commits the park transition
    Suspended,
    /// The fiber stays ready; re-enqueue it (optionally on another worker)
    Yielded { target: Option<Arc<WorkerShared>> },
    /// The fiber terminated; its context is gone
    Terminated,
}

/// One scheduling turn, handed from a worker to a fiber's carrier
pub(crate) struct Grant {
    /// Channel the fiber must report back on, exactly once
    pub reply: Sender<Switch>,
    /// Worker currently executing the fiber
    pub worker: Arc<WorkerShared>,
}

/// Per-fiber switch state: the pending grant slot and the reply channel of
/// the grant currently being consumed.
pub(crate) struct Context {
    grant: Mutex<Option<Grant>>,
    granted: Condvar,
    reply: Mutex<Option<Sender<Switch>>>,
    worker: Mutex<Option<Arc<WorkerShared>>>,
}

impl Context {
    pub fn new() -> Self {
        Context {
            grant: Mutex::new(None),
            granted: Condvar::new(),
            reply: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Hand the turn to this context. Called by a worker; the previous grant
    /// must have been consumed (one report per grant).
    pub fn grant(&self, g: Grant) {
        let mut slot = self.grant.lock();
        debug_assert!(slot.is_none(), "context granted twice");
        *slot = Some(g);
        self.granted.notify_one();
    }

    /// Block the carrier thread until the next grant arrives, then record its
    /// reply channel and worker for the duration of the turn.
    pub fn wait_grant(&self) {
        let grant = {
            let mut slot = self.grant.lock();
            while slot.is_none() {
                self.granted.wait(&mut slot);
            }
            slot.take().expect("grant slot emptied while held")
        };
        *self.worker.lock() = Some(grant.worker.clone());
        *self.reply.lock() = Some(grant.reply);
    }

    /// Consume the current grant's reply channel; present iff the fiber holds
    /// a scheduling turn.
    pub fn take_reply(&self) -> Option<Sender<Switch>> {
        self.reply.lock().take()
    }

    /// Worker executing the fiber during the current turn
    pub fn current_worker(&self) -> Option<Arc<WorkerShared>> {
        self.worker.lock().clone()
    }
}

/// Launch a carrier thread for a fiber body. The stack size maps the stack
/// allocator interface onto `thread::Builder`; spawn failure is the resource
/// exhaustion path and is propagated, never retried.
pub(crate) fn launch_carrier(
    name: String,
    stack_size: usize,
    entry: impl FnOnce() + Send + 'static,
) -> Result<()> {
    thread::Builder::new()
        .name(name)
        .stack_size(stack_size)
        .spawn(entry)
        .map(|_| ())
        .map_err(|e| Error::Spawn {
            reason: format!("carrier thread creation failed: {e}"),
        })
}
