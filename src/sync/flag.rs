//! One-shot completion flags
//!
//! [`SyncFlag`] is the primitive behind fiber join: at most one waiter, at
//! most one post. It works from both sides of the runtime boundary, parking
//! waiting fibers and blocking plain threads on a condvar. [`Joinable`]
//! layers a result slot on top and backs [`FiberHandle`](crate::fiber::FiberHandle).

use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, ResumeMsg};
use std::sync::Arc;

enum FlagState {
    /// No post and no waiter yet
    Running,
    /// One parked fiber waiting for the post
    Waiting(Arc<Fiber>),
    /// Posted; subsequent waits return immediately
    Posted,
    /// Detached; posts are dropped and waits fail
    Detached,
}

pub struct SyncFlag {
    state: Mutex<FlagState>,
    cond: Condvar, // for waiters that are plain threads
}

impl SyncFlag {
    pub fn new() -> Self {
        SyncFlag { state: Mutex::new(FlagState::Running), cond: Condvar::new() }
    }

    /// Wait for the post. Returns true when posted, false when the flag was
    /// detached instead. At most one waiter is allowed.
    pub fn wait(&self) -> bool {
        match fiber::current() {
            Some(fiber) => {
                {
                    let mut state = self.state.lock();
                    match &*state {
                        FlagState::Posted => return true,
                        FlagState::Detached => return false,
                        FlagState::Waiting(_) => panic!("second waiter on one-shot flag"),
                        FlagState::Running => *state = FlagState::Waiting(fiber.clone()),
                    }
                }
                let msg = fiber.suspend();
                debug_assert_eq!(msg, ResumeMsg::Wake);
                matches!(&*self.state.lock(), FlagState::Posted)
            }
            None => {
                let mut state = self.state.lock();
                loop {
                    match &*state {
                        FlagState::Posted => return true,
                        FlagState::Detached => return false,
                        FlagState::Waiting(_) => panic!("second waiter on one-shot flag"),
                        FlagState::Running => self.cond.wait(&mut state),
                    }
                }
            }
        }
    }

    /// Post the flag, waking the waiter if one is parked. Returns false when
    /// the flag was detached and the post went nowhere. Posting twice is a
    /// protocol violation.
    pub fn post(&self) -> bool {
        let waiter = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, FlagState::Posted) {
                FlagState::Running => {
                    self.cond.notify_one();
                    None
                }
                FlagState::Waiting(fiber) => Some(fiber),
                FlagState::Posted => panic!("one-shot flag posted twice"),
                FlagState::Detached => {
                    *state = FlagState::Detached;
                    return false;
                }
            }
        };
        if let Some(fiber) = waiter {
            fiber.resume(ResumeMsg::Wake);
        }
        true
    }

    /// Abandon the flag: future waits fail, future posts are dropped. A flag
    /// that was already posted stays posted. A parked waiter is released with
    /// a failed wait.
    pub fn detach(&self) {
        let waiter = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, FlagState::Detached) {
                FlagState::Posted => {
                    *state = FlagState::Posted;
                    None
                }
                FlagState::Waiting(fiber) => Some(fiber),
                FlagState::Running | FlagState::Detached => {
                    self.cond.notify_one();
                    None
                }
            }
        };
        if let Some(fiber) = waiter {
            fiber.resume(ResumeMsg::Wake);
        }
    }

    pub fn is_posted(&self) -> bool {
        matches!(&*self.state.lock(), FlagState::Posted)
    }
}

impl Default for SyncFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot flag carrying a fiber's result (or its panic) to `join`.
pub(crate) struct Joinable<T> {
    flag: SyncFlag,
    result: Mutex<Option<thread::Result<T>>>,
}

impl<T: Send + 'static> Joinable<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Joinable { flag: SyncFlag::new(), result: Mutex::new(None) })
    }

    pub fn post(&self, result: thread::Result<T>) {
        *self.result.lock() = Some(result);
        self.flag.post();
    }

    pub fn detach(&self) {
        self.flag.detach();
    }

    pub fn wait(&self) -> Result<T> {
        if !self.flag.wait() {
            return Err(Error::Runtime { reason: "fiber was detached".into() });
        }
        match self.result.lock().take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(_)) => Err(Error::Runtime { reason: "fiber panicked".into() }),
            None => Err(Error::Runtime { reason: "fiber result already taken".into() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_before_wait() {
        let flag = SyncFlag::new();
        assert!(flag.post());
        assert!(flag.is_posted());
        assert!(flag.wait());
    }

    #[test]
    fn detach_drops_post() {
        let flag = SyncFlag::new();
        flag.detach();
        assert!(!flag.post());
        assert!(!flag.wait());
    }

    #[test]
    fn posted_flag_survives_detach() {
        let flag = SyncFlag::new();
        flag.post();
        flag.detach();
        assert!(flag.wait());
    }

    #[test]
    #[should_panic(expected = "posted twice")]
    fn double_post_is_fatal() {
        let flag = SyncFlag::new();
        flag.post();
        flag.post();
    }
}
